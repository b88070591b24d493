//! Actor modules. Each store and external collaborator runs as a message
//! loop over an mpsc channel; requests carry a oneshot reply channel.

pub mod code_vector_actor;
pub mod few_shot_actor;
pub mod graph_store_actor;
pub mod lance;
pub mod llm_gateway;
pub mod llm_gateway_actor;
pub mod schema_vector_actor;
pub mod sql_executor_actor;
