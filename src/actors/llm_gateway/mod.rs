//! LLM gateway internals: request building and stream handling.

pub mod request_builder;
pub mod stream;

pub use request_builder::{build_request_body, model_for_purpose, select_endpoint, ResolvedEndpoint};
pub use stream::{extract_stream_text, normalize_content, StreamingToolCalls};
