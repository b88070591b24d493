use clap::Parser;

use easysql::actors::llm_gateway_actor::LlmBackend;
use easysql::app_state::start_engine;
use easysql::cli::{run_command, Cli};
use easysql::embeddings::{EmbeddingService, SharedEmbeddingProvider};
use easysql::service::QueryService;
use easysql::settings::AppSettings;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    easysql::set_verbose_logging(cli.verbose);

    let settings = AppSettings::load().await;
    if settings.verbose_logging {
        easysql::set_verbose_logging(true);
    }

    // The embedding model loads in the background; commands that need it
    // before it is ready report the initialization error.
    let provider: SharedEmbeddingProvider = Default::default();
    EmbeddingService::spawn_model_load(provider.clone());

    let (handles, store) = match start_engine(settings, LlmBackend::Http, provider).await {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("Failed to start engine: {}", e);
            std::process::exit(1);
        }
    };

    let service = QueryService::new(handles, store);

    if let Err(e) = run_command(cli.command, &service).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
