use std::sync::Arc;

use clap::Parser;
use relay_queue::JobRegistry;
use relay_worker::{init_tracing, serve, Args};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let args = Args::parse();
    init_tracing(args.log_format);

    // Job types live in the application; register them here before serving.
    let registry = JobRegistry::new();

    serve(args, Arc::new(registry)).await
}
