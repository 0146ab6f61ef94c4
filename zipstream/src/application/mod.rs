pub mod handlers;

use crate::presentation::cli::{Cli, Commands};
use clap::Parser;
use zipstream_core::error::Result;

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve {
            pipeline,
            bind,
            index,
        } => {
            handlers::init_tracing(&pipeline.log_level);
            let config = zipstream_core::Config {
                bind,
                index_page: index,
                ..pipeline.to_config()
            };
            handlers::handle_serve(config).await
        }
        Commands::Archive { id, out, pipeline } => {
            handlers::init_tracing(&pipeline.log_level);
            handlers::handle_archive(pipeline.to_config(), id, out).await
        }
    }
}
