//! OCR gateway - tesseract extraction behind an HTTP API and a CLI, with
//! chunked uploads, bounded batch processing and optional LLM post-processing.

mod api;
mod batch;
mod cli;
mod config;
mod error;
mod extractor;
mod files;
mod llm;
mod ocr;
mod openrouter;
mod upload;

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cli::Cli;
use config::Settings;

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Logs go to stderr so CLI output on stdout stays machine-readable.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ocr_gateway=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env();

    match cli::run(cli, settings).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
