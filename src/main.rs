mod cancel;
mod circle;
mod cli;
mod config;
mod error;
mod git;
mod notify;
mod output;
mod wait;

use anyhow::Result;
use clap::Parser;
use cli::Cli;
use log::info;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let (handle, token) = cancel::cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            handle.cancel();
        }
    });
    cli.execute(token).await
}
