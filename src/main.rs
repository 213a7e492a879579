//! MySQL stdio server
//!
//! A tool backend that exposes a handful of MySQL operations (query, list
//! tables, describe table, list/use database, status) to an orchestrating
//! agent. Requests and responses are single-line JSON objects on stdin and
//! stdout; diagnostics go to stderr.

mod config;
mod db;
mod error;
mod rpc;
mod server;

use clap::Parser;
use config::Config;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // stdout carries protocol lines only, so logs stay on stderr
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::parse();
    server::run(config).await?;

    // A pending blocking read on stdin would otherwise hold up runtime shutdown.
    std::process::exit(0);
}
