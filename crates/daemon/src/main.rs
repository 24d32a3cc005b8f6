#![forbid(unsafe_code)]

mod clipboard;
mod handlers;
mod process;
mod server;
mod timers;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, bail};
use stashd_core::Settings;

use crate::clipboard::SystemClipboard;

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .compact()
        .init();

    let data_dir = parse_args(std::env::args().skip(1).collect())?;
    let settings = Settings::load(data_dir)?;
    server::run(settings, Arc::new(SystemClipboard)).await
}

fn parse_args(args: Vec<String>) -> Result<Option<PathBuf>> {
    let mut data_dir: Option<PathBuf> = None;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--data-dir" => {
                i += 1;
                if i >= args.len() {
                    bail!("missing value for --data-dir");
                }
                data_dir = Some(PathBuf::from(&args[i]));
            }
            other => bail!("unknown argument '{other}' (usage: stashd [--data-dir <dir>])"),
        }
        i += 1;
    }

    Ok(data_dir)
}
