#[macro_use]
// 启用tracing宏，允许在代码中使用如info!、warn!等日志宏
extern crate tracing;

use std::env;
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use surface_commit::cli::{Cli, Sub};
use surface_commit::config::Config;
use surface_commit::replay::{self, Script};
use surface_commit::utils::{expand_home, version};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "surface_commit=debug";

fn main() -> anyhow::Result<()> {
    // 日志过滤：优先 RUST_LOG
    let directives = env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_owned());
    let env_filter = EnvFilter::builder().parse_lossy(directives);
    tracing_subscriber::fmt()
        .compact()
        .with_writer(io::stderr)
        .with_env_filter(env_filter)
        .init();

    let cli = Cli::parse();

    match cli.subcommand {
        Sub::Validate { config } => {
            Config::load_or_default(resolve(config)?)?;
            info!("config is valid");
        }
        Sub::Replay { script, config } => {
            info!("starting version {}", &version());

            let config = Config::load_or_default(resolve(config)?)?;
            let path = resolve(Some(script))?.context("missing script path")?;
            let script = Script::load(&path)?;

            let transcript = replay::run(script, config)?;
            let mut stdout = io::stdout().lock();
            for line in transcript {
                writeln!(stdout, "{line}")?;
            }
        }
    }

    Ok(())
}

// 展开 `~`
fn resolve(path: Option<PathBuf>) -> anyhow::Result<Option<PathBuf>> {
    let Some(path) = path else {
        return Ok(None);
    };
    Ok(Some(expand_home(&path)?.unwrap_or(path)))
}
