//! Command line front end
//!
//! Runs one session on the local engine, submits a single operation,
//! prints its outcome and destroys the session.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, LevelFilter};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::SessionConfig;
use crate::native::{BundledPlugin, LibraryRegistry, LocalEngine};
use crate::operations::{OperationHandle, Outcome};
use crate::session::{Session, SessionManager};

/// logbridge - cancelable operations on a native log engine
#[derive(Parser, Debug)]
#[command(name = "logbridge")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (default: ~/.logbridge/config.toml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// External library path served by the bundled plugin
    #[arg(long)]
    pub lib: Option<String>,

    /// Verbose logging and engine debug mode
    #[arg(long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Sleep inside the engine
    Sleep {
        /// Duration in milliseconds
        ms: u64,

        /// Cancel the operation after this many milliseconds
        #[arg(long)]
        cancel_after: Option<u64>,
    },

    /// Compute a + b after a short delay
    Sum {
        a: i64,
        b: i64,

        /// De-duplication sequence
        #[arg(long)]
        sequence: Option<u64>,

        #[arg(long)]
        cancel_after: Option<u64>,
    },

    /// Call `sum` and `find` of the external library
    External {
        a: u64,
        b: u64,

        /// Lines searched by `find`
        lines: Vec<String>,

        #[arg(long)]
        cancel_after: Option<u64>,
    },

    /// Print operation statistics of the engine
    Stat,
}

/// Parse arguments, init logging and run on a fresh tokio runtime
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logger(cli.debug);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Fail to start tokio runtime")?;
    runtime.block_on(execute(cli))
}

fn init_logger(debug: bool) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if debug {
        builder.filter_level(LevelFilter::Debug);
    }
    builder.init();
}

pub async fn execute(cli: Cli) -> Result<()> {
    let mut config =
        SessionConfig::resolve(cli.config.as_deref()).context("Fail to load configuration")?;
    if let Some(lib) = cli.lib {
        config.external_lib_path = Some(lib);
    }
    if cli.debug {
        config.debug = true;
    }

    let libraries = LibraryRegistry::new();
    if let Some(path) = &config.external_lib_path {
        libraries.register(path.clone(), Arc::new(BundledPlugin));
    }

    let manager = SessionManager::new(config);
    let session = manager
        .create_session(Arc::new(LocalEngine::new(Arc::new(libraries))))
        .await
        .context("Fail to create session")?;
    manager.set_active(session.uuid())?;

    let result = dispatch(&session, cli.command).await;
    manager.shutdown_all().await;
    result
}

async fn dispatch(session: &Session, command: Command) -> Result<()> {
    match command {
        Command::Sleep { ms, cancel_after } => {
            let handle = session.sleep(ms);
            report(handle, cancel_after).await
        }
        Command::Sum {
            a,
            b,
            sequence,
            cancel_after,
        } => {
            let handle = session.delayed_sum(a, b, sequence);
            report(handle, cancel_after).await
        }
        Command::External {
            a,
            b,
            lines,
            cancel_after,
        } => {
            let handle = session.external_call_lib_default(a, b, lines);
            report(handle, cancel_after).await
        }
        Command::Stat => {
            let stats = session.operations_stat().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
    }
}

async fn report<T>(handle: OperationHandle<T>, cancel_after: Option<u64>) -> Result<()>
where
    T: Serialize + Clone + Send + 'static,
{
    if let Some(ms) = cancel_after {
        let handle = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            info!("Canceling \"{}\" ({})", handle.alias(), handle.id());
            handle.cancel();
        });
    }

    match handle.await {
        Outcome::Done(value) => {
            println!("{}", serde_json::to_string(&value)?);
            Ok(())
        }
        Outcome::Canceled => {
            println!("canceled");
            Ok(())
        }
        Outcome::Error(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arguments() {
        let cli = Cli::try_parse_from([
            "logbridge",
            "--lib",
            "/opt/libplugin.so",
            "sum",
            "50",
            "50",
            "--sequence",
            "0",
            "--cancel-after",
            "10",
        ])
        .unwrap();
        assert_eq!(cli.lib.as_deref(), Some("/opt/libplugin.so"));
        match cli.command {
            Command::Sum {
                a,
                b,
                sequence,
                cancel_after,
            } => {
                assert_eq!((a, b), (50, 50));
                assert_eq!(sequence, Some(0));
                assert_eq!(cancel_after, Some(10));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_external_lines() {
        let cli = Cli::try_parse_from(["logbridge", "external", "2", "6", "one", "two"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::External { ref lines, .. } if lines.len() == 2
        ));
    }

    #[tokio::test]
    async fn test_execute_sum() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::try_parse_from([
            "logbridge",
            "--config",
            dir.path().join("config.toml").to_str().unwrap(),
            "sum",
            "1",
            "2",
        ])
        .unwrap();
        execute(cli).await.unwrap();
    }
}
