mod backend;
mod cli;
mod config;

use std::path::Path;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use strongbox_core::Service;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::{Command, ConfigCommand};

const HEALTH_CHECK_KEY: &str = "strongbox-health-check";

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = cli::Cli::parse();
    match cli.command {
        Command::Version => print_version(),
        Command::Config(ConfigCommand::Init) => init_config(cli.config.as_deref())?,
        command => {
            let config = config::load(cli.config.as_deref())?;
            let store = backend::build(backend::Backend::resolve(&config)?).await?;
            run(command, store.as_ref()).await?;
        }
    }

    Ok(())
}

fn init_tracing() {
    // stdout carries secret values for `get`; diagnostics go to stderr.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn print_version() {
    println!("strongbox {}", env!("CARGO_PKG_VERSION"));
}

async fn run(command: Command, store: &dyn Service) -> Result<()> {
    match command {
        Command::Get { key } => {
            let value = store.get(&key).await?;
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&value).await?;
            stdout.flush().await?;
        }
        Command::Set { key, value } => {
            let value = match value {
                Some(value) => value.into_bytes(),
                None => {
                    let mut buf = Vec::new();
                    tokio::io::stdin().read_to_end(&mut buf).await?;
                    buf
                }
            };
            store.set(&key, &value).await?;
        }
        Command::Delete { key } => store.delete(&key).await?,
        Command::List { prefix } => {
            for key in store.list(&prefix).await? {
                println!("{key}");
            }
        }
        Command::Health => {
            run_store_health(store).await?;
            println!("Storage: ok");
        }
        Command::Version | Command::Config(_) => {
            return Err(eyre!("command does not operate on a store"));
        }
    }
    Ok(())
}

/// Write, read back and delete a scratch key.
async fn run_store_health(store: &dyn Service) -> Result<()> {
    let payload = b"ok";
    store.set(HEALTH_CHECK_KEY, payload).await?;
    let round_trip = store.get(HEALTH_CHECK_KEY).await?;
    store.delete(HEALTH_CHECK_KEY).await?;

    if round_trip != payload {
        return Err(eyre!("storage round-trip through {} failed", store.name()));
    }
    Ok(())
}

fn init_config(path: Option<&Path>) -> Result<()> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => config::default_path()?,
    };
    let path = config::write_if_missing(&config::Config::starter()?, &path)?;
    println!("Config initialized at {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use strongbox_core::MemoryService;
    use strongbox_storage::FileService;

    #[tokio::test]
    async fn health_check_leaves_no_key_behind() {
        let store = MemoryService::new();
        run_store_health(&store).await.expect("health");
        assert!(store.list("").await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn health_check_runs_against_file_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileService::new(dir.path()).expect("file store");
        run_store_health(&store).await.expect("health");
        assert!(!store.exists(HEALTH_CHECK_KEY).await.expect("exists"));
    }

    #[tokio::test]
    async fn set_then_list_through_dispatch() {
        let store = MemoryService::new();
        run(
            Command::Set {
                key: "vault-unseal-0".into(),
                value: Some("share".into()),
            },
            &store,
        )
        .await
        .expect("set");
        assert_eq!(store.get("vault-unseal-0").await.expect("get"), b"share");

        run(
            Command::Delete {
                key: "vault-unseal-0".into(),
            },
            &store,
        )
        .await
        .expect("delete");
        assert!(store.list("vault-").await.expect("list").is_empty());
    }

    #[test]
    fn config_init_does_not_clobber_existing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "mode = \"dev\"\n").expect("seed");
        init_config(Some(&path)).expect("init");
        assert_eq!(
            std::fs::read_to_string(&path).expect("read"),
            "mode = \"dev\"\n"
        );
    }
}
