//! inboxctl - command line host for the inbox pipeline
//!
//! Wires configuration, storage bindings and the notification publisher
//! together and exposes ingestion and the read API as subcommands.

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use log::{error, info};

use inbox::api::{self, ApiResponse, DeleteRequest, NotifyRequest};
use inbox::{
    Bindings, ChangeStream, CloudflareClient, FallbackRouter, HeedMessageStore, InboxConfig,
    Ingestor, manual_publisher_from_config, publisher_from_config,
};

#[derive(Parser)]
#[command(name = "inboxctl", version, about = "Disposable inbox ingestion and retrieval")]
struct Cli {
    /// Config file (defaults to inbox.json in the config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Keep SQLite and LMDB stores in the data directory unless paths are configured
    #[arg(long, global = true)]
    local: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest one raw MIME message
    Ingest {
        /// Read the message from a file instead of stdin
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Print the inbox of an address as JSON
    List { email: String },
    /// Soft-delete a message
    Delete { email: String, id: String },
    /// Stream inbox changes as Server-Sent Events
    Watch {
        email: String,
        /// Stop after this many events
        #[arg(long)]
        count: Option<usize>,
    },
    /// Publish a manual notification
    Notify {
        email: String,
        #[arg(long)]
        message: Option<String>,
    },
    /// Remove expired entries from the local key/value store
    Purge,
    /// Print recent Email Routing events of the configured zone
    Logs {
        /// How far back to look
        #[arg(long, default_value_t = 24)]
        hours: u32,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    if let Err(e) = config::init() {
        error!("Failed to initialize config directory: {}", e);
    }

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<InboxConfig> {
    match path {
        Some(path) => InboxConfig::from_file(path),
        None => InboxConfig::load(),
    }
}

/// Print a handler response; non-2xx becomes a failing exit code
fn emit(response: &ApiResponse) -> Result<i32> {
    let body = serde_json::to_string_pretty(&response.body).context("Failed to encode response")?;
    if (200..300).contains(&response.status) {
        println!("{}", body);
        Ok(0)
    } else {
        eprintln!("HTTP {}: {}", response.status, body);
        Ok(1)
    }
}

fn run(cli: Cli) -> Result<i32> {
    let mut config = load_config(cli.config.as_ref())?;
    if cli.local {
        config = config.with_local_defaults();
    }
    let router = || -> Result<Arc<FallbackRouter>> {
        Ok(Arc::new(FallbackRouter::new(Bindings::from_config(&config)?)))
    };

    match cli.command {
        Command::Ingest { file } => {
            let raw = match file {
                Some(path) => std::fs::read(&path).with_context(|| format!("Failed to read {:?}", path))?,
                None => {
                    let mut buf = Vec::new();
                    io::stdin().read_to_end(&mut buf).context("Failed to read stdin")?;
                    buf
                }
            };
            let ingestor = Ingestor::new(router()?).with_publisher(publisher_from_config(&config)?);
            match ingestor.ingest(&raw) {
                Ok(outcome) => {
                    info!(
                        "Stored {} for {} in {}",
                        outcome.message_id, outcome.to_address, outcome.stored_in
                    );
                    println!("{}", outcome.message_id);
                    Ok(0)
                }
                Err(e) => emit(&ApiResponse::from(&e)),
            }
        }
        Command::List { email } => {
            let router = router()?;
            emit(&api::get_inbox(router.as_ref(), Some(&email)))
        }
        Command::Delete { email, id } => {
            let router = router()?;
            emit(&api::delete_message(
                router.as_ref(),
                Some(&email),
                &DeleteRequest { email_id: Some(id) },
            ))
        }
        Command::Notify { email, message } => {
            let publisher = manual_publisher_from_config(&config)?;
            emit(&api::notify(
                publisher.as_ref(),
                &NotifyRequest {
                    email: Some(email),
                    message,
                },
            ))
        }
        Command::Watch { email, count } => {
            let stream = ChangeStream::new(router()?, config.poll_interval());
            let subscription = match api::open_stream(&stream, Some(&email)) {
                Ok(subscription) => subscription,
                Err(response) => return emit(&response),
            };

            let mut stdout = io::stdout().lock();
            let mut seen = 0;
            while let Some(event) = subscription.recv() {
                let frame = event.to_sse().context("Failed to encode event")?;
                stdout.write_all(frame.as_bytes()).context("Failed to write event")?;
                stdout.flush().context("Failed to flush stdout")?;
                seen += 1;
                if count.is_some_and(|limit| seen >= limit) {
                    break;
                }
            }
            subscription.close();
            Ok(0)
        }
        Command::Purge => {
            let Some(path) = &config.kv_path else {
                bail!("No key/value store configured (set kv_path or INBOX_KV_PATH)");
            };
            let store = HeedMessageStore::new(path, config.kv_ttl())?;
            println!("{}", store.purge_expired()?);
            Ok(0)
        }
        Command::Logs { hours } => {
            let client = CloudflareClient::from_config(&config)?;
            emit(&api::email_logs(
                client.as_ref(),
                config.cloudflare.zone_id.as_deref(),
                chrono::Duration::hours(i64::from(hours)),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(args.iter().copied()).unwrap()
    }

    /// Config file pointing the primary store into `dir`
    fn write_config(dir: &std::path::Path) -> String {
        let path = dir.join("inbox.json");
        let config = serde_json::json!({ "sqlite_path": dir.join("inbox.test.sqlite") });
        fs::write(&path, config.to_string()).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_ingest_list_delete_commands() {
        let dir = tempdir().unwrap();
        let config = write_config(dir.path());
        let mail = dir.path().join("mail.eml");
        fs::write(
            &mail,
            "From: sender@example.com\r\nTo: user@domain.com\r\nSubject: hi\r\n\
             Date: Mon, 01 Jan 2024 10:00:00 +0000\r\n\r\nbody\r\n",
        )
        .unwrap();
        let mail = mail.to_string_lossy().into_owned();

        assert_eq!(run(cli(&["inboxctl", "--config", &config, "ingest", "--file", &mail])).unwrap(), 0);
        assert_eq!(run(cli(&["inboxctl", "--config", &config, "list", "user@domain.com"])).unwrap(), 0);
        assert_eq!(run(cli(&["inboxctl", "--config", &config, "list", "not-an-email"])).unwrap(), 1);
        assert_eq!(
            run(cli(&["inboxctl", "--config", &config, "delete", "user@domain.com", "missing"])).unwrap(),
            1
        );
    }

    #[test]
    fn test_logs_without_zone_fails() {
        let dir = tempdir().unwrap();
        let config = write_config(dir.path());
        assert_eq!(run(cli(&["inboxctl", "--config", &config, "logs", "--hours", "6"])).unwrap(), 1);
    }
}
