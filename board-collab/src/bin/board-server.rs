//! Standalone board sync server.
//!
//! ```text
//! board-server [--bind ADDR] [--storage DIR] [--relay URL] [--token TOKEN]...
//! ```
//!
//! Without `--storage` room history lives in memory and dies with the
//! process. Without `--token` every credential is accepted.

use std::sync::Arc;

use uuid::Uuid;

use board_collab::auth::{AllowAll, CredentialVerifier, Principal, StaticTokenVerifier};
use board_collab::server::{ServerConfig, SyncServer};
use board_collab::storage::{FileStore, LogStore, MemoryStore};

struct Args {
    bind: String,
    storage: Option<String>,
    relay: Option<String>,
    tokens: Vec<String>,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        bind: "127.0.0.1:9100".into(),
        storage: None,
        relay: None,
        tokens: Vec::new(),
    };
    let mut iter = std::env::args().skip(1);
    while let Some(flag) = iter.next() {
        let mut value = |name: &str| {
            iter.next().ok_or_else(|| format!("{name} requires a value"))
        };
        match flag.as_str() {
            "--bind" => args.bind = value("--bind")?,
            "--storage" => args.storage = Some(value("--storage")?),
            "--relay" => args.relay = Some(value("--relay")?),
            "--token" => args.tokens.push(value("--token")?),
            "--help" | "-h" => {
                return Err(
                    "usage: board-server [--bind ADDR] [--storage DIR] [--relay URL] [--token TOKEN]..."
                        .into(),
                )
            }
            other => return Err(format!("unknown flag: {other}")),
        }
    }
    Ok(args)
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };

    let store: Arc<dyn LogStore> = match &args.storage {
        Some(dir) => match FileStore::open(dir) {
            Ok(store) => {
                log::info!("Persisting rooms under {dir}");
                Arc::new(store)
            }
            Err(e) => {
                eprintln!("Cannot open storage directory {dir}: {e}");
                std::process::exit(1);
            }
        },
        None => {
            log::warn!("No --storage given; room history is in-memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let verifier: Arc<dyn CredentialVerifier> = if args.tokens.is_empty() {
        log::warn!("No --token given; accepting every credential");
        Arc::new(AllowAll)
    } else {
        let mut tokens = StaticTokenVerifier::new();
        for (n, token) in args.tokens.iter().enumerate() {
            let principal = Principal { user_id: Uuid::new_v4(), name: format!("user-{n}") };
            tokens.insert(token.clone(), principal);
        }
        Arc::new(tokens)
    };

    let config = ServerConfig { bind_addr: args.bind, relay_url: args.relay };
    let server = match SyncServer::start(config, store, verifier).await {
        Ok(server) => server,
        Err(e) => {
            eprintln!("Server failed to start: {e}");
            std::process::exit(1);
        }
    };
    log::info!("Ready on {}", server.url());

    match tokio::signal::ctrl_c().await {
        Ok(()) => log::info!("Shutting down"),
        Err(e) => log::error!("Signal handler failed: {e}"),
    }
    server.shutdown();
}
