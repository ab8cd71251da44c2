//! Standalone sync server.
//!
//! ```text
//! EASEL_JWT_SECRET=… easel-server --bind 0.0.0.0:9090 --data-dir ./easel_data
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use easel_collab::{IdentityVerifier, JwtVerifier, ServerConfig, StaticVerifier, SyncService};

/// Easel real-time collaboration server
#[derive(Parser, Debug)]
#[command(name = "easel-server", version, about = "Easel real-time collaboration server")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "EASEL_BIND", default_value = "127.0.0.1:9090")]
    bind: String,

    /// RocksDB directory; documents are kept in memory when omitted
    #[arg(long, env = "EASEL_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// HS256 secret for bearer tokens
    #[arg(long, env = "EASEL_JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,

    /// Fixed TOKEN=USER credential for local development (repeatable)
    #[arg(long = "dev-token", value_name = "TOKEN=USER")]
    dev_tokens: Vec<String>,

    /// Seconds between autosaves of a changed room
    #[arg(long, env = "EASEL_AUTOSAVE_SECS", default_value_t = 30)]
    autosave_secs: u64,

    /// Seconds between interval versions, 0 disables them
    #[arg(long, env = "EASEL_VERSION_SECS", default_value_t = 600)]
    version_secs: u64,

    /// Seconds between pings on every socket
    #[arg(long, env = "EASEL_HEARTBEAT_SECS", default_value_t = 30)]
    heartbeat_secs: u64,

    /// Milliseconds a joiner waits for a document to load
    #[arg(long, env = "EASEL_LOAD_TIMEOUT_MS", default_value_t = 5000)]
    load_timeout_ms: u64,

    /// Seconds shutdown waits for sockets to close before the final flush
    #[arg(long, env = "EASEL_SHUTDOWN_GRACE_SECS", default_value_t = 10)]
    shutdown_grace_secs: u64,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind.clone(),
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs.max(1)),
            heartbeat_timeout: Duration::from_secs(self.heartbeat_secs.max(1).saturating_mul(5) / 2),
            load_timeout: Duration::from_millis(self.load_timeout_ms),
            autosave_interval: Duration::from_secs(self.autosave_secs.max(1)),
            version_interval: (self.version_secs > 0).then(|| Duration::from_secs(self.version_secs)),
            storage_path: self.data_dir.clone(),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            ..ServerConfig::default()
        }
    }

    fn verifier(&self) -> Result<Arc<dyn IdentityVerifier>, String> {
        if let Some(secret) = &self.jwt_secret {
            return Ok(Arc::new(JwtVerifier::new(secret.as_bytes())));
        }
        if self.dev_tokens.is_empty() {
            return Err("either --jwt-secret (EASEL_JWT_SECRET) or --dev-token is required".into());
        }
        let mut verifier = StaticVerifier::new();
        for pair in &self.dev_tokens {
            let (token, user) = pair
                .split_once('=')
                .ok_or_else(|| format!("--dev-token expects TOKEN=USER, got '{pair}'"))?;
            verifier = verifier.with_token(token, user, user);
        }
        log::warn!("Using {} static development tokens", self.dev_tokens.len());
        Ok(Arc::new(verifier))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let verifier = args.verifier()?;
    let service = Arc::new(SyncService::open(args.server_config(), verifier)?);

    log::info!("Starting Easel sync server...");
    let server = Arc::clone(&service);
    let mut serving = tokio::spawn(async move { server.run().await });

    tokio::select! {
        result = &mut serving => {
            result??;
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("Interrupt received, shutting down");
        }
    }

    let (saved, failed) = service.shutdown().await;
    if let Err(e) = serving.await {
        log::error!("Server task ended abnormally: {e}");
    }
    if failed > 0 {
        log::error!("{failed} rooms could not be saved on shutdown ({saved} saved)");
    }
    Ok(())
}
