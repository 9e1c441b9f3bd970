//! Encrypto CLI - encrypted messaging client
//!
//! Connects to a server, performs the key exchange, and then bridges stdio to
//! the encrypted channel: each stdin line is a JSON payload to send, and each
//! incoming application message is printed as one JSON line.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::{fmt, EnvFilter};

use encrypto::crypto::rsa::{RsaDecryption, RsaEncryptionProvider};
use encrypto::error::ConfigError;
use encrypto::transport::websocket::WebSocketTransportFactory;
use encrypto::{
    ClientConfig, ConnectionHandle, ConnectionLifecycle, EncryptoError, HandshakeWorkflow,
};

/// Encrypto - encrypted messaging client
#[derive(Parser, Debug)]
#[command(name = "encrypto")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file with a [Client] section
    #[arg(short, long, required_unless_present = "endpoint")]
    config: Option<PathBuf>,

    /// Server URL (ws://host:port/ws), overrides the config file
    #[arg(short, long)]
    endpoint: Option<String>,

    /// RSA modulus size for the local keypair
    #[arg(long)]
    key_bits: Option<usize>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logs go to stderr; stdout carries messages
    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(args).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e.user_message());
            if e.is_recoverable() {
                eprintln!("This is usually temporary, try again shortly");
            }
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn run(args: Args) -> Result<(), EncryptoError> {
    let config = load_config(&args)?;

    tracing::info!("Generating {}-bit RSA keypair...", config.key_bits);
    let keys = RsaDecryption::generate(config.key_bits).await?;

    tracing::info!("Encrypto client connecting to {}", config.endpoint);
    let workflow = HandshakeWorkflow::new(Arc::new(keys), Arc::new(RsaEncryptionProvider));
    let factory = Arc::new(WebSocketTransportFactory::new(config.endpoint.clone()));
    let connection = ConnectionLifecycle::new(factory, workflow, config.reconnect_delay).spawn();

    run_until_shutdown(connection).await
}

/// Merge the config file with command line overrides
fn load_config(args: &Args) -> Result<ClientConfig, EncryptoError> {
    let config = match (&args.config, &args.endpoint) {
        (Some(path), endpoint) => {
            tracing::info!("Loading configuration from: {}", path.display());
            let config = ClientConfig::from_file(path)?;
            match endpoint {
                Some(endpoint) => config.with_endpoint(endpoint.as_str())?,
                None => config,
            }
        }
        (None, Some(endpoint)) => ClientConfig::new(endpoint.as_str())?,
        (None, None) => {
            return Err(ConfigError::MissingField {
                field: "Endpoint".to_string(),
            }
            .into())
        }
    };

    match args.key_bits {
        Some(bits) => Ok(config.with_key_bits(bits)?),
        None => Ok(config),
    }
}

/// Bridge stdio to the connection until Ctrl+C or SIGTERM
async fn run_until_shutdown(connection: ConnectionHandle) -> Result<(), EncryptoError> {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let result = tokio::select! {
        result = bridge_stdio(&connection) => result,
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down...");
            Ok(())
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
            Ok(())
        }
    };

    connection.shutdown();
    result
}

async fn bridge_stdio(connection: &ConnectionHandle) -> Result<(), EncryptoError> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut incoming = connection.incoming();
    let mut stdout = tokio::io::stdout();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Value>(line) {
                        Ok(payload) => connection.dispatch(payload)?,
                        Err(e) => tracing::warn!("Ignoring input that is not JSON: {}", e),
                    }
                }
                None => {
                    tracing::debug!("stdin closed");
                    stdin_open = false;
                }
            },

            Some(message) = incoming.recv() => {
                stdout.write_all(format!("{}\n", message).as_bytes()).await?;
                stdout.flush().await?;
            }

            else => return Ok(()),
        }
    }
}
