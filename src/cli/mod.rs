//! Command-line interface
//!
//! - `start` (default): run the gateway
//! - `config show|path`: inspect the resolved configuration
//! - `version`: print version information
//! - `sign`: compute the challenge response a client must send in `connect`

use clap::{Parser, Subcommand};
use serde_json::Value;

use crate::auth::challenge::{sign_response, ConnectClaims};
use crate::auth::Role;
use crate::config;

#[derive(Parser, Debug)]
#[command(
    name = "clawgate",
    version = env!("CARGO_PKG_VERSION"),
    about = "Control-plane WebSocket gateway"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default when no subcommand is given).
    Start,

    /// Inspect configuration.
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Print version and platform information.
    Version,

    /// Compute the HMAC response for a `connect.challenge`.
    Sign {
        /// Shared gateway secret.
        #[arg(long, env = "CLAWGATE_GATEWAY_SECRET", hide_env_values = true)]
        secret: String,

        /// `challengeId` from the challenge event.
        #[arg(long)]
        challenge_id: String,

        /// `nonce` from the challenge event.
        #[arg(long)]
        nonce: String,

        /// Client id that will be sent in `connect.client.id`.
        #[arg(long)]
        client_id: String,

        /// Role the connection will claim.
        #[arg(long, default_value = "operator")]
        role: String,

        /// Node id, required with `--role node`.
        #[arg(long)]
        node_id: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the loaded configuration with secrets redacted.
    Show,
    /// Print the resolved config file path.
    Path,
}

const SECRET_KEYS: &[&str] = &["secret", "password", "token"];

pub fn handle_config_show() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = config::load_config()?;
    println!("{}", serde_json::to_string_pretty(&redact_secrets(cfg))?);
    Ok(())
}

pub fn handle_config_path() {
    println!("{}", config::get_config_path().display());
}

pub fn handle_version() {
    println!("clawgate {}", env!("CARGO_PKG_VERSION"));
    println!(
        "  Platform: {} ({})",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
}

/// Print the response for `sign`.
pub fn handle_sign(
    secret: &str,
    challenge_id: &str,
    nonce: &str,
    client_id: &str,
    role: &str,
    node_id: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    println!(
        "{}",
        sign_challenge(secret, challenge_id, nonce, client_id, role, node_id)?
    );
    Ok(())
}

fn sign_challenge(
    secret: &str,
    challenge_id: &str,
    nonce: &str,
    client_id: &str,
    role: &str,
    node_id: Option<&str>,
) -> Result<String, Box<dyn std::error::Error>> {
    let role = match (role.trim(), node_id.map(str::trim)) {
        ("operator", _) => Role::Interactive,
        ("node", Some(id)) if !id.is_empty() => Role::Node(id.to_string()),
        ("node", _) => return Err("--node-id is required with --role node".into()),
        (other, _) => return Err(format!("unknown role {other:?}").into()),
    };
    let claims = ConnectClaims {
        client_id: client_id.to_string(),
        role,
    };
    Ok(sign_response(
        secret.as_bytes(),
        challenge_id,
        nonce,
        &claims,
    )?)
}

fn redact_secrets(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, child)| {
                    let lower = key.to_lowercase();
                    if SECRET_KEYS.iter().any(|s| lower.contains(s)) {
                        (key, Value::String("[REDACTED]".to_string()))
                    } else {
                        (key, redact_secrets(child))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(redact_secrets).collect()),
        other => other,
    }
}
