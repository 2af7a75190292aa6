//! Key material provisioning
//!
//! Makes sure the identity record holds a complete x25519 key pair and a
//! short id before the engine config is written. Key generation and
//! derivation are delegated to the proxy engine binary through [`KeyEngine`].

use std::path::PathBuf;

use async_trait::async_trait;
use rand::RngCore;
use regex::Regex;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::identity::{IdentityRecord, KeyPair};

/// Key provisioning errors
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Failed to run key command {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Key command exited with {status}: {stderr}")]
    CommandFailed { status: String, stderr: String },

    #[error("Key command output has no {0} key")]
    MissingField(&'static str),
}

/// Runs the engine's key subcommands and returns their raw stdout
#[async_trait]
pub trait KeyEngine: Send + Sync {
    /// Generate a fresh key pair
    async fn generate(&self) -> Result<String, KeyError>;

    /// Derive the key pair for an existing private key
    async fn derive(&self, private_key: &str) -> Result<String, KeyError>;
}

/// [`KeyEngine`] backed by the engine binary's `x25519` subcommand
#[derive(Debug, Clone)]
pub struct EngineKeyTool {
    binary: PathBuf,
}

impl EngineKeyTool {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, KeyError> {
        let program = self.binary.display().to_string();
        debug!(program = %program, ?args, "Running key command");

        let output = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| KeyError::Spawn {
                program: program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(KeyError::CommandFailed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl KeyEngine for EngineKeyTool {
    async fn generate(&self) -> Result<String, KeyError> {
        self.run(&["x25519"]).await
    }

    async fn derive(&self, private_key: &str) -> Result<String, KeyError> {
        self.run(&["x25519", "-i", private_key]).await
    }
}

/// Find `<label>[ ]key: <token>` in command output, case-insensitively.
pub fn parse_labeled_key(output: &str, label: &str) -> Option<String> {
    let pattern = format!(r"(?i){}(?:\s*key)?\s*:\s*(\S+)", regex::escape(label));
    let re = Regex::new(&pattern).ok()?;
    re.captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Parse both halves of a generated key pair.
pub fn parse_key_pair(output: &str) -> Result<KeyPair, KeyError> {
    let private_key =
        parse_labeled_key(output, "private").ok_or(KeyError::MissingField("private"))?;
    let public_key =
        parse_labeled_key(output, "public").ok_or(KeyError::MissingField("public"))?;
    Ok(KeyPair {
        private_key,
        public_key,
    })
}

/// Ensure the record holds a complete key pair.
///
/// An existing pair is left alone. A lone private key is first used to
/// derive its public half; if that fails the pair is regenerated. Failure to
/// generate is fatal.
pub async fn ensure_keys(
    record: &mut IdentityRecord,
    engine: &dyn KeyEngine,
) -> Result<(), KeyError> {
    if record.key_pair().is_some() {
        debug!("Key pair already present");
        return Ok(());
    }

    if let Some(private_key) = record.private_key.clone().filter(|k| !k.is_empty()) {
        match derive_public_key(engine, &private_key).await {
            Ok(public_key) => {
                info!("Derived public key from supplied private key");
                record.set_key_pair(KeyPair {
                    private_key,
                    public_key,
                });
                return Ok(());
            }
            Err(e) => {
                warn!(error = %e, "Failed to derive public key, discarding private key and generating a new pair");
            }
        }
    }

    // Never keep half a pair around
    record.private_key = None;
    record.public_key = None;

    let output = engine.generate().await?;
    let pair = parse_key_pair(&output)?;
    info!("Generated new key pair");
    record.set_key_pair(pair);
    Ok(())
}

async fn derive_public_key(
    engine: &dyn KeyEngine,
    private_key: &str,
) -> Result<String, KeyError> {
    let output = engine.derive(private_key).await?;
    parse_labeled_key(&output, "public").ok_or(KeyError::MissingField("public"))
}

/// Fill in a short id if the record has none.
pub fn ensure_short_id(record: &mut IdentityRecord) {
    if record.short_id.as_deref().is_some_and(|s| !s.is_empty()) {
        return;
    }
    let short_id = generate_short_id();
    debug!(short_id = %short_id, "Generated short id");
    record.short_id = Some(short_id);
}

/// 4 random bytes as 8 lowercase hex chars
pub fn generate_short_id() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
