//! Identity record
//!
//! The durable set of fields every other component reads: endpoint domain,
//! listening port, session id, key pair, short id and the discovered tunnel
//! hostname.

use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use tracing::warn;
use uuid::Uuid;

use crate::precedence::{non_empty, parse_port, resolve};

/// Placeholder used until the tunnel client reports its real hostname
pub const TUNNEL_DOMAIN_PLACEHOLDER: &str = "xxx.trycloudflare.com";

/// Default endpoint domain for the reality route
pub const DEFAULT_DOMAIN: &str = "vevc.github.com";

/// Default listening port for the reality inbound
pub const DEFAULT_PORT: u16 = 10008;

/// Default label prefix for rendered URIs
pub const DEFAULT_REMARKS_PREFIX: &str = "vevc";

/// Loopback port the tunnel client forwards to
pub const TUNNEL_LOCAL_PORT: u16 = 8001;

/// Asymmetric key pair used by the reality inbound
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub private_key: String,
    pub public_key: String,
}

/// Values supplied by the operator (CLI flags / environment)
///
/// Every field is optional; an empty string is treated as absent.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub domain: Option<String>,
    /// Raw port string, coerced with [`parse_port`]
    pub port: Option<String>,
    pub session_id: Option<String>,
    pub remarks_prefix: Option<String>,
    pub tunnel_domain: Option<String>,
    pub private_key: Option<String>,
    pub public_key: Option<String>,
    pub short_id: Option<String>,
}

/// Identity state as read from disk
///
/// Mirrors the persisted JSON document. Unknown keys are kept in `extra` so a
/// persist never drops fields written by someone else.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedIdentity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_port",
        skip_serializing_if = "Option::is_none"
    )]
    pub port: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remarks_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_domain: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Resolved identity record
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityRecord {
    pub domain: String,
    pub port: u16,
    pub session_id: String,
    pub remarks_prefix: String,
    pub private_key: Option<String>,
    pub public_key: Option<String>,
    pub short_id: Option<String>,
    pub tunnel_domain: String,
    /// Persisted fields not managed here, written back verbatim
    pub extra: Map<String, Value>,
}

impl IdentityRecord {
    /// Resolve every field as `override → persisted → default`.
    pub fn apply_defaults(overrides: &Overrides, persisted: PersistedIdentity) -> Self {
        let session_id = resolve(
            [
                valid_session_id(non_empty(overrides.session_id.clone()), "override"),
                valid_session_id(non_empty(persisted.session_id), "persisted"),
            ],
            || Uuid::new_v4().to_string(),
        );

        let port = resolve(
            [
                overrides.port.as_deref().and_then(parse_port),
                persisted
                    .port
                    .and_then(|p| u16::try_from(p).ok())
                    .filter(|p| *p > 0),
            ],
            || DEFAULT_PORT,
        );

        let (private_key, public_key) =
            resolve_key_halves(overrides, persisted.private_key, persisted.public_key);

        Self {
            domain: resolve(
                [non_empty(overrides.domain.clone()), non_empty(persisted.domain)],
                || DEFAULT_DOMAIN.to_string(),
            ),
            port,
            session_id,
            remarks_prefix: resolve(
                [
                    non_empty(overrides.remarks_prefix.clone()),
                    non_empty(persisted.remarks_prefix),
                ],
                || DEFAULT_REMARKS_PREFIX.to_string(),
            ),
            private_key,
            public_key,
            short_id: non_empty(overrides.short_id.clone())
                .or_else(|| non_empty(persisted.short_id)),
            tunnel_domain: resolve(
                [
                    non_empty(overrides.tunnel_domain.clone()),
                    non_empty(persisted.tunnel_domain),
                ],
                || TUNNEL_DOMAIN_PLACEHOLDER.to_string(),
            ),
            extra: persisted.extra,
        }
    }

    /// The key pair, if both halves are present.
    pub fn key_pair(&self) -> Option<KeyPair> {
        match (&self.private_key, &self.public_key) {
            (Some(private_key), Some(public_key))
                if !private_key.is_empty() && !public_key.is_empty() =>
            {
                Some(KeyPair {
                    private_key: private_key.clone(),
                    public_key: public_key.clone(),
                })
            }
            _ => None,
        }
    }

    pub fn set_key_pair(&mut self, pair: KeyPair) {
        self.private_key = Some(pair.private_key);
        self.public_key = Some(pair.public_key);
    }

    /// Whether a real tunnel hostname has been discovered yet
    pub fn has_tunnel_domain(&self) -> bool {
        self.tunnel_domain != TUNNEL_DOMAIN_PLACEHOLDER
    }

    /// Snapshot for persistence.
    ///
    /// Keys are written only as a complete pair and the placeholder tunnel
    /// domain is never written.
    pub fn to_persisted(&self) -> PersistedIdentity {
        let pair = self.key_pair();
        PersistedIdentity {
            domain: Some(self.domain.clone()),
            port: Some(i64::from(self.port)),
            session_id: Some(self.session_id.clone()),
            remarks_prefix: Some(self.remarks_prefix.clone()),
            private_key: pair.as_ref().map(|p| p.private_key.clone()),
            public_key: pair.map(|p| p.public_key),
            short_id: self.short_id.clone().filter(|s| !s.is_empty()),
            tunnel_domain: self
                .has_tunnel_domain()
                .then(|| self.tunnel_domain.clone()),
            extra: self.extra.clone(),
        }
    }
}

/// Keys resolve as one unit: any key override replaces the whole persisted
/// pair, so a supplied private key is never matched with a stale public key.
fn resolve_key_halves(
    overrides: &Overrides,
    persisted_private: Option<String>,
    persisted_public: Option<String>,
) -> (Option<String>, Option<String>) {
    let private_key = non_empty(overrides.private_key.clone());
    let public_key = non_empty(overrides.public_key.clone());
    if private_key.is_some() || public_key.is_some() {
        (private_key, public_key)
    } else {
        (non_empty(persisted_private), non_empty(persisted_public))
    }
}

/// Accept the port as a JSON number or a numeric string. Anything else reads
/// as absent instead of failing the whole document.
fn lenient_port<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

fn valid_session_id(value: Option<String>, source: &str) -> Option<String> {
    let value = value?;
    if Uuid::parse_str(&value).is_ok() {
        Some(value)
    } else {
        warn!(source, value = %value, "Ignoring session id that is not a UUID");
        None
    }
}
