//! Proxy engine configuration
//!
//! Builds the engine's JSON document from the identity record. Two vless
//! inbounds share the session id: a websocket listener on loopback for the
//! tunnel client, and a reality listener on the public port.

use std::path::Path;

use serde::Serialize;

use crate::identity::{IdentityRecord, TUNNEL_LOCAL_PORT};
use crate::store::{write_atomic, StoreError};

/// Host the reality handshake impersonates
pub const REALITY_SERVER_NAME: &str = "www.iq.com";

/// Websocket path shared by the inbound and the rendered URI
pub const WS_PATH: &str = "/?ed=2560";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineConfig {
    pub inbounds: Vec<Inbound>,
    pub outbounds: Vec<Outbound>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Inbound {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,
    pub port: u16,
    pub protocol: String,
    pub settings: InboundSettings,
    pub stream_settings: StreamSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InboundSettings {
    pub clients: Vec<Client>,
    pub decryption: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Client {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    pub network: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_settings: Option<WsSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reality_settings: Option<RealitySettings>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WsSettings {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealitySettings {
    pub show: bool,
    pub dest: String,
    pub xver: u8,
    pub server_names: Vec<String>,
    pub private_key: String,
    pub short_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outbound {
    pub protocol: String,
    pub settings: serde_json::Map<String, serde_json::Value>,
}

impl EngineConfig {
    /// Build the document for `record`. Same record, same bytes.
    pub fn build(record: &IdentityRecord) -> Self {
        let settings = InboundSettings {
            clients: vec![Client {
                id: record.session_id.clone(),
            }],
            decryption: "none".to_string(),
        };

        let tunnel_inbound = Inbound {
            listen: Some("127.0.0.1".to_string()),
            port: TUNNEL_LOCAL_PORT,
            protocol: "vless".to_string(),
            settings: settings.clone(),
            stream_settings: StreamSettings {
                network: "ws".to_string(),
                security: None,
                ws_settings: Some(WsSettings {
                    path: WS_PATH.to_string(),
                }),
                reality_settings: None,
            },
        };

        let reality_inbound = Inbound {
            listen: None,
            port: record.port,
            protocol: "vless".to_string(),
            settings,
            stream_settings: StreamSettings {
                network: "tcp".to_string(),
                security: Some("reality".to_string()),
                ws_settings: None,
                reality_settings: Some(RealitySettings {
                    show: false,
                    dest: format!("{}:443", REALITY_SERVER_NAME),
                    xver: 0,
                    server_names: vec![REALITY_SERVER_NAME.to_string()],
                    private_key: record.private_key.clone().unwrap_or_default(),
                    short_ids: record.short_id.iter().cloned().collect(),
                }),
            },
        };

        Self {
            inbounds: vec![tunnel_inbound, reality_inbound],
            outbounds: vec![Outbound {
                protocol: "freedom".to_string(),
                settings: serde_json::Map::new(),
            }],
        }
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Atomically replace the engine config file.
    pub fn write(&self, path: &Path) -> Result<(), StoreError> {
        let json = self.to_json_pretty()?;
        write_atomic(path, json.as_bytes())
    }
}
