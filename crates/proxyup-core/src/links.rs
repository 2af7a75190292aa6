//! Client connection links
//!
//! Renders the two vless URIs clients import and publishes them to the
//! subscription file and the operator's terminal.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::engine_config::REALITY_SERVER_NAME;
use crate::identity::IdentityRecord;
use crate::store::{write_atomic, StoreError};

const BANNER_RULE: &str = "============================================================";
const BANNER_SEPARATOR: &str = "------------------------------------------------------------";

/// Render `[tunnel_uri, reality_uri]`.
///
/// The tunnel URI uses whatever tunnel domain the record holds, placeholder
/// included.
pub fn render(record: &IdentityRecord) -> [String; 2] {
    let tunnel = format!(
        "vless://{uuid}@{host}:443?encryption=none&security=tls&sni={host}&fp=chrome&type=ws&path=%2F%3Fed%3D2560#{prefix}-ws-argo",
        uuid = record.session_id,
        host = record.tunnel_domain,
        prefix = record.remarks_prefix,
    );

    let reality = format!(
        "vless://{uuid}@{domain}:{port}?encryption=none&flow=xtls-rprx-vision&security=reality&sni={sni}&fp=chrome&pbk={pbk}&sid={sid}&spx=%2F&type=tcp&headerType=none#{prefix}-reality",
        uuid = record.session_id,
        domain = record.domain,
        port = record.port,
        sni = REALITY_SERVER_NAME,
        pbk = record.public_key.as_deref().unwrap_or_default(),
        sid = record.short_id.as_deref().unwrap_or_default(),
        prefix = record.remarks_prefix,
    );

    [tunnel, reality]
}

/// Multi-line banner shown to the operator
pub fn banner(links: &[String]) -> String {
    format!(
        "{rule}\n🚀 WebSocket+Argo & Reality Node Info\n{sep}\n{links}\n{rule}",
        rule = BANNER_RULE,
        sep = BANNER_SEPARATOR,
        links = links.join("\n"),
    )
}

/// Writes rendered links to the subscription file
#[derive(Debug, Clone)]
pub struct LinkPublisher {
    path: PathBuf,
}

impl LinkPublisher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Overwrite the subscription file and print the banner.
    pub fn publish(&self, record: &IdentityRecord) -> Result<[String; 2], StoreError> {
        let links = render(record);

        let mut contents = links.join("\n");
        contents.push('\n');
        write_atomic(&self.path, contents.as_bytes())?;

        info!(path = %self.path.display(), tunnel_domain = %record.tunnel_domain, "Published connection links");
        println!("{}", banner(&links));

        Ok(links)
    }
}
