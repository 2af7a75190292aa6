//! End-to-end bootstrap tests
//!
//! The tunnel client and proxy engine are replaced by shell scripts: the
//! engine answers `x25519` like the real one, the tunnel prints a quick
//! tunnel URL.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

use proxyup_core::{
    Bootstrap, BootstrapError, EngineKeyTool, Overrides, Paths, ProcessSupervisor, Settings,
};
use tempfile::TempDir;
use tokio::time::timeout;

const ENGINE_SCRIPT: &str = r#"#!/bin/sh
if [ "$1" = "x25519" ]; then
  if [ "$2" = "-i" ]; then
    if [ "$3" = "bad" ]; then
      echo "invalid private key" >&2
      exit 1
    fi
    echo "Private key: $3"
    echo "Public key: derived-$3"
    exit 0
  fi
  echo "Private key: generated-private"
  echo "Public key: generated-public"
  exit 0
fi
sleep 30
"#;

const TUNNEL_SCRIPT: &str = r#"#!/bin/sh
echo "INF Requesting new quick Tunnel on trycloudflare.com..." >&2
echo "INF |  https://bright-river-42.trycloudflare.com  |" >&2
sleep 30
"#;

fn install(path: &Path, contents: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

/// Base directory with both fake binaries installed
fn setup_test_env() -> (TempDir, Paths) {
    let temp = TempDir::new().unwrap();
    let paths = Paths::under(temp.path());
    install(&paths.engine_bin, ENGINE_SCRIPT);
    install(&paths.tunnel_bin, TUNNEL_SCRIPT);
    (temp, paths)
}

fn example_settings(paths: Paths) -> Settings {
    let mut settings = Settings::new(paths);
    settings.overrides = Overrides {
        domain: Some("example.com".to_string()),
        port: Some("8443".to_string()),
        ..Default::default()
    };
    settings.restart_delay = Duration::from_millis(100);
    settings
}

fn read_json(path: &Path) -> serde_json::Value {
    serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
}

#[tokio::test]
async fn test_bootstrap_from_empty_state() {
    let (_temp, paths) = setup_test_env();
    let keys = EngineKeyTool::new(&paths.engine_bin);

    let prepared = Bootstrap::new(example_settings(paths.clone()))
        .prepare(&keys)
        .await
        .unwrap();

    // Engine config: two inbounds on 8001 and 8443
    let config = read_json(&paths.engine_config);
    let inbounds = config["inbounds"].as_array().unwrap();
    assert_eq!(inbounds.len(), 2);
    assert_eq!(inbounds[0]["port"], 8001);
    assert_eq!(inbounds[1]["port"], 8443);
    assert_eq!(
        inbounds[1]["streamSettings"]["realitySettings"]["privateKey"],
        "generated-private"
    );

    // Subscription: two links with the same session id
    let links = fs::read_to_string(&paths.sub_file).unwrap();
    assert!(links.ends_with('\n'));
    let lines: Vec<&str> = links.lines().collect();
    assert_eq!(lines.len(), 2);
    let session_id = &prepared.record.session_id;
    assert!(lines.iter().all(|l| l.contains(session_id.as_str())));
    assert!(lines[0].contains("xxx.trycloudflare.com"));
    assert!(lines[1].contains("@example.com:8443"));
    assert!(lines[1].contains("pbk=generated-public"));

    // State: complete key pair and short id
    let state = read_json(&paths.state_file);
    assert_eq!(state["privateKey"], "generated-private");
    assert_eq!(state["publicKey"], "generated-public");
    assert_eq!(state["sessionId"], session_id.as_str());
    assert_eq!(state["shortId"].as_str().unwrap().len(), 8);
    assert!(state.get("tunnelDomain").is_none());
}

#[tokio::test]
async fn test_identity_survives_restart() {
    let (_temp, paths) = setup_test_env();
    let keys = EngineKeyTool::new(&paths.engine_bin);

    let first = Bootstrap::new(example_settings(paths.clone()))
        .prepare(&keys)
        .await
        .unwrap();

    // Second start with no overrides at all
    let second = Bootstrap::new(Settings::new(paths.clone()))
        .prepare(&keys)
        .await
        .unwrap();

    assert_eq!(first.record.session_id, second.record.session_id);
    assert_eq!(first.record.short_id, second.record.short_id);
    assert_eq!(first.record.key_pair(), second.record.key_pair());
    assert_eq!(second.record.domain, "example.com");
    assert_eq!(second.record.port, 8443);
}

#[tokio::test]
async fn test_supplied_private_key_is_derived() {
    let (_temp, paths) = setup_test_env();
    let keys = EngineKeyTool::new(&paths.engine_bin);
    let mut settings = example_settings(paths);
    settings.overrides.private_key = Some("mine".to_string());

    let prepared = Bootstrap::new(settings).prepare(&keys).await.unwrap();

    let pair = prepared.record.key_pair().unwrap();
    assert_eq!(pair.private_key, "mine");
    assert_eq!(pair.public_key, "derived-mine");
}

#[tokio::test]
async fn test_supplied_private_key_replaces_saved_pair() {
    let (_temp, paths) = setup_test_env();
    let keys = EngineKeyTool::new(&paths.engine_bin);

    // First start saves a generated pair
    Bootstrap::new(example_settings(paths.clone()))
        .prepare(&keys)
        .await
        .unwrap();

    let mut settings = example_settings(paths.clone());
    settings.overrides.private_key = Some("mine".to_string());
    let prepared = Bootstrap::new(settings).prepare(&keys).await.unwrap();

    let pair = prepared.record.key_pair().unwrap();
    assert_eq!(pair.private_key, "mine");
    assert_eq!(pair.public_key, "derived-mine");

    let state = read_json(&paths.state_file);
    assert_eq!(state["privateKey"], "mine");
    assert_eq!(state["publicKey"], "derived-mine");
    let links = fs::read_to_string(&paths.sub_file).unwrap();
    assert!(links.contains("pbk=derived-mine"));
}

#[tokio::test]
async fn test_underivable_private_key_is_replaced() {
    let (_temp, paths) = setup_test_env();
    let keys = EngineKeyTool::new(&paths.engine_bin);
    let mut settings = example_settings(paths.clone());
    settings.overrides.private_key = Some("bad".to_string());

    let prepared = Bootstrap::new(settings).prepare(&keys).await.unwrap();

    let pair = prepared.record.key_pair().unwrap();
    assert_eq!(pair.private_key, "generated-private");
    assert_eq!(pair.public_key, "generated-public");
    let state = read_json(&paths.state_file);
    assert_eq!(state["privateKey"], "generated-private");
}

#[tokio::test]
async fn test_missing_binary_is_fatal() {
    let temp = TempDir::new().unwrap();
    let paths = Paths::under(temp.path());
    install(&paths.engine_bin, ENGINE_SCRIPT);
    let keys = EngineKeyTool::new(&paths.engine_bin);

    let err = Bootstrap::new(example_settings(paths.clone()))
        .prepare(&keys)
        .await
        .err()
        .unwrap();

    assert!(matches!(err, BootstrapError::MissingBinary(p) if p == paths.tunnel_bin));
    assert!(!paths.engine_config.exists());
}

#[tokio::test]
async fn test_unparsable_key_output_is_fatal() {
    let (_temp, paths) = setup_test_env();
    install(&paths.engine_bin, "#!/bin/sh\necho \"nothing to see\"\n");
    let keys = EngineKeyTool::new(&paths.engine_bin);

    let err = Bootstrap::new(example_settings(paths.clone()))
        .prepare(&keys)
        .await
        .err()
        .unwrap();

    assert!(matches!(err, BootstrapError::Keys(_)));
    assert!(!paths.state_file.exists());
}

#[tokio::test]
async fn test_discovered_domain_is_persisted_and_published() {
    let (_temp, paths) = setup_test_env();
    let keys = EngineKeyTool::new(&paths.engine_bin);
    let settings = example_settings(paths.clone());
    let supervisor = ProcessSupervisor::new(settings.restart_delay);

    let prepared = Bootstrap::new(settings).prepare(&keys).await.unwrap();
    let session_id = prepared.record.session_id.clone();
    let run = tokio::spawn(prepared.run(supervisor));

    let published = timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(links) = fs::read_to_string(&paths.sub_file) {
                if links.contains("bright-river-42.trycloudflare.com") {
                    return links;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("tunnel domain was never published");
    run.abort();

    let first = published.lines().next().unwrap();
    assert!(first.contains("@bright-river-42.trycloudflare.com:443"));
    assert!(first.contains("sni=bright-river-42.trycloudflare.com"));

    let state = read_json(&paths.state_file);
    assert_eq!(state["tunnelDomain"], "bright-river-42.trycloudflare.com");
    assert_eq!(state["sessionId"], session_id.as_str());
}

#[tokio::test]
async fn test_quick_tunnel_starts_from_placeholder() {
    let (_temp, paths) = setup_test_env();
    let keys = EngineKeyTool::new(&paths.engine_bin);
    fs::write(
        &paths.state_file,
        r#"{ "tunnelDomain": "gone-away-7.trycloudflare.com" }"#,
    )
    .unwrap();

    let prepared = Bootstrap::new(example_settings(paths.clone()))
        .prepare(&keys)
        .await
        .unwrap();

    assert!(!prepared.record.has_tunnel_domain());
    let links = fs::read_to_string(&paths.sub_file).unwrap();
    assert!(links.contains("@xxx.trycloudflare.com:443"));
    assert!(!links.contains("gone-away-7"));
    assert!(read_json(&paths.state_file).get("tunnelDomain").is_none());
}

#[tokio::test]
async fn test_named_tunnel_keeps_saved_domain() {
    let (_temp, paths) = setup_test_env();
    let keys = EngineKeyTool::new(&paths.engine_bin);
    fs::write(
        &paths.state_file,
        r#"{ "tunnelDomain": "tunnel.example.com" }"#,
    )
    .unwrap();

    let mut settings = example_settings(paths.clone());
    settings.tunnel_token = Some("token".to_string());
    let prepared = Bootstrap::new(settings).prepare(&keys).await.unwrap();

    assert_eq!(prepared.record.tunnel_domain, "tunnel.example.com");
    let links = fs::read_to_string(&paths.sub_file).unwrap();
    assert!(links.contains("@tunnel.example.com:443"));
}
