//! ProxyUp - keep a tunnel client and a proxy engine running
//!
//! Provisions identity and key material, writes the engine config, publishes
//! client links and restarts both processes whenever they exit.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use proxyup_core::{Bootstrap, EngineKeyTool, Overrides, Paths, ProcessSupervisor, Settings};

/// ProxyUp - supervise a tunnel client and a proxy engine
#[derive(Parser, Debug)]
#[command(name = "proxyup")]
#[command(about = "Supervise a tunnel client and a proxy engine and publish client links")]
#[command(version)]
#[command(long_about = r#"
ProxyUp prepares the proxy engine's identity (session id, x25519 key pair,
short id), writes its config, publishes two client links and keeps the
tunnel client and the proxy engine running. When the tunnel client reports
a new hostname the state file and links are rewritten.

EXAMPLES:
  # Quick tunnel, hostname discovered from the tunnel client's output
  proxyup --domain example.com --port 8443

  # Named tunnel with a fixed hostname
  proxyup --argo-token $TOKEN --argo-domain tunnel.example.com

ENVIRONMENT VARIABLES:
  DOMAIN          Domain clients use for the reality link
  PORT            Reality listening port
  UUID            Session id
  ARGO_TOKEN      Named tunnel token
  ARGO_DOMAIN     Named tunnel hostname
  BASE_DIR        Directory holding binaries, config and state
"#)]
struct Args {
    /// Domain clients use for the reality link
    #[arg(long, env = "DOMAIN")]
    domain: Option<String>,

    /// Reality listening port
    #[arg(long, env = "PORT")]
    port: Option<String>,

    /// Session id (UUID)
    #[arg(long, env = "UUID")]
    uuid: Option<String>,

    /// Label prefix for rendered links
    #[arg(long, env = "REMARKS_PREFIX")]
    remarks_prefix: Option<String>,

    /// Named tunnel token (quick tunnel when absent)
    #[arg(long, env = "ARGO_TOKEN")]
    argo_token: Option<String>,

    /// Tunnel hostname, for named tunnels
    #[arg(long, env = "ARGO_DOMAIN")]
    argo_domain: Option<String>,

    /// Reality private key
    #[arg(long, env = "PRIVATE_KEY")]
    private_key: Option<String>,

    /// Reality public key
    #[arg(long, env = "PUBLIC_KEY")]
    public_key: Option<String>,

    /// Reality short id
    #[arg(long, env = "SHORT_ID")]
    short_id: Option<String>,

    /// Base directory for binaries, config and state
    #[arg(long, env = "BASE_DIR", default_value = "/home/container")]
    base_dir: PathBuf,

    /// Tunnel client binary [default: <base-dir>/bin/cf]
    #[arg(long, env = "TUNNEL_BIN")]
    tunnel_bin: Option<PathBuf>,

    /// Proxy engine binary [default: <base-dir>/bin/xy]
    #[arg(long, env = "ENGINE_BIN")]
    engine_bin: Option<PathBuf>,

    /// Proxy engine config file [default: <base-dir>/xy-config.json]
    #[arg(long, env = "ENGINE_CONFIG")]
    engine_config: Option<PathBuf>,

    /// Identity state file [default: <base-dir>/state.json]
    #[arg(long, env = "STATE_FILE")]
    state_file: Option<PathBuf>,

    /// Subscription file [default: <base-dir>/node.txt]
    #[arg(long, env = "SUB_FILE")]
    sub_file: Option<PathBuf>,

    /// Seconds to wait before restarting an exited process
    #[arg(long, env = "RESTART_DELAY_SECS", default_value = "3")]
    restart_delay_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_level: String,
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Turn CLI args into bootstrap settings, explicit paths winning over the
/// base directory layout
fn build_settings(args: Args) -> Settings {
    let defaults = Paths::under(&args.base_dir);
    let paths = Paths {
        tunnel_bin: args.tunnel_bin.unwrap_or(defaults.tunnel_bin),
        engine_bin: args.engine_bin.unwrap_or(defaults.engine_bin),
        engine_config: args.engine_config.unwrap_or(defaults.engine_config),
        state_file: args.state_file.unwrap_or(defaults.state_file),
        sub_file: args.sub_file.unwrap_or(defaults.sub_file),
        base_dir: defaults.base_dir,
    };

    Settings {
        paths,
        overrides: Overrides {
            domain: args.domain,
            port: args.port,
            session_id: args.uuid,
            remarks_prefix: args.remarks_prefix,
            tunnel_domain: args.argo_domain,
            private_key: args.private_key,
            public_key: args.public_key,
            short_id: args.short_id,
        },
        tunnel_token: args.argo_token.filter(|t| !t.trim().is_empty()),
        restart_delay: Duration::from_secs(args.restart_delay_secs),
    }
}

async fn run(settings: Settings) -> Result<()> {
    let keys = EngineKeyTool::new(&settings.paths.engine_bin);
    let supervisor = ProcessSupervisor::new(settings.restart_delay);

    let prepared = Bootstrap::new(settings)
        .prepare(&keys)
        .await
        .context("Startup failed")?;

    info!("✅ Bootstrap complete, launching managed processes");

    tokio::select! {
        _ = prepared.run(supervisor) => {
            info!("All supervision tasks ended");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = setup_logging(&args.log_level) {
        eprintln!("[ERROR] {:#}", e);
        std::process::exit(1);
    }

    let settings = build_settings(args);
    if let Err(e) = run(settings).await {
        error!("[ERROR] {:#}", e);
        eprintln!("[ERROR] {:#}", e);
        std::process::exit(1);
    }
}
