//! Startup orchestration
//!
//! Runs the fatal setup sequence (state, binaries, keys, engine config,
//! links) and then hands the record to the tracker while the supervisor
//! keeps both external processes alive.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::engine_config::EngineConfig;
use crate::identity::{IdentityRecord, Overrides, TUNNEL_DOMAIN_PLACEHOLDER, TUNNEL_LOCAL_PORT};
use crate::keys::{ensure_keys, ensure_short_id, KeyEngine, KeyError};
use crate::links::LinkPublisher;
use crate::scan::quick_tunnel_pattern;
use crate::store::{ConfigStore, StoreError};
use crate::supervisor::{
    MatchHandler, OutputMode, ProcessDescriptor, ProcessSupervisor, DEFAULT_RESTART_DELAY,
};
use crate::tracker::DomainTracker;

pub const TUNNEL_PROCESS: &str = "tunnel";
pub const ENGINE_PROCESS: &str = "engine";

/// Fatal startup errors
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("Required binary not found: {0}")]
    MissingBinary(PathBuf),

    #[error("Required binary is not executable: {0}")]
    NotExecutable(PathBuf),

    #[error("Failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Key provisioning failed: {0}")]
    Keys(#[from] KeyError),

    #[error("Failed to persist state: {0}")]
    Persist(#[source] StoreError),

    #[error("Failed to write engine config: {0}")]
    EngineConfig(#[source] StoreError),

    #[error("Failed to publish links: {0}")]
    Publish(#[source] StoreError),
}

/// File locations used by the supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub base_dir: PathBuf,
    pub tunnel_bin: PathBuf,
    pub engine_bin: PathBuf,
    pub engine_config: PathBuf,
    pub state_file: PathBuf,
    pub sub_file: PathBuf,
}

impl Paths {
    /// Default layout under `base_dir`
    pub fn under(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let bin_dir = base_dir.join("bin");
        Self {
            tunnel_bin: bin_dir.join("cf"),
            engine_bin: bin_dir.join("xy"),
            engine_config: base_dir.join("xy-config.json"),
            state_file: base_dir.join("state.json"),
            sub_file: base_dir.join("node.txt"),
            base_dir,
        }
    }

    fn directories(&self) -> Vec<&Path> {
        let mut dirs = vec![self.base_dir.as_path()];
        for file in [
            &self.tunnel_bin,
            &self.engine_bin,
            &self.engine_config,
            &self.state_file,
            &self.sub_file,
        ] {
            if let Some(parent) = file.parent().filter(|p| !p.as_os_str().is_empty()) {
                if !dirs.contains(&parent) {
                    dirs.push(parent);
                }
            }
        }
        dirs
    }
}

/// Everything the bootstrap needs from the operator
#[derive(Debug, Clone)]
pub struct Settings {
    pub paths: Paths,
    pub overrides: Overrides,
    /// Named tunnel token; absent means a quick tunnel whose hostname is scanned
    pub tunnel_token: Option<String>,
    pub restart_delay: Duration,
}

impl Settings {
    pub fn new(paths: Paths) -> Self {
        Self {
            paths,
            overrides: Overrides::default(),
            tunnel_token: None,
            restart_delay: DEFAULT_RESTART_DELAY,
        }
    }
}

/// Descriptor for the tunnel client.
///
/// Without a token the client runs a quick tunnel and its output is scanned
/// for the assigned hostname.
pub fn tunnel_descriptor(
    program: &Path,
    token: Option<&str>,
    on_match: MatchHandler,
) -> ProcessDescriptor {
    let mut args = vec!["tunnel".to_string(), "--no-autoupdate".to_string()];
    match token {
        Some(token) => {
            args.extend(["run".to_string(), "--token".to_string(), token.to_string()]);
            ProcessDescriptor::new(TUNNEL_PROCESS, program, args)
        }
        None => {
            args.extend([
                "--url".to_string(),
                format!("http://localhost:{}", TUNNEL_LOCAL_PORT),
            ]);
            ProcessDescriptor::new(TUNNEL_PROCESS, program, args).with_output(OutputMode::Scan {
                pattern: quick_tunnel_pattern(),
                on_match,
            })
        }
    }
}

/// Descriptor for the proxy engine
pub fn engine_descriptor(program: &Path, config: &Path) -> ProcessDescriptor {
    ProcessDescriptor::new(
        ENGINE_PROCESS,
        program,
        vec!["-c".to_string(), config.display().to_string()],
    )
}

/// Fail unless `path` is an executable regular file.
pub fn ensure_executable(path: &Path) -> Result<(), BootstrapError> {
    let metadata =
        fs::metadata(path).map_err(|_| BootstrapError::MissingBinary(path.to_path_buf()))?;
    if !metadata.is_file() {
        return Err(BootstrapError::NotExecutable(path.to_path_buf()));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(BootstrapError::NotExecutable(path.to_path_buf()));
        }
    }

    Ok(())
}

pub struct Bootstrap {
    settings: Settings,
}

impl Bootstrap {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Run every fatal startup step.
    ///
    /// load → defaults → directories → binaries → keys → short id → persist
    /// → engine config → links
    pub async fn prepare(&self, keys: &dyn KeyEngine) -> Result<Prepared, BootstrapError> {
        let paths = &self.settings.paths;
        let store = ConfigStore::new(&paths.state_file);
        let publisher = LinkPublisher::new(&paths.sub_file);

        let mut record = IdentityRecord::apply_defaults(&self.settings.overrides, store.load());
        // Quick tunnel hostnames do not outlive the client that got them
        if self.settings.tunnel_token.is_none() && record.has_tunnel_domain() {
            debug!(stale = %record.tunnel_domain, "Quick tunnel mode, dropping previous tunnel domain");
            record.tunnel_domain = TUNNEL_DOMAIN_PLACEHOLDER.to_string();
        }
        info!(
            domain = %record.domain,
            port = record.port,
            session_id = %record.session_id,
            "Identity loaded"
        );

        for dir in paths.directories() {
            fs::create_dir_all(dir).map_err(|source| BootstrapError::CreateDir {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        ensure_executable(&paths.tunnel_bin)?;
        ensure_executable(&paths.engine_bin)?;

        ensure_keys(&mut record, keys).await?;
        ensure_short_id(&mut record);

        store.persist(&record).map_err(BootstrapError::Persist)?;

        EngineConfig::build(&record)
            .write(&paths.engine_config)
            .map_err(BootstrapError::EngineConfig)?;
        info!(path = %paths.engine_config.display(), "Engine config written");

        publisher
            .publish(&record)
            .map_err(BootstrapError::Publish)?;

        if self.settings.tunnel_token.is_some() && !record.has_tunnel_domain() {
            warn!("Named tunnel in use but no tunnel domain configured; links use the placeholder");
        }

        Ok(Prepared {
            record,
            store,
            publisher,
            paths: paths.clone(),
            tunnel_token: self.settings.tunnel_token.clone(),
        })
    }
}

/// Result of a successful bootstrap, ready to launch the processes
pub struct Prepared {
    pub record: IdentityRecord,
    store: ConfigStore,
    publisher: LinkPublisher,
    paths: Paths,
    tunnel_token: Option<String>,
}

impl Prepared {
    /// Managed process descriptors. Tunnel hosts found by scanning go to `tx`.
    pub fn descriptors(&self, tx: mpsc::UnboundedSender<String>) -> Vec<ProcessDescriptor> {
        let on_match: MatchHandler = Arc::new(move |host| {
            let _ = tx.send(host);
        });

        vec![
            tunnel_descriptor(
                &self.paths.tunnel_bin,
                self.tunnel_token.as_deref(),
                on_match,
            ),
            engine_descriptor(&self.paths.engine_bin, &self.paths.engine_config),
        ]
    }

    /// Launch every managed process and track tunnel domain changes.
    ///
    /// Only returns if every supervision task ends, which in practice means
    /// never.
    pub async fn run(self, supervisor: ProcessSupervisor) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handles: Vec<_> = self
            .descriptors(tx)
            .into_iter()
            .map(|descriptor| supervisor.spawn(descriptor))
            .collect();

        let tracker = DomainTracker::new(self.record, self.store, self.publisher);
        tracker.run(rx).await;

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Supervision task ended");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_under() {
        let paths = Paths::under("/srv/app");
        assert_eq!(paths.tunnel_bin, PathBuf::from("/srv/app/bin/cf"));
        assert_eq!(paths.engine_bin, PathBuf::from("/srv/app/bin/xy"));
        assert_eq!(paths.engine_config, PathBuf::from("/srv/app/xy-config.json"));
        assert_eq!(paths.state_file, PathBuf::from("/srv/app/state.json"));
        assert_eq!(paths.sub_file, PathBuf::from("/srv/app/node.txt"));

        let dirs = paths.directories();
        assert_eq!(
            dirs,
            vec![Path::new("/srv/app"), Path::new("/srv/app/bin")]
        );
    }

    #[test]
    fn test_quick_tunnel_descriptor_scans() {
        let descriptor = tunnel_descriptor(Path::new("/bin/cf"), None, Arc::new(|_| {}));
        assert_eq!(
            descriptor.args,
            vec!["tunnel", "--no-autoupdate", "--url", "http://localhost:8001"]
        );
        assert!(descriptor.output.is_scan());
    }

    #[test]
    fn test_named_tunnel_descriptor_ignores_output() {
        let descriptor =
            tunnel_descriptor(Path::new("/bin/cf"), Some("tok"), Arc::new(|_| {}));
        assert_eq!(
            descriptor.args,
            vec!["tunnel", "--no-autoupdate", "run", "--token", "tok"]
        );
        assert!(!descriptor.output.is_scan());
    }

    #[test]
    fn test_engine_descriptor() {
        let descriptor = engine_descriptor(Path::new("/bin/xy"), Path::new("/etc/xy.json"));
        assert_eq!(descriptor.name, ENGINE_PROCESS);
        assert_eq!(descriptor.args, vec!["-c", "/etc/xy.json"]);
    }

    #[test]
    fn test_missing_binary() {
        let err = ensure_executable(Path::new("/definitely/not/here")).unwrap_err();
        assert!(matches!(err, BootstrapError::MissingBinary(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_non_executable_binary() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("plain");
        fs::write(&path, "data").unwrap();

        let err = ensure_executable(&path).unwrap_err();
        assert!(matches!(err, BootstrapError::NotExecutable(_)));

        let err = ensure_executable(temp.path()).unwrap_err();
        assert!(matches!(err, BootstrapError::NotExecutable(_)));
    }
}
