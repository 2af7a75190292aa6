//! ProxyUp core - supervises a tunnel client and a proxy engine
//!
//! Derives the identity (session id, x25519 keys, short id) the engine needs,
//! writes its config, keeps both processes running, and republishes client
//! links whenever the tunnel client reports a new hostname.
//!
//! # Quick Start
//!
//! ```ignore
//! use proxyup_core::{Bootstrap, EngineKeyTool, Paths, ProcessSupervisor, Settings};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::new(Paths::under("/home/container"));
//! let keys = EngineKeyTool::new(&settings.paths.engine_bin);
//! let supervisor = ProcessSupervisor::new(settings.restart_delay);
//!
//! let prepared = Bootstrap::new(settings).prepare(&keys).await?;
//! prepared.run(supervisor).await;
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod engine_config;
pub mod identity;
pub mod keys;
pub mod links;
pub mod precedence;
pub mod scan;
pub mod store;
pub mod supervisor;
pub mod tracker;

pub use bootstrap::{Bootstrap, BootstrapError, Paths, Prepared, Settings};
pub use engine_config::EngineConfig;
pub use identity::{IdentityRecord, KeyPair, Overrides, PersistedIdentity};
pub use keys::{EngineKeyTool, KeyEngine, KeyError};
pub use links::LinkPublisher;
pub use store::{ConfigStore, StoreError};
pub use supervisor::{
    OutputMode, ProcessDescriptor, ProcessState, ProcessSupervisor, SupervisorEvent,
};
pub use tracker::{DomainTracker, DomainUpdate};
