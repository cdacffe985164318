//! Testing utilities for consensus-fleet consumers
//!
//! Provides a deterministic in-memory fleet so installer logic can be
//! exercised without hosts, SSH or consensus engines:
//!
//! - [`MockFleet`]: a [`crate::shell::RemoteTransport`] with per-host
//!   filesystems, machine ids and services, built-in emulation of the
//!   commands the installers issue, literal-command stubs and full command
//!   recordings
//! - [`MemoryRegistry`]: the in-process [`crate::registry::ConfigRegistry`]
//!
//! # Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use consensus_fleet::ArakoonInstaller;
//! use consensus_fleet::testing::{MemoryRegistry, MockFleet};
//!
//! #[tokio::test]
//! async fn test_my_app() {
//!     let fleet = Arc::new(MockFleet::new());
//!     fleet.add_host("10.0.0.1", "unit-1");
//!     let registry = Arc::new(MemoryRegistry::new());
//!     let installer = ArakoonInstaller::new(registry, fleet.clone());
//!
//!     // drive the installer; assert on fleet.recordings(),
//!     // fleet.dir_structure(...) and the registry afterwards
//! }
//! ```
//!
//! Commands the mock does not know (engine catch-up passes, `etcdctl`)
//! must be stubbed by their literal text:
//!
//! ```ignore
//! fleet.stub_command("etcdctl cluster-health", "cluster is healthy");
//! assert!(fleet.recordings().contains(&"etcdctl cluster-health".to_string()));
//! ```

mod fleet;

pub use crate::registry::MemoryRegistry;
pub use fleet::MockFleet;
