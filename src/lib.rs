//! Consensus cluster lifecycle management
//!
//! A Rust library for creating, growing, shrinking, starting, stopping,
//! claiming and destroying multi-node consensus clusters (an Arakoon-style
//! Paxos key/value store and an etcd-style Raft key/value store) across a
//! fleet of hosts reached over SSH, while keeping a shared configuration
//! registry consistent with the on-disk and service state of every node.
//!
//! The consensus engines themselves are external: this crate drives them
//! through their binaries (`arakoon`, `etcdctl`) on the member hosts and
//! never implements the protocol.
//!
//! # Features
//!
//! - **Cluster lifecycle**: create/extend/shrink/delete for Arakoon and
//!   etcd clusters, with health-gated membership changes and engine-driven
//!   catch-up for new members
//! - **Port planning**: free-port allocation per host honoring listening
//!   sockets and the kernel's ephemeral range
//! - **Two-phase config publish**: the registry (or the flat file on every
//!   member) is updated before any affected service starts, so a crash in
//!   between leaves a recoverable state other workers can observe
//! - **Fleet-wide claim protocol**: concurrent workers never claim the same
//!   unused cluster
//! - **Dependency-injected I/O**: remote shell and registry are traits, so
//!   the whole stack runs against the in-memory [`testing`] fleet
//!
//! # Module Organization
//!
//! - **Transport**: [`shell`] (SSH remote shell), [`registry`] (config
//!   registry)
//! - **Planning**: [`ports`], [`arakoon_config`]
//! - **Orchestration**: [`arakoon`], [`etcd`], [`service`], [`claim`]
//! - **Test support**: [`testing`]
//!
//! # Examples
//!
//! ## Creating and starting an Arakoon cluster
//!
//! ```no_run
//! use std::sync::Arc;
//! use consensus_fleet::shell::OpenSshTransport;
//! use consensus_fleet::testing::MemoryRegistry;
//! use consensus_fleet::{ArakoonInstaller, CreateClusterRequest};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = Arc::new(OpenSshTransport::new());
//! let registry = Arc::new(MemoryRegistry::new());
//! let installer = ArakoonInstaller::new(registry, transport);
//!
//! let created = installer
//!     .create_cluster(
//!         CreateClusterRequest::builder()
//!             .cluster_name("voldrv")
//!             .cluster_type("SD")
//!             .ip("10.100.1.10")
//!             .base_dir("/mnt/ssd1")
//!             .build(),
//!     )
//!     .await?;
//! installer.start_cluster(&created.metadata, None).await?;
//! println!("ports: {:?}", created.ports);
//! # Ok(())
//! # }
//! ```
//!
//! ## Claiming an unused cluster
//!
//! ```no_run
//! # use consensus_fleet::ArakoonInstaller;
//! # async fn example(installer: ArakoonInstaller) -> Result<(), Box<dyn std::error::Error>> {
//! if let Some(metadata) = installer
//!     .get_unused_arakoon_metadata_and_claim("ABM", None)
//!     .await?
//! {
//!     println!("claimed {}", metadata.cluster_name);
//! }
//! # Ok(())
//! # }
//! ```

pub mod arakoon;
pub mod arakoon_config;
pub mod claim;
pub mod error;
pub mod etcd;
pub mod ports;
pub mod registry;
pub mod service;
pub mod shell;
pub mod testing;

pub use arakoon::{
    ArakoonClient, ArakoonClusterMetadata, ArakoonInstaller, ClusterType, CreateClusterRequest,
    CreateClusterResult, ExtendClusterRequest, ExtendClusterResult, INTERNAL_CONFIG_KEY,
    METADATA_KEY,
};
pub use arakoon_config::{ArakoonClusterConfig, ArakoonNodeConfig};
pub use claim::FleetMutex;
pub use error::{InstallerError, Result};
pub use etcd::{EtcdInstaller, EtcdMember};
pub use ports::PortRange;
pub use registry::{ConfigRegistry, MemoryRegistry};
pub use service::{ServiceManager, ServiceParams};
pub use shell::{OpenSshTransport, RemoteTransport, SshClient};
