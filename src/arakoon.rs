//! Arakoon cluster lifecycle management
//!
//! Top-level orchestrator for Arakoon clusters: create, start, extend,
//! shrink, delete, claim and unclaim, coordinating the remote shell, the
//! service manager, the port planner and the cluster config model. The
//! consensus engine itself is external; it is driven through the `arakoon`
//! binary on the member hosts.

use crate::arakoon_config::{ArakoonClusterConfig, ArakoonNodeConfig, config_key};
use crate::claim::FleetMutex;
use crate::error::{InstallerError, Result};
use crate::ports::{PortRange, get_free_ports};
use crate::registry::ConfigRegistry;
use crate::service::{ServiceManager, ServiceParams};
use crate::shell::{RemoteTransport, SshClient};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use typed_builder::TypedBuilder;

/// Key inside the engine holding the cluster's own config, byte-identical
/// to the published one
pub const INTERNAL_CONFIG_KEY: &str = "__ovs_config";

/// Key inside the engine holding the cluster metadata document
pub const METADATA_KEY: &str = "__ovs_metadata";

/// Owner of the engine's files and services on member hosts
const ENGINE_USER: &str = "ovs";
const ENGINE_GROUP: &str = "ovs";

const DEFAULT_PORT_RANGE: PortRange = PortRange::Span(26400, 26499);

/// Bounded wait for the fleet-wide claim mutex
const CLAIM_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Bounded wait for the per-cluster installer mutex
const CLUSTER_LOCK_TIMEOUT: Duration = Duration::from_secs(120);

/// Flavor of an Arakoon cluster, fixed at create time.
///
/// The flavor selects the config storage location and the plugin policy:
/// FWK/SD carry no plugins, ABM/NSM carry a plugin mapping, CFG is stored
/// as a flat file on every member instead of in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ClusterType {
    Abm,
    Cfg,
    Fwk,
    Nsm,
    Sd,
}

impl ClusterType {
    pub const ALL: [ClusterType; 5] = [
        ClusterType::Abm,
        ClusterType::Cfg,
        ClusterType::Fwk,
        ClusterType::Nsm,
        ClusterType::Sd,
    ];

    /// Types eligible for the claim protocol (everything but CFG)
    pub const CLAIMABLE: [ClusterType; 4] = [
        ClusterType::Abm,
        ClusterType::Fwk,
        ClusterType::Nsm,
        ClusterType::Sd,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterType::Abm => "ABM",
            ClusterType::Cfg => "CFG",
            ClusterType::Fwk => "FWK",
            ClusterType::Nsm => "NSM",
            ClusterType::Sd => "SD",
        }
    }
}

impl std::fmt::Display for ClusterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClusterType {
    type Err = InstallerError;

    fn from_str(value: &str) -> Result<Self> {
        ClusterType::ALL
            .iter()
            .find(|candidate| candidate.as_str() == value)
            .copied()
            .ok_or_else(|| {
                InstallerError::InvalidArgument(format!(
                    "Cluster type {} is not supported, please choose one of: {}",
                    value,
                    ClusterType::ALL.map(|t| t.as_str()).join(", ")
                ))
            })
    }
}

fn parse_claimable_type(value: &str) -> Result<ClusterType> {
    match ClusterType::from_str(value) {
        Ok(cluster_type) if cluster_type != ClusterType::Cfg => Ok(cluster_type),
        _ => Err(InstallerError::InvalidArgument(format!(
            "Cluster type {} is not supported, please choose one of: {}",
            value,
            ClusterType::CLAIMABLE.map(|t| t.as_str()).join(", ")
        ))),
    }
}

/// Cluster metadata document, stored inside the engine under
/// [`METADATA_KEY`] once the cluster runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArakoonClusterMetadata {
    pub cluster_name: String,
    pub cluster_type: ClusterType,
    pub in_use: bool,
    pub internal: bool,
}

#[derive(Debug, TypedBuilder)]
pub struct CreateClusterRequest {
    #[builder(setter(into))]
    pub cluster_name: String,
    /// One of ABM, CFG, FWK, NSM, SD
    #[builder(setter(into))]
    pub cluster_type: String,
    /// Host the first member lands on
    #[builder(setter(into))]
    pub ip: String,
    #[builder(setter(into))]
    pub base_dir: String,
    /// Mapping of plugin name to a shell fragment emitting a version string
    #[builder(default, setter(strip_option))]
    pub plugins: Option<Value>,
    #[builder(default, setter(strip_option))]
    pub port_range: Option<Vec<PortRange>>,
    /// Internal clusters are lifecycle-managed by this system
    #[builder(default = true)]
    pub internal: bool,
}

#[derive(Debug, TypedBuilder)]
pub struct ExtendClusterRequest {
    #[builder(setter(into))]
    pub cluster_name: String,
    #[builder(setter(into))]
    pub new_ip: String,
    #[builder(setter(into))]
    pub base_dir: String,
    #[builder(default, setter(strip_option))]
    pub plugins: Option<Value>,
    #[builder(default, setter(strip_option))]
    pub port_range: Option<Vec<PortRange>>,
    /// Existing member to read the config from; mandatory for
    /// filesystem-backed clusters
    #[builder(default, setter(strip_option, into))]
    pub ip: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreateClusterResult {
    pub ports: Vec<u16>,
    pub metadata: ArakoonClusterMetadata,
    pub service_metadata: ServiceParams,
}

#[derive(Debug, Clone)]
pub struct ExtendClusterResult {
    pub ports: Vec<u16>,
    pub service_metadata: ServiceParams,
}

/// Key/value client bound to a cluster's current membership.
///
/// Operations are executed by the external `arakoon` binary on a member
/// host, so every mutation is linearized by the engine's consensus.
#[derive(Debug)]
pub struct ArakoonClient {
    shell: SshClient,
    config_ref: String,
}

impl ArakoonClient {
    fn new(config: &ArakoonClusterConfig, transport: Arc<dyn RemoteTransport>) -> Result<Self> {
        let node = config.nodes.first().ok_or_else(|| {
            InstallerError::NotFound(format!("Cluster {} has no members", config.cluster_id))
        })?;
        Ok(ArakoonClient {
            shell: SshClient::new(transport, &node.ip),
            config_ref: engine_config_ref(config),
        })
    }

    pub async fn get(&self, key: &str) -> Result<String> {
        self.shell
            .run(&format!("arakoon -config {} --get {}", self.config_ref, key))
            .await
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.shell
            .run_with_input(
                &format!("arakoon -config {} --set {}", self.config_ref, key),
                value.as_bytes(),
            )
            .await?;
        Ok(())
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        let output = self
            .shell
            .run(&format!(
                "arakoon -config {} --exists {}",
                self.config_ref, key
            ))
            .await?;
        Ok(output.trim() == "true")
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.shell
            .run(&format!(
                "arakoon -config {} --delete {}",
                self.config_ref, key
            ))
            .await?;
        Ok(())
    }

    /// Name of the current master; errors while the cluster has none
    pub async fn who_master(&self) -> Result<String> {
        let output = self
            .shell
            .run(&format!("arakoon -config {} --who-master", self.config_ref))
            .await?;
        Ok(output.trim().to_string())
    }
}

/// Config reference handed to the engine binary: registry URL for
/// registry-backed clusters, flat INI path for filesystem-backed ones
fn engine_config_ref(config: &ArakoonClusterConfig) -> String {
    if config.is_filesystem() {
        config.internal_config_path()
    } else {
        format!(
            "file://opt/OpenvStorage/config/framework.json?key={}",
            config.config_key()
        )
    }
}

/// Arakoon cluster installer.
///
/// Stateless between calls: the authoritative state is the configuration
/// registry plus the remote filesystems, re-read at the start of every
/// operation.
pub struct ArakoonInstaller {
    registry: Arc<dyn ConfigRegistry>,
    transport: Arc<dyn RemoteTransport>,
    services: ServiceManager,
}

impl ArakoonInstaller {
    pub fn new(registry: Arc<dyn ConfigRegistry>, transport: Arc<dyn RemoteTransport>) -> Self {
        let services = ServiceManager::new(registry.clone());
        ArakoonInstaller {
            registry,
            transport,
            services,
        }
    }

    /// Service unit name for a cluster
    pub fn get_service_name_for_cluster(cluster_name: &str) -> String {
        format!("arakoon-{}", cluster_name)
    }

    fn client(&self, ip: &str) -> SshClient {
        SshClient::new(self.transport.clone(), ip)
    }

    /// Run `operation` under the per-cluster installer mutex.
    ///
    /// No two installer operations may touch the same cluster's registry
    /// entries and remote files at once; acquisition is bounded.
    async fn with_cluster_lock<T>(
        &self,
        cluster_name: &str,
        operation: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let mut mutex = FleetMutex::new(
            self.registry.clone(),
            format!("arakoon_install_{}", cluster_name),
        );
        mutex.acquire(CLUSTER_LOCK_TIMEOUT).await?;
        let outcome = operation.await;
        match outcome {
            Ok(value) => {
                mutex.release().await?;
                Ok(value)
            }
            Err(err) => {
                let _ = mutex.release().await;
                Err(err)
            }
        }
    }

    /// Create a new single-node cluster in state halted.
    pub async fn create_cluster(&self, request: CreateClusterRequest) -> Result<CreateClusterResult> {
        let cluster_name = request.cluster_name.clone();
        self.with_cluster_lock(&cluster_name, self.do_create_cluster(request))
            .await
    }

    async fn do_create_cluster(&self, request: CreateClusterRequest) -> Result<CreateClusterResult> {
        let cluster_type = ClusterType::from_str(&request.cluster_type)?;
        let (plugin_names, plugin_commands) = validate_plugins(request.plugins.as_ref())?;
        let cluster_name = &request.cluster_name;
        info!("Creating cluster {} on {}", cluster_name, request.ip);

        let filesystem = cluster_type == ClusterType::Cfg;
        let client = self.client(&request.ip);
        let exists = if filesystem {
            client
                .file_exists(&crate::arakoon_config::internal_config_file(cluster_name))
                .await?
        } else {
            self.registry.exists(&config_key(cluster_name)).await?
        };
        if exists {
            return Err(InstallerError::InvalidArgument(format!(
                "\"{}\" already exists",
                cluster_name
            )));
        }

        let ranges = self.port_ranges_for(&client, request.port_range).await?;
        let ports = get_free_ports(&client, &ranges, &[], 2).await?;

        let mut config = ArakoonClusterConfig::new(
            cluster_name.clone(),
            filesystem.then(|| request.ip.clone()),
        );
        config.plugins = plugin_names;
        let node = ArakoonNodeConfig::new(
            "1",
            &request.ip,
            ports[0],
            ports[1],
            &request.base_dir,
            cluster_name,
        );

        self.prepare_node_directories(&client, &node).await?;
        let service_metadata = self
            .install_node_service(&client, &config, &node, &plugin_commands)
            .await?;
        if !filesystem {
            let machine_id = client.machine_id().await?;
            self.services
                .register_service(&machine_id, &service_metadata)
                .await?;
        }

        config.nodes.push(node);
        config.save(self.registry.as_ref(), &self.transport).await?;

        let metadata = ArakoonClusterMetadata {
            cluster_name: cluster_name.clone(),
            cluster_type,
            in_use: true,
            internal: request.internal,
        };
        info!("Creating cluster {} on {} completed", cluster_name, request.ip);
        Ok(CreateClusterResult {
            ports,
            metadata,
            service_metadata,
        })
    }

    /// Start every member service and publish the metadata and config
    /// documents into the engine once it reports healthy.
    pub async fn start_cluster(
        &self,
        metadata: &ArakoonClusterMetadata,
        ip: Option<&str>,
    ) -> Result<()> {
        self.with_cluster_lock(&metadata.cluster_name, self.do_start_cluster(metadata, ip))
            .await
    }

    async fn do_start_cluster(
        &self,
        metadata: &ArakoonClusterMetadata,
        ip: Option<&str>,
    ) -> Result<()> {
        let source_ip = if metadata.cluster_type == ClusterType::Cfg {
            Some(ip.ok_or_else(|| {
                InstallerError::NotFound(format!(
                    "No ip provided for filesystem-backed cluster {}",
                    metadata.cluster_name
                ))
            })?)
        } else {
            None
        };
        let config = self.load_config(&metadata.cluster_name, source_ip).await?;

        let service_name = Self::get_service_name_for_cluster(&metadata.cluster_name);
        futures::future::try_join_all(config.nodes.iter().map(|node| {
            let client = self.client(&node.ip);
            let service_name = service_name.clone();
            async move { self.services.start_service(&service_name, &client).await }
        }))
        .await?;

        let client = ArakoonClient::new(&config, self.transport.clone())?;
        self.wait_until_healthy(&metadata.cluster_name, &client).await?;
        client
            .set(METADATA_KEY, &serde_json::to_string(metadata)?)
            .await?;
        client.set(INTERNAL_CONFIG_KEY, &config.serialize()).await?;
        Ok(())
    }

    /// Add a member to an existing cluster; the new service stays halted
    /// until [`ArakoonInstaller::restart_cluster_add`] runs its catch-up.
    pub async fn extend_cluster(&self, request: ExtendClusterRequest) -> Result<ExtendClusterResult> {
        let cluster_name = request.cluster_name.clone();
        self.with_cluster_lock(&cluster_name, self.do_extend_cluster(request))
            .await
    }

    async fn do_extend_cluster(&self, request: ExtendClusterRequest) -> Result<ExtendClusterResult> {
        let (plugin_names, plugin_commands) = validate_plugins(request.plugins.as_ref())?;
        let cluster_name = &request.cluster_name;
        info!("Extending cluster {} to {}", cluster_name, request.new_ip);

        let mut config = self
            .load_config(cluster_name, request.ip.as_deref())
            .await?;
        if plugin_names != config.plugins {
            return Err(InstallerError::InvalidArgument(format!(
                "Plugins do not match the plugins of cluster {}",
                cluster_name
            )));
        }

        let node_name = (config
            .nodes
            .iter()
            .filter_map(|node| node.name.parse::<u64>().ok())
            .max()
            .unwrap_or(0)
            + 1)
        .to_string();

        let client = self.client(&request.new_ip);
        let ranges = self.port_ranges_for(&client, request.port_range).await?;
        // Other members on the same host must keep their ports to themselves
        let exclude: Vec<u16> = config
            .nodes
            .iter()
            .filter(|node| node.ip == request.new_ip)
            .flat_map(|node| [node.client_port, node.messaging_port])
            .collect();
        let ports = get_free_ports(&client, &ranges, &exclude, 2).await?;

        let node = ArakoonNodeConfig::new(
            node_name,
            &request.new_ip,
            ports[0],
            ports[1],
            &request.base_dir,
            cluster_name,
        );
        self.prepare_node_directories(&client, &node).await?;
        let service_metadata = self
            .install_node_service(&client, &config, &node, &plugin_commands)
            .await?;
        if !config.is_filesystem() {
            let machine_id = client.machine_id().await?;
            self.services
                .register_service(&machine_id, &service_metadata)
                .await?;
        }

        config.nodes.push(node);
        config.save(self.registry.as_ref(), &self.transport).await?;

        info!("Extending cluster {} to {} completed", cluster_name, request.new_ip);
        Ok(ExtendClusterResult {
            ports,
            service_metadata,
        })
    }

    /// Catch the new member up, start it, and roll the rest of the cluster.
    ///
    /// `current_ips` may or may not already contain `new_ip`; the catch-up
    /// command is emitted for `new_ip` either way and the new member is
    /// never restarted twice.
    pub async fn restart_cluster_add(
        &self,
        cluster_name: &str,
        current_ips: &[String],
        new_ip: &str,
    ) -> Result<()> {
        self.with_cluster_lock(
            cluster_name,
            self.do_restart_cluster_add(cluster_name, current_ips, new_ip),
        )
        .await
    }

    async fn do_restart_cluster_add(
        &self,
        cluster_name: &str,
        current_ips: &[String],
        new_ip: &str,
    ) -> Result<()> {
        let config = if self.registry.exists(&config_key(cluster_name)).await? {
            self.load_config(cluster_name, None).await?
        } else {
            self.load_config(cluster_name, Some(new_ip)).await?
        };
        let node = config
            .nodes
            .iter()
            .find(|node| node.ip == new_ip)
            .ok_or_else(|| {
                InstallerError::NotFound(format!(
                    "Node with ip {} is not a member of cluster {}",
                    new_ip, cluster_name
                ))
            })?;

        let catchup = format!(
            "arakoon --node {} -config {} -catchup-only",
            node.name,
            engine_config_ref(&config)
        );
        debug!("Catching up node {} of cluster {}", node.name, cluster_name);
        self.client(new_ip).run(&catchup).await?;

        let service_name = Self::get_service_name_for_cluster(cluster_name);
        self.services
            .start_service(&service_name, &self.client(new_ip))
            .await?;
        for ip in current_ips {
            if ip != new_ip {
                self.services
                    .restart_service(&service_name, &self.client(ip))
                    .await?;
            }
        }

        let client = ArakoonClient::new(&config, self.transport.clone())?;
        self.wait_until_healthy(cluster_name, &client).await?;
        client.set(INTERNAL_CONFIG_KEY, &config.serialize()).await?;
        Ok(())
    }

    /// Remove the member on `ip` from the cluster.
    ///
    /// For filesystem-backed clusters `remaining_ip` must name a surviving
    /// member. The member's db and tlog trees are removed; the cluster
    /// directory itself stays behind, empty.
    pub async fn shrink_cluster(
        &self,
        cluster_name: &str,
        ip: &str,
        remaining_ip: Option<&str>,
    ) -> Result<()> {
        self.with_cluster_lock(
            cluster_name,
            self.do_shrink_cluster(cluster_name, ip, remaining_ip),
        )
        .await
    }

    async fn do_shrink_cluster(
        &self,
        cluster_name: &str,
        ip: &str,
        remaining_ip: Option<&str>,
    ) -> Result<()> {
        info!("Shrinking cluster {} on {}", cluster_name, ip);
        let mut config = self.load_config(cluster_name, remaining_ip).await?;
        let position = config
            .nodes
            .iter()
            .position(|node| node.ip == ip)
            .ok_or_else(|| {
                InstallerError::NotFound(format!(
                    "Node with ip {} is not a member of cluster {}",
                    ip, cluster_name
                ))
            })?;
        let removed = config.nodes.remove(position);

        let client = self.client(ip);
        self.teardown_node(&client, cluster_name, &removed).await?;
        if config.is_filesystem() {
            client.file_delete(&config.internal_config_path()).await?;
        }

        config.save(self.registry.as_ref(), &self.transport).await?;
        if !config.nodes.is_empty() {
            let engine = ArakoonClient::new(&config, self.transport.clone())?;
            engine
                .set(INTERNAL_CONFIG_KEY, &config.serialize())
                .await?;
        }
        info!("Shrinking cluster {} on {} completed", cluster_name, ip);
        Ok(())
    }

    /// Tear the whole cluster down and remove its stored config.
    pub async fn delete_cluster(&self, cluster_name: &str, ip: Option<&str>) -> Result<()> {
        self.with_cluster_lock(cluster_name, self.do_delete_cluster(cluster_name, ip))
            .await
    }

    async fn do_delete_cluster(&self, cluster_name: &str, ip: Option<&str>) -> Result<()> {
        info!("Deleting cluster {}", cluster_name);
        let config = self.load_config(cluster_name, ip).await?;
        futures::future::try_join_all(config.nodes.iter().map(|node| {
            let client = self.client(&node.ip);
            async move { self.teardown_node(&client, cluster_name, node).await }
        }))
        .await?;
        config.delete(self.registry.as_ref(), &self.transport).await?;
        info!("Deleting cluster {} completed", cluster_name);
        Ok(())
    }

    /// Mark the cluster as in use inside the engine.
    pub async fn claim_cluster(&self, cluster_name: &str, ip: Option<&str>) -> Result<()> {
        self.set_in_use(cluster_name, ip, true).await
    }

    /// Mark the cluster as no longer in use inside the engine.
    pub async fn unclaim_cluster(&self, cluster_name: &str, ip: Option<&str>) -> Result<()> {
        self.set_in_use(cluster_name, ip, false).await
    }

    /// Key/value client bound to the cluster's current membership
    pub async fn build_client(
        &self,
        cluster_name: &str,
        source_ip: Option<&str>,
    ) -> Result<ArakoonClient> {
        let config = self.load_config(cluster_name, source_ip).await?;
        ArakoonClient::new(&config, self.transport.clone())
    }

    /// All clusters of `cluster_type` whose engine metadata says
    /// `in_use == false`, sorted by cluster name.
    pub async fn get_unused_arakoon_clusters(
        &self,
        cluster_type: &str,
    ) -> Result<Vec<ArakoonClusterMetadata>> {
        let wanted = parse_claimable_type(cluster_type)?;
        let mut names = self.registry.list("/ovs/arakoon").await?;
        names.sort();

        let mut unused = Vec::new();
        for name in names {
            let Some(config) =
                ArakoonClusterConfig::load(&name, None, self.registry.as_ref(), &self.transport)
                    .await?
            else {
                continue;
            };
            let client = match ArakoonClient::new(&config, self.transport.clone()) {
                Ok(client) => client,
                Err(_) => continue,
            };
            let raw = match client.get(METADATA_KEY).await {
                Ok(raw) => raw,
                // Not started yet, or unreachable: not claimable either way
                Err(_) => continue,
            };
            let metadata: ArakoonClusterMetadata = serde_json::from_str(&raw)?;
            if metadata.cluster_type == wanted && !metadata.in_use {
                unused.push(metadata);
            }
        }
        Ok(unused)
    }

    /// The claim protocol: pick an unused cluster of `cluster_type` (or the
    /// named one) and mark it in use, under the fleet-wide mutex.
    ///
    /// Returns `None` when nothing is free; concurrent callers never claim
    /// the same cluster.
    pub async fn get_unused_arakoon_metadata_and_claim(
        &self,
        cluster_type: &str,
        cluster_name: Option<&str>,
    ) -> Result<Option<ArakoonClusterMetadata>> {
        let wanted = parse_claimable_type(cluster_type)?;
        let lock_name = match cluster_name {
            Some(name) => format!("arakoon_claim_{}_{}", wanted, name),
            None => format!("arakoon_claim_{}", wanted),
        };

        let mut mutex = FleetMutex::new(self.registry.clone(), lock_name);
        mutex.acquire(CLAIM_LOCK_TIMEOUT).await?;
        let outcome = self.claim_locked(cluster_type, cluster_name).await;
        match outcome {
            Ok(claimed) => {
                mutex.release().await?;
                Ok(claimed)
            }
            Err(err) => {
                let _ = mutex.release().await;
                Err(err)
            }
        }
    }

    async fn claim_locked(
        &self,
        cluster_type: &str,
        cluster_name: Option<&str>,
    ) -> Result<Option<ArakoonClusterMetadata>> {
        // Candidates must be re-read inside the lock; reads taken outside
        // may be stale
        let candidates = self.get_unused_arakoon_clusters(cluster_type).await?;
        let chosen = match cluster_name {
            Some(name) => candidates
                .into_iter()
                .find(|metadata| metadata.cluster_name == name),
            None => candidates.into_iter().next(),
        };
        match chosen {
            None => Ok(None),
            Some(mut metadata) => {
                self.claim_cluster(&metadata.cluster_name, None).await?;
                metadata.in_use = true;
                Ok(Some(metadata))
            }
        }
    }

    async fn set_in_use(&self, cluster_name: &str, ip: Option<&str>, in_use: bool) -> Result<()> {
        let config = self.load_config(cluster_name, ip).await?;
        let client = ArakoonClient::new(&config, self.transport.clone())?;
        let mut metadata: ArakoonClusterMetadata =
            serde_json::from_str(&client.get(METADATA_KEY).await?)?;
        metadata.in_use = in_use;
        client
            .set(METADATA_KEY, &serde_json::to_string(&metadata)?)
            .await?;
        Ok(())
    }

    /// Load a cluster config from the location selected by `source_ip`:
    /// a member's flat file when given, the registry otherwise.
    async fn load_config(
        &self,
        cluster_name: &str,
        source_ip: Option<&str>,
    ) -> Result<ArakoonClusterConfig> {
        ArakoonClusterConfig::load(cluster_name, source_ip, self.registry.as_ref(), &self.transport)
            .await?
            .ok_or_else(|| {
                InstallerError::NotFound(format!("Cluster {} does not exist", cluster_name))
            })
    }

    async fn port_ranges_for(
        &self,
        client: &SshClient,
        requested: Option<Vec<PortRange>>,
    ) -> Result<Vec<PortRange>> {
        if let Some(ranges) = requested {
            return Ok(ranges);
        }
        let machine_id = client.machine_id().await?;
        let key = format!("/ovs/framework/hosts/{}/ports", machine_id);
        if self.registry.exists(&key).await? {
            let document: Value = serde_json::from_str(&self.registry.get(&key).await?)?;
            if let Some(ranges) = document.get("arakoon") {
                return parse_port_ranges(ranges);
            }
        }
        Ok(vec![DEFAULT_PORT_RANGE])
    }

    async fn prepare_node_directories(
        &self,
        client: &SshClient,
        node: &ArakoonNodeConfig,
    ) -> Result<()> {
        let paths = vec![node.home.clone(), node.tlog_dir.clone()];
        client.dir_create(&paths).await?;
        client.dir_chmod(&paths, 0o755, true).await?;
        client
            .dir_chown(&paths, ENGINE_USER, ENGINE_GROUP, true)
            .await?;
        Ok(())
    }

    async fn install_node_service(
        &self,
        client: &SshClient,
        config: &ArakoonClusterConfig,
        node: &ArakoonNodeConfig,
        plugin_commands: &[String],
    ) -> Result<ServiceParams> {
        let mut params = ServiceParams::new();
        params.insert("CLUSTER".into(), Value::String(config.cluster_id.clone()));
        params.insert("NODE_ID".into(), Value::String(node.name.clone()));
        params.insert(
            "CONFIG_PATH".into(),
            Value::String(engine_config_ref(config)),
        );
        params.insert("CLIENT_PORT".into(), Value::from(node.client_port));
        params.insert("MESSAGING_PORT".into(), Value::from(node.messaging_port));
        params.insert("HOME".into(), Value::String(node.home.clone()));
        params.insert("TLOG_DIR".into(), Value::String(node.tlog_dir.clone()));
        if !plugin_commands.is_empty() {
            params.insert(
                "EXTRA_VERSION_CMD".into(),
                Value::String(plugin_commands.join(";")),
            );
        }
        let service_name = Self::get_service_name_for_cluster(&config.cluster_id);
        self.services
            .add_service("arakoon", client, &params, &service_name)
            .await
    }

    /// Stop and remove a member's service, drop its registry metadata and
    /// delete its data trees, leaving the cluster directory in place.
    async fn teardown_node(
        &self,
        client: &SshClient,
        cluster_name: &str,
        node: &ArakoonNodeConfig,
    ) -> Result<()> {
        let service_name = Self::get_service_name_for_cluster(cluster_name);
        if self.services.has_service(&service_name, client).await? {
            if self.services.get_service_status(&service_name, client).await? {
                self.services.stop_service(&service_name, client).await?;
            }
            self.services.remove_service(&service_name, client).await?;
        }
        let machine_id = client.machine_id().await?;
        self.services
            .unregister_service(&machine_id, &service_name)
            .await?;
        client
            .dir_delete(&[node.home.clone(), node.tlog_dir.clone()])
            .await?;
        Ok(())
    }

    async fn wait_until_healthy(&self, cluster_name: &str, client: &ArakoonClient) -> Result<()> {
        debug!("Waiting for cluster {}", cluster_name);
        let mut tries = 5;
        let mut healthy = client.who_master().await.is_ok();
        while !healthy && tries > 0 {
            tries -= 1;
            tokio::time::sleep(Duration::from_secs((5 - tries) as u64)).await;
            healthy = client.who_master().await.is_ok();
        }
        if healthy {
            debug!("Cluster {} running", cluster_name);
            Ok(())
        } else {
            Err(InstallerError::HealthCheck(format!(
                "Arakoon cluster {} could not be started correctly",
                cluster_name
            )))
        }
    }
}

/// Validate the plugin mapping shape and split it into names and version
/// commands, both in insertion order.
fn validate_plugins(plugins: Option<&Value>) -> Result<(Vec<String>, Vec<String>)> {
    match plugins {
        None => Ok((Vec::new(), Vec::new())),
        Some(value) => {
            let object = value.as_object().ok_or_else(|| {
                InstallerError::InvalidArgument("Plugins should be a dict".to_string())
            })?;
            let names = object.keys().cloned().collect();
            let commands = object
                .values()
                .map(|command| match command {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                })
                .collect();
            Ok((names, commands))
        }
    }
}

fn parse_port_ranges(value: &Value) -> Result<Vec<PortRange>> {
    let items = value.as_array().ok_or_else(|| {
        InstallerError::ConfigParse("Port range document is not a list".to_string())
    })?;
    let mut ranges = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::Number(number) => {
                let port = number.as_u64().and_then(|p| u16::try_from(p).ok()).ok_or_else(
                    || InstallerError::ConfigParse(format!("Invalid port {}", number)),
                )?;
                ranges.push(PortRange::Single(port));
            }
            Value::Array(bounds) => {
                let parsed: Vec<u16> = bounds
                    .iter()
                    .filter_map(|bound| bound.as_u64().and_then(|p| u16::try_from(p).ok()))
                    .collect();
                match parsed.as_slice() {
                    [lo, hi] => ranges.push(PortRange::Span(*lo, *hi)),
                    _ => {
                        return Err(InstallerError::ConfigParse(format!(
                            "Invalid port range {}",
                            item
                        )));
                    }
                }
            }
            other => {
                return Err(InstallerError::ConfigParse(format!(
                    "Invalid port range entry {}",
                    other
                )));
            }
        }
    }
    Ok(ranges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cluster_type_parses_and_displays() {
        assert_eq!(ClusterType::from_str("ABM").unwrap(), ClusterType::Abm);
        assert_eq!(ClusterType::Nsm.to_string(), "NSM");
        let err = ClusterType::from_str("UNKNOWN").unwrap_err();
        assert!(err.to_string().contains("ABM, CFG, FWK, NSM, SD"));
    }

    #[test]
    fn claimable_excludes_cfg() {
        let err = parse_claimable_type("CFG").unwrap_err();
        assert!(err.to_string().contains("ABM, FWK, NSM, SD"));
        assert!(!err.to_string().contains("CFG,"));
        assert_eq!(parse_claimable_type("SD").unwrap(), ClusterType::Sd);
    }

    #[test]
    fn plugins_must_be_an_object() {
        let err = validate_plugins(Some(&json!([]))).unwrap_err();
        assert_eq!(err.to_string(), "Plugins should be a dict");

        let (names, commands) =
            validate_plugins(Some(&json!({"plugin1": "command1", "plugin2": "command2"})))
                .unwrap();
        assert_eq!(names, vec!["plugin1", "plugin2"]);
        assert_eq!(commands, vec!["command1", "command2"]);
    }

    #[test]
    fn metadata_document_roundtrips() {
        let metadata = ArakoonClusterMetadata {
            cluster_name: "demo".to_string(),
            cluster_type: ClusterType::Fwk,
            in_use: true,
            internal: false,
        };
        let raw = serde_json::to_string(&metadata).unwrap();
        assert!(raw.contains("\"cluster_type\":\"FWK\""));
        assert_eq!(
            serde_json::from_str::<ArakoonClusterMetadata>(&raw).unwrap(),
            metadata
        );
    }

    #[test]
    fn port_range_documents_parse() {
        let ranges = parse_port_ranges(&json!([[26400, 26499], 30000])).unwrap();
        assert_eq!(
            ranges,
            vec![PortRange::Span(26400, 26499), PortRange::Single(30000)]
        );
        assert!(parse_port_ranges(&json!("nope")).is_err());
    }

    #[test]
    fn engine_ref_depends_on_storage_location() {
        let registry_backed = ArakoonClusterConfig::new("demo", None);
        assert_eq!(
            engine_config_ref(&registry_backed),
            "file://opt/OpenvStorage/config/framework.json?key=/ovs/arakoon/demo/config"
        );
        let filesystem = ArakoonClusterConfig::new("demo", Some("10.0.0.1".to_string()));
        assert_eq!(
            engine_config_ref(&filesystem),
            "/opt/OpenvStorage/config/arakoon_demo.ini"
        );
    }
}
