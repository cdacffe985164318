//! Arakoon cluster configuration model
//!
//! Pure data plus the INI-shaped codec. Depending on the cluster flavor the
//! canonical text lives either under a registry key or as a flat file on
//! every member node; the flavor is encoded by `source_ip` (`Some` means
//! filesystem-backed).

use crate::error::{InstallerError, Result};
use crate::registry::ConfigRegistry;
use crate::shell::{RemoteTransport, SshClient};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Transaction log rollover size, fixed fleet-wide
pub const TLOG_MAX_ENTRIES: u32 = 5000;

/// Registry key holding the config of a non-filesystem cluster
pub fn config_key(cluster_name: &str) -> String {
    format!("/ovs/arakoon/{}/config", cluster_name)
}

/// Flat-file path of a filesystem-backed cluster's config on a member
pub fn internal_config_file(cluster_name: &str) -> String {
    format!("/opt/OpenvStorage/config/arakoon_{}.ini", cluster_name)
}

/// One member record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArakoonNodeConfig {
    pub name: String,
    pub ip: String,
    pub client_port: u16,
    pub messaging_port: u16,
    pub home: String,
    pub tlog_dir: String,
}

impl ArakoonNodeConfig {
    /// Build a node record with the standard directory layout under `base_dir`.
    pub fn new(
        name: impl Into<String>,
        ip: impl Into<String>,
        client_port: u16,
        messaging_port: u16,
        base_dir: &str,
        cluster_name: &str,
    ) -> Self {
        let base_dir = base_dir.trim_end_matches('/');
        ArakoonNodeConfig {
            name: name.into(),
            ip: ip.into(),
            client_port,
            messaging_port,
            home: format!("{}/arakoon/{}/db", base_dir, cluster_name),
            tlog_dir: format!("{}/arakoon/{}/tlogs", base_dir, cluster_name),
        }
    }
}

/// In-memory model of one Arakoon cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArakoonClusterConfig {
    pub cluster_id: String,
    /// `Some` for filesystem-backed clusters; every load/save then goes
    /// through a member's flat file instead of the registry
    pub source_ip: Option<String>,
    /// Plugin names, insertion order
    pub plugins: Vec<String>,
    pub nodes: Vec<ArakoonNodeConfig>,
}

impl ArakoonClusterConfig {
    pub fn new(cluster_id: impl Into<String>, source_ip: Option<String>) -> Self {
        ArakoonClusterConfig {
            cluster_id: cluster_id.into(),
            source_ip,
            plugins: Vec::new(),
            nodes: Vec::new(),
        }
    }

    pub fn is_filesystem(&self) -> bool {
        self.source_ip.is_some()
    }

    pub fn config_key(&self) -> String {
        config_key(&self.cluster_id)
    }

    pub fn internal_config_path(&self) -> String {
        internal_config_file(&self.cluster_id)
    }

    pub fn node_names(&self) -> Vec<&str> {
        self.nodes.iter().map(|node| node.name.as_str()).collect()
    }

    /// Canonical INI-shaped serialization
    pub fn serialize(&self) -> String {
        let mut output = String::new();
        output.push_str("[global]\n");
        output.push_str(&format!("cluster = {}\n", self.node_names().join(",")));
        output.push_str(&format!("cluster_id = {}\n", self.cluster_id));
        output.push_str(&format!("plugins = {}\n", self.plugins.join(",")));
        output.push_str(&format!("tlog_max_entries = {}\n", TLOG_MAX_ENTRIES));
        output.push('\n');
        for node in &self.nodes {
            output.push_str(&format!("[{}]\n", node.name));
            output.push_str(&format!("client_port = {}\n", node.client_port));
            output.push_str("crash_log_sinks = console:\n");
            output.push_str("fsync = true\n");
            output.push_str(&format!("home = {}\n", node.home));
            output.push_str(&format!("ip = {}\n", node.ip));
            output.push_str("log_level = info\n");
            output.push_str("log_sinks = console:\n");
            output.push_str(&format!("messaging_port = {}\n", node.messaging_port));
            output.push_str(&format!("name = {}\n", node.name));
            output.push_str("tlog_compression = snappy\n");
            output.push_str(&format!("tlog_dir = {}\n", node.tlog_dir));
            output.push('\n');
        }
        output
    }

    /// Parse the canonical form back into a model
    pub fn parse(cluster_id: &str, source_ip: Option<String>, text: &str) -> Result<Self> {
        let mut sections: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        let mut current: Option<String> = None;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
                current = Some(name.to_string());
                sections.entry(name.to_string()).or_default();
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                InstallerError::ConfigParse(format!("Unparsable line: {}", line))
            })?;
            let section = current.as_ref().ok_or_else(|| {
                InstallerError::ConfigParse(format!("Entry outside any section: {}", line))
            })?;
            sections
                .entry(section.clone())
                .or_default()
                .insert(key.trim().to_string(), value.trim().to_string());
        }

        let global = sections
            .get("global")
            .ok_or_else(|| InstallerError::ConfigParse("Missing [global] section".to_string()))?;
        let get_global = |key: &str| {
            global.get(key).cloned().ok_or_else(|| {
                InstallerError::ConfigParse(format!("Missing global entry {}", key))
            })
        };
        let parsed_id = get_global("cluster_id")?;
        if parsed_id != cluster_id {
            return Err(InstallerError::ConfigParse(format!(
                "Cluster id mismatch: expected {}, found {}",
                cluster_id, parsed_id
            )));
        }
        let plugins: Vec<String> = get_global("plugins")?
            .split(',')
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();

        let mut config = ArakoonClusterConfig::new(cluster_id, source_ip);
        config.plugins = plugins;
        for node_name in get_global("cluster")?.split(',').filter(|n| !n.is_empty()) {
            let section = sections.get(node_name).ok_or_else(|| {
                InstallerError::ConfigParse(format!("Missing section for node {}", node_name))
            })?;
            let get_node = |key: &str| {
                section.get(key).cloned().ok_or_else(|| {
                    InstallerError::ConfigParse(format!(
                        "Node {} is missing entry {}",
                        node_name, key
                    ))
                })
            };
            let parse_port = |key: &str| -> Result<u16> {
                get_node(key)?.parse::<u16>().map_err(|_| {
                    InstallerError::ConfigParse(format!("Node {} has invalid {}", node_name, key))
                })
            };
            config.nodes.push(ArakoonNodeConfig {
                name: get_node("name")?,
                ip: get_node("ip")?,
                client_port: parse_port("client_port")?,
                messaging_port: parse_port("messaging_port")?,
                home: get_node("home")?,
                tlog_dir: get_node("tlog_dir")?,
            });
        }
        Ok(config)
    }

    /// Load a cluster config from its storage location; `Ok(None)` when the
    /// cluster does not exist there.
    pub async fn load(
        cluster_id: &str,
        source_ip: Option<&str>,
        registry: &dyn ConfigRegistry,
        transport: &Arc<dyn RemoteTransport>,
    ) -> Result<Option<Self>> {
        match source_ip {
            Some(ip) => {
                let client = SshClient::new(transport.clone(), ip);
                let path = internal_config_file(cluster_id);
                if !client.file_exists(&path).await? {
                    return Ok(None);
                }
                let text = client.file_read(&path).await?;
                Self::parse(cluster_id, Some(ip.to_string()), &text).map(Some)
            }
            None => {
                let key = config_key(cluster_id);
                if !registry.exists(&key).await? {
                    return Ok(None);
                }
                let text = registry.get(&key).await?;
                Self::parse(cluster_id, None, &text).map(Some)
            }
        }
    }

    /// Publish the config to its storage location.
    ///
    /// Filesystem-backed clusters get the flat file rewritten on every
    /// member node; others get the registry key replaced.
    pub async fn save(
        &self,
        registry: &dyn ConfigRegistry,
        transport: &Arc<dyn RemoteTransport>,
    ) -> Result<()> {
        let text = self.serialize();
        if self.is_filesystem() {
            let path = self.internal_config_path();
            for node in &self.nodes {
                let client = SshClient::new(transport.clone(), &node.ip);
                client.file_write(&path, &text, None).await?;
            }
            Ok(())
        } else {
            registry.set(&self.config_key(), &text).await
        }
    }

    /// Remove the stored config everywhere it lives.
    pub async fn delete(
        &self,
        registry: &dyn ConfigRegistry,
        transport: &Arc<dyn RemoteTransport>,
    ) -> Result<()> {
        if self.is_filesystem() {
            let path = self.internal_config_path();
            for node in &self.nodes {
                let client = SshClient::new(transport.clone(), &node.ip);
                client.file_delete(&path).await?;
            }
            if let Some(source_ip) = &self.source_ip {
                if !self.nodes.iter().any(|node| &node.ip == source_ip) {
                    let client = SshClient::new(transport.clone(), source_ip);
                    client.file_delete(&path).await?;
                }
            }
            Ok(())
        } else {
            registry.delete(&self.config_key()).await
        }
    }
}
