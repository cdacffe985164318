//! Etcd cluster lifecycle management
//!
//! Installs and reconfigures etcd clusters across the fleet: create, extend
//! and shrink membership, plus proxy deployments for hosts that need client
//! access without voting. The engine is driven through `etcdctl` on member
//! hosts.

use crate::error::{InstallerError, Result};
use crate::registry::ConfigRegistry;
use crate::service::{ServiceManager, ServiceParams};
use crate::shell::{RemoteTransport, SshClient};
use regex::Regex;
use serde_json::Value;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{debug, info};

const DB_DIR: &str = "/opt/OpenvStorage/db";

static MEMBER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<id>[^:]+): name=(?P<name>[^ ]+) peerURLs=(?P<peer>[^ ]+) clientURLs=(?P<client>[^ ]+)$")
        .expect("member regex is valid")
});

fn data_dir(cluster_name: &str) -> String {
    format!("{}/etcd/{}/data", DB_DIR, cluster_name)
}

fn wal_dir(cluster_name: &str) -> String {
    format!("{}/etcd/{}/wal", DB_DIR, cluster_name)
}

fn server_url(ip: &str) -> String {
    format!("http://{}:2380", ip)
}

fn client_url(ip: &str) -> String {
    format!("http://{}:2379", ip)
}

/// One line of `etcdctl member list`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtcdMember {
    pub id: String,
    pub name: String,
    pub peer_url: String,
    pub client_url: String,
}

fn parse_members(output: &str) -> Result<Vec<EtcdMember>> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let captures = MEMBER_REGEX.captures(line).ok_or_else(|| {
                InstallerError::ConfigParse(format!("Unexpected member list line: {}", line))
            })?;
            Ok(EtcdMember {
                id: captures["id"].to_string(),
                name: captures["name"].to_string(),
                peer_url: captures["peer"].to_string(),
                client_url: captures["client"].to_string(),
            })
        })
        .collect()
}

/// Etcd cluster installer
pub struct EtcdInstaller {
    transport: Arc<dyn RemoteTransport>,
    services: ServiceManager,
}

impl EtcdInstaller {
    pub fn new(registry: Arc<dyn ConfigRegistry>, transport: Arc<dyn RemoteTransport>) -> Self {
        EtcdInstaller {
            transport,
            services: ServiceManager::new(registry),
        }
    }

    /// Service unit name for a cluster
    pub fn get_service_name_for_cluster(cluster_name: &str) -> String {
        format!("ovs-etcd-{}", cluster_name)
    }

    fn client(&self, ip: &str) -> SshClient {
        SshClient::new(self.transport.clone(), ip)
    }

    /// Create a single-member cluster on `ip` and wait until it is healthy.
    pub async fn create_cluster(&self, cluster_name: &str, ip: &str) -> Result<()> {
        info!("Creating cluster {} on {}", cluster_name, ip);
        let client = self.client(ip);
        let node_name = client.machine_id().await?;

        let paths = vec![data_dir(cluster_name), wal_dir(cluster_name)];
        client.dir_delete(&paths).await?;
        client.dir_create(&paths).await?;
        client.dir_chmod(&paths, 0o755, true).await?;
        client.dir_chown(&paths, "ovs", "ovs", true).await?;

        let mut params = ServiceParams::new();
        params.insert("CLUSTER".into(), Value::String(cluster_name.to_string()));
        params.insert("NODE_ID".into(), Value::String(node_name.clone()));
        params.insert("DATA_DIR".into(), Value::String(data_dir(cluster_name)));
        params.insert("WAL_DIR".into(), Value::String(wal_dir(cluster_name)));
        params.insert("SERVER_URL".into(), Value::String(server_url(ip)));
        params.insert("CLIENT_URL".into(), Value::String(client_url(ip)));
        params.insert(
            "LOCAL_CLIENT_URL".into(),
            Value::String(client_url("127.0.0.1")),
        );
        params.insert(
            "INITIAL_CLUSTER".into(),
            Value::String(format!("{}={}", node_name, server_url(ip))),
        );
        params.insert("INITIAL_STATE".into(), Value::String("new".to_string()));
        params.insert(
            "INITIAL_PEERS".into(),
            Value::String(format!("-initial-advertise-peer-urls {}", server_url(ip))),
        );
        self.services
            .add_service(
                "ovs-etcd",
                &client,
                &params,
                &Self::get_service_name_for_cluster(cluster_name),
            )
            .await?;

        self.start(cluster_name, &client).await?;
        self.wait_for_cluster(cluster_name, &client).await?;
        info!("Creating cluster {} on {} completed", cluster_name, ip);
        Ok(())
    }

    /// Join `new_ip` to the cluster reachable through `master_ip`.
    pub async fn extend_cluster(
        &self,
        master_ip: &str,
        new_ip: &str,
        cluster_name: &str,
    ) -> Result<()> {
        info!(
            "Extending cluster {} from {} to {}",
            cluster_name, master_ip, new_ip
        );
        let master_client = self.client(master_ip);
        if !self.is_healthy(cluster_name, &master_client).await {
            return Err(InstallerError::PreconditionFailed(format!(
                "Cluster {} unhealthy, aborting extend",
                cluster_name
            )));
        }

        let members = parse_members(&master_client.run("etcdctl member list").await?)?;
        let mut initial_cluster: Vec<String> = members
            .iter()
            .map(|member| format!("{}={}", member.name, member.peer_url))
            .collect();

        let client = self.client(new_ip);
        let node_name = client.machine_id().await?;
        initial_cluster.push(format!("{}={}", node_name, server_url(new_ip)));

        let paths = vec![data_dir(cluster_name), wal_dir(cluster_name)];
        client.dir_delete(&paths).await?;
        client.dir_create(&paths).await?;
        client.dir_chmod(&paths, 0o755, true).await?;
        client.dir_chown(&paths, "ovs", "ovs", true).await?;

        // A proxy may already run here; membership replaces it
        self.stop(cluster_name, &client).await?;

        let mut params = ServiceParams::new();
        params.insert("CLUSTER".into(), Value::String(cluster_name.to_string()));
        params.insert("NODE_ID".into(), Value::String(node_name.clone()));
        params.insert("DATA_DIR".into(), Value::String(data_dir(cluster_name)));
        params.insert("WAL_DIR".into(), Value::String(wal_dir(cluster_name)));
        params.insert("SERVER_URL".into(), Value::String(server_url(new_ip)));
        params.insert("CLIENT_URL".into(), Value::String(client_url(new_ip)));
        params.insert(
            "LOCAL_CLIENT_URL".into(),
            Value::String(client_url("127.0.0.1")),
        );
        params.insert(
            "INITIAL_CLUSTER".into(),
            Value::String(initial_cluster.join(",")),
        );
        params.insert(
            "INITIAL_STATE".into(),
            Value::String("existing".to_string()),
        );
        params.insert("INITIAL_PEERS".into(), Value::String(String::new()));
        self.services
            .add_service(
                "ovs-etcd",
                &client,
                &params,
                &Self::get_service_name_for_cluster(cluster_name),
            )
            .await?;

        master_client
            .run(&format!(
                "etcdctl member add {} {}",
                node_name,
                server_url(new_ip)
            ))
            .await?;
        self.start(cluster_name, &client).await?;
        self.wait_for_cluster(cluster_name, &client).await?;
        info!(
            "Extending cluster {} from {} to {} completed",
            cluster_name, master_ip, new_ip
        );
        Ok(())
    }

    /// Remove `ip_to_remove` from the cluster; online removed members are
    /// converted to proxies.
    pub async fn shrink_cluster(
        &self,
        remaining_node_ip: &str,
        ip_to_remove: &str,
        cluster_name: &str,
        offline_node_ips: &[String],
    ) -> Result<()> {
        info!("Shrinking cluster {} from {}", cluster_name, ip_to_remove);
        let client = self.client(remaining_node_ip);
        if !self.is_healthy(cluster_name, &client).await {
            return Err(InstallerError::PreconditionFailed(format!(
                "Cluster {} unhealthy, aborting shrink",
                cluster_name
            )));
        }

        let members = parse_members(&client.run("etcdctl member list").await?)?;
        let removed_client_url = client_url(ip_to_remove);
        let member = members
            .iter()
            .find(|member| member.client_url == removed_client_url)
            .ok_or_else(|| {
                InstallerError::NotFound(format!(
                    "Could not locate {} in the cluster",
                    ip_to_remove
                ))
            })?;
        client
            .run(&format!("etcdctl member remove {}", member.id))
            .await?;

        if !offline_node_ips.iter().any(|ip| ip == ip_to_remove) {
            self.deploy_to_slave(remaining_node_ip, ip_to_remove, cluster_name)
                .await?;
        }
        self.wait_for_cluster(cluster_name, &client).await?;
        info!(
            "Shrinking cluster {} from {} completed",
            cluster_name, ip_to_remove
        );
        Ok(())
    }

    /// Deploy a proxy for the cluster on `slave_ip`, learning the current
    /// membership from `master_ip`.
    pub async fn deploy_to_slave(
        &self,
        master_ip: &str,
        slave_ip: &str,
        cluster_name: &str,
    ) -> Result<()> {
        debug!(
            "Setting up proxy {} from {} to {}",
            cluster_name, master_ip, slave_ip
        );
        let master_client = self.client(master_ip);
        let members = parse_members(&master_client.run("etcdctl member list").await?)?;
        let initial_cluster: Vec<String> = members
            .iter()
            .map(|member| format!("{}={}", member.name, member.peer_url))
            .collect();
        self.setup_proxy(&initial_cluster.join(","), slave_ip, cluster_name)
            .await?;
        debug!(
            "Setting up proxy {} from {} to {} completed",
            cluster_name, master_ip, slave_ip
        );
        Ok(())
    }

    /// Deploy a proxy pointing at an externally managed cluster; the
    /// initial-cluster string is the caller's, verbatim.
    pub async fn use_external(
        &self,
        external: &str,
        slave_ip: &str,
        cluster_name: &str,
    ) -> Result<()> {
        debug!(
            "Setting up proxy {} from {} to {}",
            cluster_name, external, slave_ip
        );
        self.setup_proxy(external, slave_ip, cluster_name).await?;
        debug!(
            "Setting up proxy {} from {} to {} completed",
            cluster_name, external, slave_ip
        );
        Ok(())
    }

    async fn setup_proxy(
        &self,
        initial_cluster: &str,
        slave_ip: &str,
        cluster_name: &str,
    ) -> Result<()> {
        let client = self.client(slave_ip);
        self.stop(cluster_name, &client).await?;

        // No WAL for a proxy; the data dir is kept
        client
            .dir_delete(&[data_dir(cluster_name), wal_dir(cluster_name)])
            .await?;
        let data = vec![data_dir(cluster_name)];
        client.dir_create(&data).await?;
        client.dir_chmod(&data, 0o755, true).await?;
        client.dir_chown(&data, "ovs", "ovs", true).await?;

        let mut params = ServiceParams::new();
        params.insert("CLUSTER".into(), Value::String(cluster_name.to_string()));
        params.insert("DATA_DIR".into(), Value::String(data_dir(cluster_name)));
        params.insert(
            "LOCAL_CLIENT_URL".into(),
            Value::String(client_url("127.0.0.1")),
        );
        params.insert(
            "INITIAL_CLUSTER".into(),
            Value::String(initial_cluster.to_string()),
        );
        self.services
            .add_service(
                "ovs-etcd-proxy",
                &client,
                &params,
                &Self::get_service_name_for_cluster(cluster_name),
            )
            .await?;

        self.start(cluster_name, &client).await?;
        self.wait_for_cluster(cluster_name, &client).await?;
        Ok(())
    }

    /// Start the cluster service on a host if registered and not running
    pub async fn start(&self, cluster_name: &str, client: &SshClient) -> Result<()> {
        let name = Self::get_service_name_for_cluster(cluster_name);
        if self.services.has_service(&name, client).await?
            && !self.services.get_service_status(&name, client).await?
        {
            self.services.start_service(&name, client).await?;
        }
        Ok(())
    }

    /// Stop the cluster service on a host if registered and running
    pub async fn stop(&self, cluster_name: &str, client: &SshClient) -> Result<()> {
        let name = Self::get_service_name_for_cluster(cluster_name);
        if self.services.has_service(&name, client).await?
            && self.services.get_service_status(&name, client).await?
        {
            self.services.stop_service(&name, client).await?;
        }
        Ok(())
    }

    /// Remove the cluster service from a host if registered
    pub async fn remove(&self, cluster_name: &str, client: &SshClient) -> Result<()> {
        let name = Self::get_service_name_for_cluster(cluster_name);
        if self.services.has_service(&name, client).await? {
            self.services.remove_service(&name, client).await?;
        }
        Ok(())
    }

    /// Block until the cluster reports healthy; bounded retries with
    /// increasing sleeps, fatal on exhaustion.
    pub async fn wait_for_cluster(&self, cluster_name: &str, client: &SshClient) -> Result<()> {
        debug!("Waiting for cluster {}", cluster_name);
        let mut tries = 5;
        let mut healthy = self.is_healthy(cluster_name, client).await;
        while !healthy && tries > 0 {
            tries -= 1;
            tokio::time::sleep(Duration::from_secs((5 - tries) as u64)).await;
            healthy = self.is_healthy(cluster_name, client).await;
        }
        if healthy {
            debug!("Cluster {} running", cluster_name);
            Ok(())
        } else {
            Err(InstallerError::HealthCheck(format!(
                "Etcd cluster {} could not be started correctly",
                cluster_name
            )))
        }
    }

    async fn is_healthy(&self, cluster_name: &str, client: &SshClient) -> bool {
        match client.run("etcdctl cluster-health").await {
            Ok(output) if output.contains("cluster is healthy") => {
                debug!("Cluster {} is healthy", cluster_name);
                true
            }
            Ok(output) => {
                debug!(
                    "Cluster {} is not healthy: {}",
                    cluster_name,
                    output.lines().collect::<Vec<_>>().join(" - ")
                );
                false
            }
            Err(err) => {
                debug!("Cluster {} is not healthy: {}", cluster_name, err);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_lines_parse() {
        let output = "\
ce2a822cea30bfca: name=node-1 peerURLs=http://10.0.0.1:2380 clientURLs=http://10.0.0.1:2379
8211f1d0f64f3269: name=node-2 peerURLs=http://10.0.0.2:2380 clientURLs=http://10.0.0.2:2379
";
        let members = parse_members(output).unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].id, "ce2a822cea30bfca");
        assert_eq!(members[1].name, "node-2");
        assert_eq!(members[1].peer_url, "http://10.0.0.2:2380");
        assert_eq!(members[0].client_url, "http://10.0.0.1:2379");
    }

    #[test]
    fn malformed_member_line_is_rejected() {
        assert!(parse_members("not a member line").is_err());
    }

    #[test]
    fn directory_layout_is_per_cluster() {
        assert_eq!(data_dir("config"), "/opt/OpenvStorage/db/etcd/config/data");
        assert_eq!(wal_dir("config"), "/opt/OpenvStorage/db/etcd/config/wal");
        assert_eq!(server_url("10.0.0.1"), "http://10.0.0.1:2380");
        assert_eq!(client_url("127.0.0.1"), "http://127.0.0.1:2379");
    }
}
