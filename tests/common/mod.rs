//! Common test utilities
#![allow(dead_code)]

use consensus_fleet::testing::{MemoryRegistry, MockFleet};
use consensus_fleet::{
    ArakoonInstaller, ClusterType, ConfigRegistry, INTERNAL_CONFIG_KEY, METADATA_KEY,
    ServiceParams,
};
use serde_json::{Value, json};
use std::sync::Arc;

pub const HOST_1: &str = "10.0.0.1";
pub const HOST_2: &str = "10.0.0.2";
pub const HOST_3: &str = "10.0.0.3";

pub const MACHINE_1: &str = "unit-1";
pub const MACHINE_2: &str = "unit-2";
pub const MACHINE_3: &str = "unit-3";

pub struct TestContext {
    pub fleet: Arc<MockFleet>,
    pub registry: Arc<MemoryRegistry>,
    pub installer: ArakoonInstaller,
}

/// Fresh three-host fleet with an empty registry
pub fn setup() -> TestContext {
    let fleet = Arc::new(MockFleet::new());
    fleet.add_host(HOST_1, MACHINE_1);
    fleet.add_host(HOST_2, MACHINE_2);
    fleet.add_host(HOST_3, MACHINE_3);
    let registry = Arc::new(MemoryRegistry::new());
    let installer = ArakoonInstaller::new(registry.clone(), fleet.clone());
    TestContext {
        fleet,
        registry,
        installer,
    }
}

/// Expected member state used to rebuild the canonical config text
pub struct NodeExpectation {
    pub name: &'static str,
    pub ip: &'static str,
    pub base_dir: &'static str,
    pub ports: Vec<u16>,
}

impl NodeExpectation {
    pub fn new(name: &'static str, ip: &'static str, base_dir: &'static str, ports: &[u16]) -> Self {
        NodeExpectation {
            name,
            ip,
            base_dir,
            ports: ports.to_vec(),
        }
    }
}

/// The canonical serialized config for the given membership
pub fn expected_cluster_config(
    cluster_name: &str,
    plugins: &str,
    nodes: &[NodeExpectation],
) -> String {
    let mut expected = format!(
        "[global]\n\
         cluster = {}\n\
         cluster_id = {}\n\
         plugins = {}\n\
         tlog_max_entries = 5000\n\n",
        nodes
            .iter()
            .map(|node| node.name)
            .collect::<Vec<_>>()
            .join(","),
        cluster_name,
        plugins
    );
    for node in nodes {
        expected.push_str(&format!(
            "[{name}]\n\
             client_port = {client_port}\n\
             crash_log_sinks = console:\n\
             fsync = true\n\
             home = {base_dir}/arakoon/{cluster}/db\n\
             ip = {ip}\n\
             log_level = info\n\
             log_sinks = console:\n\
             messaging_port = {messaging_port}\n\
             name = {name}\n\
             tlog_compression = snappy\n\
             tlog_dir = {base_dir}/arakoon/{cluster}/tlogs\n\n",
            name = node.name,
            client_port = node.ports[0],
            messaging_port = node.ports[1],
            base_dir = node.base_dir,
            ip = node.ip,
            cluster = cluster_name,
        ));
    }
    expected
}

/// Directory tree of a live member, rooted at its base dir
pub fn expected_tree(cluster_name: &str) -> Value {
    json!({
        "files": [],
        "dirs": {
            "arakoon": {
                "files": [],
                "dirs": {
                    cluster_name: {
                        "files": [],
                        "dirs": {
                            "db": {"dirs": {}, "files": []},
                            "tlogs": {"dirs": {}, "files": []},
                        }
                    }
                }
            }
        }
    })
}

/// Directory tree after a member was removed: the cluster directory stays,
/// empty
pub fn expected_tree_after_removal(cluster_name: &str) -> Value {
    json!({
        "files": [],
        "dirs": {
            "arakoon": {
                "files": [],
                "dirs": {
                    cluster_name: {"dirs": {}, "files": []}
                }
            }
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Running,
    Halted,
    Missing,
}

/// Assert a member's service state on a host, and that its metadata in the
/// registry matches `service_metadata` (absent when `None`).
pub async fn assert_service(
    ctx: &TestContext,
    host: &str,
    machine_id: &str,
    cluster_name: &str,
    status: ServiceStatus,
    service_metadata: Option<&ServiceParams>,
) {
    let service_name = ArakoonInstaller::get_service_name_for_cluster(cluster_name);
    let state = ctx.fleet.service_state(host, &service_name);
    match status {
        ServiceStatus::Running => assert_eq!(state, Some(true), "{} on {}", service_name, host),
        ServiceStatus::Halted => assert_eq!(state, Some(false), "{} on {}", service_name, host),
        ServiceStatus::Missing => assert_eq!(state, None, "{} on {}", service_name, host),
    }

    let key = format!(
        "/ovs/framework/hosts/{}/services/{}",
        machine_id, service_name
    );
    let registered = ctx.registry.exists(&key).await.unwrap();
    assert_eq!(
        registered,
        service_metadata.is_some(),
        "registration of {} on {}",
        service_name,
        machine_id
    );
    if let Some(expected) = service_metadata {
        let stored: Value = serde_json::from_str(&ctx.registry.get(&key).await.unwrap()).unwrap();
        assert_eq!(stored, Value::Object(expected.clone()));
    }
}

/// Assert the stored config, and the engine's internal copy, equal the
/// canonical text for the given membership.
pub async fn assert_config(
    ctx: &TestContext,
    cluster_name: &str,
    plugins: &str,
    nodes: &[NodeExpectation],
    filesystem: bool,
) {
    let expected = expected_cluster_config(cluster_name, plugins, nodes);
    let actual = if filesystem {
        ctx.fleet.file_content(
            nodes[0].ip,
            &format!("/opt/OpenvStorage/config/arakoon_{}.ini", cluster_name),
        )
    } else {
        ctx.registry
            .get(&format!("/ovs/arakoon/{}/config", cluster_name))
            .await
            .unwrap()
    };
    pretty_assertions::assert_eq!(actual, expected);
    pretty_assertions::assert_eq!(
        ctx.fleet
            .engine_value(cluster_name, INTERNAL_CONFIG_KEY)
            .expect("engine holds its config"),
        expected
    );
    assert!(ctx.fleet.engine_value(cluster_name, METADATA_KEY).is_some());
}

/// Assert the metadata document inside the engine
pub fn assert_metadata(
    ctx: &TestContext,
    cluster_name: &str,
    cluster_type: ClusterType,
    in_use: bool,
    internal: bool,
) {
    let raw = ctx
        .fleet
        .engine_value(cluster_name, METADATA_KEY)
        .expect("engine holds metadata");
    let stored: Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(
        stored,
        json!({
            "cluster_name": cluster_name,
            "cluster_type": cluster_type.as_str(),
            "in_use": in_use,
            "internal": internal,
        })
    );
}
