//! Etcd installer tests: create, extend, shrink, proxy deployments

mod common;

use common::*;
use consensus_fleet::EtcdInstaller;
use serde_json::json;

const CLUSTER: &str = "config";
const DATA_DIR: &str = "/opt/OpenvStorage/db/etcd/config/data";
const WAL_DIR: &str = "/opt/OpenvStorage/db/etcd/config/wal";
const UNIT_PATH: &str = "/lib/systemd/system/ovs-etcd-config.service";

const MEMBER_LIST_ONE: &str =
    "ce2a822cea30bfca: name=unit-1 peerURLs=http://10.0.0.1:2380 clientURLs=http://10.0.0.1:2379\n";
const MEMBER_LIST_TWO: &str = "\
ce2a822cea30bfca: name=unit-1 peerURLs=http://10.0.0.1:2380 clientURLs=http://10.0.0.1:2379
8211f1d0f64f3269: name=unit-2 peerURLs=http://10.0.0.2:2380 clientURLs=http://10.0.0.2:2379
";

fn etcd_installer(ctx: &TestContext) -> EtcdInstaller {
    EtcdInstaller::new(ctx.registry.clone(), ctx.fleet.clone())
}

#[tokio::test]
async fn create_cluster_starts_a_single_member() {
    let ctx = setup();
    let installer = etcd_installer(&ctx);
    ctx.fleet.stub_command("etcdctl cluster-health", "cluster is healthy");

    installer.create_cluster(CLUSTER, HOST_1).await.unwrap();

    assert_eq!(ctx.fleet.service_state(HOST_1, "ovs-etcd-config"), Some(true));
    assert_eq!(
        ctx.fleet.dir_structure(HOST_1, "/opt/OpenvStorage/db/etcd/config"),
        json!({"files": [], "dirs": {"data": {"files": [], "dirs": {}}, "wal": {"files": [], "dirs": {}}}})
    );
    let unit = ctx.fleet.file_content(HOST_1, UNIT_PATH);
    assert!(unit.contains("-name unit-1"));
    assert!(unit.contains(&format!("-data-dir {}", DATA_DIR)));
    assert!(unit.contains(&format!("-wal-dir {}", WAL_DIR)));
    assert!(unit.contains("-initial-cluster unit-1=http://10.0.0.1:2380"));
    assert!(unit.contains("-initial-cluster-state new"));
    assert!(unit.contains("-initial-advertise-peer-urls http://10.0.0.1:2380"));
}

#[tokio::test]
async fn extend_cluster_joins_a_new_member() {
    let ctx = setup();
    let installer = etcd_installer(&ctx);
    ctx.fleet.stub_command("etcdctl cluster-health", "cluster is healthy");
    installer.create_cluster(CLUSTER, HOST_1).await.unwrap();

    ctx.fleet.stub_command("etcdctl member list", MEMBER_LIST_ONE);
    ctx.fleet
        .stub_command("etcdctl member add unit-2 http://10.0.0.2:2380", "");
    ctx.fleet.clear_recordings();

    installer.extend_cluster(HOST_1, HOST_2, CLUSTER).await.unwrap();

    assert!(
        ctx.fleet
            .recordings()
            .contains(&"etcdctl member add unit-2 http://10.0.0.2:2380".to_string())
    );
    assert_eq!(ctx.fleet.service_state(HOST_2, "ovs-etcd-config"), Some(true));
    let unit = ctx.fleet.file_content(HOST_2, UNIT_PATH);
    assert!(unit.contains(
        "-initial-cluster unit-1=http://10.0.0.1:2380,unit-2=http://10.0.0.2:2380"
    ));
    assert!(unit.contains("-initial-cluster-state existing"));
    assert!(!unit.contains("-initial-advertise-peer-urls"));
}

#[tokio::test]
async fn extend_refuses_an_unhealthy_cluster() {
    let ctx = setup();
    let installer = etcd_installer(&ctx);
    ctx.fleet
        .stub_command("etcdctl cluster-health", "cluster is unhealthy");

    let err = installer
        .extend_cluster(HOST_1, HOST_2, CLUSTER)
        .await
        .unwrap_err();
    assert!(err.is_precondition_failed());
}

#[tokio::test]
async fn shrink_removes_the_member_and_leaves_a_proxy() {
    let ctx = setup();
    let installer = etcd_installer(&ctx);
    ctx.fleet.stub_command("etcdctl cluster-health", "cluster is healthy");
    installer.create_cluster(CLUSTER, HOST_2).await.unwrap();

    ctx.fleet.stub_command("etcdctl member list", MEMBER_LIST_TWO);
    ctx.fleet
        .stub_command("etcdctl member remove 8211f1d0f64f3269", "");
    ctx.fleet.clear_recordings();

    installer
        .shrink_cluster(HOST_1, HOST_2, CLUSTER, &[])
        .await
        .unwrap();

    assert!(
        ctx.fleet
            .recordings()
            .contains(&"etcdctl member remove 8211f1d0f64f3269".to_string())
    );
    // The removed member was online, so it became a proxy: WAL gone, data
    // dir kept, proxy unit in place of the server unit
    assert_eq!(
        ctx.fleet.dir_structure(HOST_2, "/opt/OpenvStorage/db/etcd/config"),
        json!({"files": [], "dirs": {"data": {"files": [], "dirs": {}}}})
    );
    let unit = ctx.fleet.file_content(HOST_2, UNIT_PATH);
    assert!(unit.contains("-proxy on"));
    assert!(unit.contains(
        "-initial-cluster unit-1=http://10.0.0.1:2380,unit-2=http://10.0.0.2:2380"
    ));
    assert_eq!(ctx.fleet.service_state(HOST_2, "ovs-etcd-config"), Some(true));
}

#[tokio::test]
async fn shrink_skips_proxy_deployment_for_offline_members() {
    let ctx = setup();
    let installer = etcd_installer(&ctx);
    ctx.fleet.stub_command("etcdctl cluster-health", "cluster is healthy");
    ctx.fleet.stub_command("etcdctl member list", MEMBER_LIST_TWO);
    ctx.fleet
        .stub_command("etcdctl member remove 8211f1d0f64f3269", "");

    installer
        .shrink_cluster(HOST_1, HOST_2, CLUSTER, &[HOST_2.to_string()])
        .await
        .unwrap();

    // No proxy was installed on the offline host
    assert_eq!(ctx.fleet.service_state(HOST_2, "ovs-etcd-config"), None);
}

#[tokio::test]
async fn shrink_fails_when_the_member_is_unknown() {
    let ctx = setup();
    let installer = etcd_installer(&ctx);
    ctx.fleet.stub_command("etcdctl cluster-health", "cluster is healthy");
    ctx.fleet.stub_command("etcdctl member list", MEMBER_LIST_TWO);

    let err = installer
        .shrink_cluster(HOST_1, HOST_3, CLUSTER, &[])
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(err.to_string().contains("Could not locate 10.0.0.3"));
}

#[tokio::test]
async fn use_external_wires_a_proxy_verbatim() {
    let ctx = setup();
    let installer = etcd_installer(&ctx);
    ctx.fleet.stub_command("etcdctl cluster-health", "cluster is healthy");

    installer
        .use_external("ext-1=http://192.168.0.1:2380", HOST_3, CLUSTER)
        .await
        .unwrap();

    let unit = ctx.fleet.file_content(HOST_3, UNIT_PATH);
    assert!(unit.contains("-initial-cluster ext-1=http://192.168.0.1:2380"));
    assert_eq!(ctx.fleet.service_state(HOST_3, "ovs-etcd-config"), Some(true));
}

#[tokio::test(start_paused = true)]
async fn health_probe_gives_up_after_bounded_retries() {
    let ctx = setup();
    let installer = etcd_installer(&ctx);
    ctx.fleet
        .stub_command("etcdctl cluster-health", "cluster is unhealthy");

    let err = installer.create_cluster(CLUSTER, HOST_1).await.unwrap_err();
    assert!(err.is_health_check());
    // One initial probe plus five bounded retries
    assert_eq!(
        ctx.fleet
            .recordings()
            .iter()
            .filter(|cmd| *cmd == "etcdctl cluster-health")
            .count(),
        6
    );
}

#[tokio::test(start_paused = true)]
async fn health_probe_recovers_before_retries_are_exhausted() {
    let ctx = setup();
    let installer = etcd_installer(&ctx);
    ctx.fleet.stub_command_sequence(
        "etcdctl cluster-health",
        &["cluster may be unhealthy", "cluster is healthy"],
    );

    installer.create_cluster(CLUSTER, HOST_1).await.unwrap();
    assert_eq!(ctx.fleet.service_state(HOST_1, "ovs-etcd-config"), Some(true));
}
