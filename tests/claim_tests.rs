//! Unused-cluster scanning and the fleet-wide claim protocol

mod common;

use common::*;
use consensus_fleet::{ArakoonInstaller, CreateClusterRequest};
use std::collections::HashSet;
use std::sync::Arc;

const BASE: &str = "/m1/claim";

async fn create_started_cluster(ctx: &TestContext, name: &str, cluster_type: &str, in_use: bool) {
    let create_info = ctx
        .installer
        .create_cluster(
            CreateClusterRequest::builder()
                .cluster_name(name)
                .cluster_type(cluster_type)
                .ip(HOST_1)
                .base_dir(BASE)
                .internal(false)
                .build(),
        )
        .await
        .unwrap();
    // Starting marks the cluster as in use
    ctx.installer
        .start_cluster(&create_info.metadata, None)
        .await
        .unwrap();
    if !in_use {
        ctx.installer.unclaim_cluster(name, None).await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn unused_clusters_are_scanned_per_type() {
    let ctx = setup();
    for index in 0..3 {
        let name = format!("unittest_cluster_fwk_{}", index);
        create_started_cluster(&ctx, &name, "FWK", index == 0).await;
    }
    for index in 0..2 {
        let name = format!("unittest_cluster_abm_{}", index);
        create_started_cluster(&ctx, &name, "ABM", index == 0).await;
    }

    let err = ctx
        .installer
        .get_unused_arakoon_clusters("UNKNOWN")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("ABM, FWK, NSM, SD"));
    // CFG clusters are not claimable
    let err = ctx
        .installer
        .get_unused_arakoon_clusters("CFG")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("ABM, FWK, NSM, SD"));

    let unused_fwk = ctx.installer.get_unused_arakoon_clusters("FWK").await.unwrap();
    let unused_abm = ctx.installer.get_unused_arakoon_clusters("ABM").await.unwrap();
    assert_eq!(unused_fwk.len(), 2);
    assert_eq!(unused_abm.len(), 1);
    assert_eq!(unused_abm[0].cluster_name, "unittest_cluster_abm_1");
    assert!(unused_fwk.iter().all(|metadata| !metadata.in_use && !metadata.internal));
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_claimers_never_share_a_cluster() {
    let ctx = setup();
    let cluster_names: Vec<String> = (0..3)
        .map(|index| format!("unittest_cluster_claim_{}", index))
        .collect();
    for name in &cluster_names {
        create_started_cluster(&ctx, name, "ABM", false).await;
    }

    let installer = Arc::new(ArakoonInstaller::new(
        ctx.registry.clone(),
        ctx.fleet.clone(),
    ));
    let mut handles = Vec::new();
    for _ in 0..10 {
        let installer = installer.clone();
        handles.push(tokio::spawn(async move {
            installer
                .get_unused_arakoon_metadata_and_claim("ABM", None)
                .await
                .unwrap()
        }));
    }

    let mut claimed = Vec::new();
    let mut empty_handed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Some(metadata) => {
                assert!(metadata.in_use);
                claimed.push(metadata.cluster_name);
            }
            None => empty_handed += 1,
        }
    }

    // Every free cluster claimed exactly once; callers past the third get
    // nothing, not an error
    assert_eq!(claimed.len(), 3);
    assert_eq!(empty_handed, 7);
    let distinct: HashSet<&String> = claimed.iter().collect();
    assert_eq!(distinct.len(), 3);
    for name in &cluster_names {
        let metadata: serde_json::Value = serde_json::from_str(
            &ctx.fleet
                .engine_value(name, consensus_fleet::METADATA_KEY)
                .unwrap(),
        )
        .unwrap();
        assert_eq!(metadata["in_use"], serde_json::json!(true));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn claiming_a_specific_cluster_succeeds_exactly_once() {
    let ctx = setup();
    for index in 0..3 {
        let name = format!("unittest_cluster_named_{}", index);
        create_started_cluster(&ctx, &name, "ABM", false).await;
    }
    let target = "unittest_cluster_named_1";

    let installer = Arc::new(ArakoonInstaller::new(
        ctx.registry.clone(),
        ctx.fleet.clone(),
    ));
    let mut handles = Vec::new();
    for _ in 0..10 {
        let installer = installer.clone();
        handles.push(tokio::spawn(async move {
            installer
                .get_unused_arakoon_metadata_and_claim("ABM", Some(target))
                .await
                .unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if let Some(metadata) = handle.await.unwrap() {
            assert_eq!(metadata.cluster_name, target);
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    // The other clusters are untouched
    for name in ["unittest_cluster_named_0", "unittest_cluster_named_2"] {
        let metadata: serde_json::Value = serde_json::from_str(
            &ctx.fleet
                .engine_value(name, consensus_fleet::METADATA_KEY)
                .unwrap(),
        )
        .unwrap();
        assert_eq!(metadata["in_use"], serde_json::json!(false));
    }
}

#[tokio::test]
async fn claiming_with_nothing_free_returns_empty() {
    let ctx = setup();
    create_started_cluster(&ctx, "unittest_cluster_busy", "ABM", true).await;
    let claimed = ctx
        .installer
        .get_unused_arakoon_metadata_and_claim("ABM", None)
        .await
        .unwrap();
    assert!(claimed.is_none());
}
