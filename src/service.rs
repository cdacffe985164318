//! Service unit management on remote hosts
//!
//! Renders service units from embedded templates and drives them through
//! systemctl on the target host. Parameter mappings double as the service
//! metadata published to the configuration registry under
//! `/ovs/framework/hosts/<node>/services/<unit>`.

use crate::error::{InstallerError, Result};
use crate::registry::ConfigRegistry;
use crate::shell::SshClient;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

/// Parameter mapping for a service unit; insertion order is preserved
pub type ServiceParams = Map<String, Value>;

const UNIT_DIR: &str = "/lib/systemd/system";

const ARAKOON_TEMPLATE: &str = "\
[Unit]
Description=Arakoon consensus node <NODE_ID> of cluster <CLUSTER>
After=network.target

[Service]
Type=simple
User=ovs
Group=ovs
Environment=CLIENT_PORT=<CLIENT_PORT>
Environment=MESSAGING_PORT=<MESSAGING_PORT>
Environment=TLOG_DIR=<TLOG_DIR>
Environment='EXTRA_VERSION_CMD=<EXTRA_VERSION_CMD>'
ExecStart=/usr/bin/arakoon --node <NODE_ID> -config <CONFIG_PATH>
WorkingDirectory=<HOME>
Restart=on-failure

[Install]
WantedBy=multi-user.target
";

const ETCD_TEMPLATE: &str = "\
[Unit]
Description=Etcd member <NODE_ID> of cluster <CLUSTER>
After=network.target

[Service]
Type=simple
User=ovs
Group=ovs
ExecStart=/usr/bin/etcd -name <NODE_ID> \\
    -data-dir <DATA_DIR> \\
    -wal-dir <WAL_DIR> \\
    -listen-peer-urls <SERVER_URL> \\
    -listen-client-urls <CLIENT_URL>,<LOCAL_CLIENT_URL> \\
    -advertise-client-urls <CLIENT_URL> \\
    <INITIAL_PEERS> \\
    -initial-cluster <INITIAL_CLUSTER> \\
    -initial-cluster-state <INITIAL_STATE>
Restart=on-failure

[Install]
WantedBy=multi-user.target
";

const ETCD_PROXY_TEMPLATE: &str = "\
[Unit]
Description=Etcd proxy for cluster <CLUSTER>
After=network.target

[Service]
Type=simple
User=ovs
Group=ovs
ExecStart=/usr/bin/etcd -proxy on \\
    -data-dir <DATA_DIR> \\
    -listen-client-urls <LOCAL_CLIENT_URL> \\
    -initial-cluster <INITIAL_CLUSTER>
Restart=on-failure

[Install]
WantedBy=multi-user.target
";

#[derive(Debug)]
struct ServiceTemplate {
    base_name: &'static str,
    text: &'static str,
    required: &'static [&'static str],
    optional: &'static [&'static str],
}

const TEMPLATES: &[ServiceTemplate] = &[
    ServiceTemplate {
        base_name: "arakoon",
        text: ARAKOON_TEMPLATE,
        required: &[
            "CLUSTER",
            "NODE_ID",
            "CONFIG_PATH",
            "CLIENT_PORT",
            "MESSAGING_PORT",
            "HOME",
            "TLOG_DIR",
        ],
        optional: &["EXTRA_VERSION_CMD"],
    },
    ServiceTemplate {
        base_name: "ovs-etcd",
        text: ETCD_TEMPLATE,
        required: &[
            "CLUSTER",
            "NODE_ID",
            "DATA_DIR",
            "WAL_DIR",
            "SERVER_URL",
            "CLIENT_URL",
            "LOCAL_CLIENT_URL",
            "INITIAL_CLUSTER",
            "INITIAL_STATE",
        ],
        optional: &["INITIAL_PEERS"],
    },
    ServiceTemplate {
        base_name: "ovs-etcd-proxy",
        text: ETCD_PROXY_TEMPLATE,
        required: &["CLUSTER", "DATA_DIR", "LOCAL_CLIENT_URL", "INITIAL_CLUSTER"],
        optional: &[],
    },
];

fn template_for(base_name: &str) -> Result<&'static ServiceTemplate> {
    TEMPLATES
        .iter()
        .find(|template| template.base_name == base_name)
        .ok_or_else(|| InstallerError::NotFound(format!("Unknown service template {}", base_name)))
}

fn param_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn unit_path(name: &str) -> String {
    format!("{}/{}.service", UNIT_DIR, name)
}

/// Registers, inspects and drives service units on remote hosts.
#[derive(Clone)]
pub struct ServiceManager {
    registry: Arc<dyn ConfigRegistry>,
}

impl ServiceManager {
    pub fn new(registry: Arc<dyn ConfigRegistry>) -> Self {
        ServiceManager { registry }
    }

    /// Registry key for a service's metadata on a node
    pub fn service_key(node_name: &str, service_name: &str) -> String {
        format!("/ovs/framework/hosts/{}/services/{}", node_name, service_name)
    }

    /// Render the `base_name` template with `params` and install it on the
    /// client's host under `target_name`.
    ///
    /// Missing required keys fail with `InvalidArgument`; keys the template
    /// does not know are substituted verbatim when a matching placeholder
    /// exists. Returns the service metadata: `params` plus `SERVICE_NAME`.
    pub async fn add_service(
        &self,
        base_name: &str,
        client: &SshClient,
        params: &ServiceParams,
        target_name: &str,
    ) -> Result<ServiceParams> {
        let template = template_for(base_name)?;
        let missing: Vec<&str> = template
            .required
            .iter()
            .filter(|key| !params.contains_key(**key))
            .copied()
            .collect();
        if !missing.is_empty() {
            return Err(InstallerError::InvalidArgument(format!(
                "Service template {} is missing parameters: {}",
                base_name,
                missing.join(", ")
            )));
        }

        let mut unit = template.text.to_string();
        for (key, value) in params {
            unit = unit.replace(&format!("<{}>", key), &param_text(value));
        }
        for key in template.optional {
            unit = unit.replace(&format!("<{}>", key), "");
        }

        debug!("[{}] Installing service {}", client.host(), target_name);
        client.file_write(&unit_path(target_name), &unit, None).await?;
        client.run("systemctl daemon-reload").await?;

        let mut metadata = params.clone();
        metadata.insert(
            "SERVICE_NAME".to_string(),
            Value::String(target_name.to_string()),
        );
        Ok(metadata)
    }

    pub async fn has_service(&self, name: &str, client: &SshClient) -> Result<bool> {
        client.file_exists(&unit_path(name)).await
    }

    /// Whether the unit is currently active
    pub async fn get_service_status(&self, name: &str, client: &SshClient) -> Result<bool> {
        let output = client
            .run(&format!("systemctl is-active {} || true", name))
            .await?;
        Ok(output.trim() == "active")
    }

    pub async fn start_service(&self, name: &str, client: &SshClient) -> Result<()> {
        debug!("[{}] Starting service {}", client.host(), name);
        client.run(&format!("systemctl start {}", name)).await?;
        Ok(())
    }

    pub async fn stop_service(&self, name: &str, client: &SshClient) -> Result<()> {
        debug!("[{}] Stopping service {}", client.host(), name);
        client.run(&format!("systemctl stop {}", name)).await?;
        Ok(())
    }

    pub async fn restart_service(&self, name: &str, client: &SshClient) -> Result<()> {
        debug!("[{}] Restarting service {}", client.host(), name);
        client.run(&format!("systemctl restart {}", name)).await?;
        Ok(())
    }

    pub async fn remove_service(&self, name: &str, client: &SshClient) -> Result<()> {
        debug!("[{}] Removing service {}", client.host(), name);
        client.file_delete(&unit_path(name)).await?;
        client.run("systemctl daemon-reload").await?;
        Ok(())
    }

    /// Publish a service's parameter mapping in the configuration registry.
    ///
    /// `service_metadata` must carry `SERVICE_NAME`, as returned by
    /// [`ServiceManager::add_service`].
    pub async fn register_service(
        &self,
        node_name: &str,
        service_metadata: &ServiceParams,
    ) -> Result<()> {
        let service_name = service_metadata
            .get("SERVICE_NAME")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                InstallerError::InvalidArgument(
                    "Service metadata is missing SERVICE_NAME".to_string(),
                )
            })?;
        let raw = serde_json::to_string(&Value::Object(service_metadata.clone()))?;
        self.registry
            .set(&Self::service_key(node_name, service_name), &raw)
            .await
    }

    pub async fn unregister_service(&self, node_name: &str, service_name: &str) -> Result<()> {
        self.registry
            .delete(&Self::service_key(node_name, service_name))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn arakoon_params() -> ServiceParams {
        let mut params = ServiceParams::new();
        params.insert("CLUSTER".into(), json!("one"));
        params.insert("NODE_ID".into(), json!("1"));
        params.insert("CONFIG_PATH".into(), json!("/tmp/one.ini"));
        params.insert("CLIENT_PORT".into(), json!(26400));
        params.insert("MESSAGING_PORT".into(), json!(26401));
        params.insert("HOME".into(), json!("/mnt/arakoon/one/db"));
        params.insert("TLOG_DIR".into(), json!("/mnt/arakoon/one/tlogs"));
        params
    }

    #[test]
    fn unknown_template_is_not_found() {
        assert!(template_for("nonsense").unwrap_err().is_not_found());
    }

    #[test]
    fn required_keys_cover_placeholders() {
        for template in TEMPLATES {
            for key in template.required {
                assert!(
                    template.text.contains(&format!("<{}>", key)),
                    "{} lacks <{}>",
                    template.base_name,
                    key
                );
            }
        }
    }

    #[test]
    fn numbers_render_unquoted() {
        assert_eq!(param_text(&json!(26400)), "26400");
        assert_eq!(param_text(&json!("text")), "text");
    }

    #[tokio::test]
    async fn missing_required_key_is_rejected() {
        let registry = Arc::new(crate::registry::MemoryRegistry::new());
        let manager = ServiceManager::new(registry);
        let fleet = Arc::new(crate::testing::MockFleet::new());
        let client = fleet.client("10.0.0.1");
        let mut params = arakoon_params();
        params.remove("CONFIG_PATH");
        let err = manager
            .add_service("arakoon", &client, &params, "arakoon-one")
            .await
            .unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[tokio::test]
    async fn rendered_unit_substitutes_params() {
        let registry = Arc::new(crate::registry::MemoryRegistry::new());
        let manager = ServiceManager::new(registry);
        let fleet = Arc::new(crate::testing::MockFleet::new());
        fleet.add_host("10.0.0.1", "machine-1");
        let client = fleet.client("10.0.0.1");
        let metadata = manager
            .add_service("arakoon", &client, &arakoon_params(), "arakoon-one")
            .await
            .unwrap();
        assert_eq!(metadata["SERVICE_NAME"], json!("arakoon-one"));
        let unit = fleet.file_content("10.0.0.1", "/lib/systemd/system/arakoon-one.service");
        assert!(unit.contains("--node 1 -config /tmp/one.ini"));
        assert!(unit.contains("EXTRA_VERSION_CMD="));
        assert!(!unit.contains('<'));
    }
}
