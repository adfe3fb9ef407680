use std::num::NonZeroU32;
use std::time::Duration;

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::ProxmoxSettings;
use crate::core::vm::{
    CloneRequest, ClusterResource, GuestInterface, NodeStatus, VmEdit, VmId, VmPowerState, VmRef,
};
use crate::errors::{HypervisorError, HypervisorResult};

/// Control-plane operations the manager needs from the virtualization cluster.
#[async_trait]
pub trait HypervisorClient: Send + Sync {
    async fn list_nodes(&self) -> HypervisorResult<Vec<NodeStatus>>;

    async fn list_cluster_resources(&self) -> HypervisorResult<Vec<ClusterResource>>;

    /// Clones `request.template` and returns the id assigned to the new VM.
    async fn clone_vm(&self, request: &CloneRequest) -> HypervisorResult<VmId>;

    async fn configure_vm(&self, vm: &VmRef, edit: &VmEdit) -> HypervisorResult<()>;

    async fn resize_disk(&self, vm: &VmRef, disk: &str, size_gb: u64) -> HypervisorResult<()>;

    async fn boot(&self, vm: &VmRef) -> HypervisorResult<()>;

    async fn shutdown(&self, vm: &VmRef) -> HypervisorResult<()>;

    /// Hard power-off, for guests that ignore or never received a shutdown.
    async fn force_stop(&self, vm: &VmRef) -> HypervisorResult<()>;

    async fn vm_status(&self, vm: &VmRef) -> HypervisorResult<VmPowerState>;

    async fn delete_vm(&self, vm: &VmRef) -> HypervisorResult<()>;

    async fn templatize(&self, vm: &VmRef) -> HypervisorResult<()>;

    async fn guest_interfaces(&self, vm: &VmRef) -> HypervisorResult<Vec<GuestInterface>>;
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    errors: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AgentResult<T> {
    result: T,
}

#[derive(Debug, Deserialize)]
struct CurrentStatus {
    status: String,
}

/// Proxmox VE REST client authenticated with an API token.
pub struct ProxmoxClient {
    http: reqwest::Client,
    base_url: String,
    limiter: DefaultDirectRateLimiter,
    shutdown_timeout_secs: u64,
    // nextid is only a hint; holding this across nextid + clone keeps two
    // pipelines in this process from racing for the same id.
    clone_gate: Mutex<()>,
}

impl ProxmoxClient {
    pub fn new(settings: &ProxmoxSettings) -> HypervisorResult<Self> {
        let mut auth = HeaderValue::from_str(&format!("PVEAPIToken={}", settings.api_token))
            .map_err(|e| HypervisorError::Config(format!("invalid API token: {e}")))?;
        auth.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(settings.request_timeout_secs.max(1)))
            .danger_accept_invalid_certs(settings.accept_invalid_certs)
            .build()?;

        let per_second = NonZeroU32::new(settings.requests_per_second).unwrap_or(NonZeroU32::MIN);

        Ok(Self {
            http,
            base_url: settings.api_url.trim_end_matches('/').to_string(),
            limiter: RateLimiter::direct(Quota::per_second(per_second)),
            shutdown_timeout_secs: settings.shutdown_timeout_secs,
            clone_gate: Mutex::new(()),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        self.http.request(method, url)
    }

    fn qemu_path(vm: &VmRef, suffix: &str) -> String {
        if suffix.is_empty() {
            format!("nodes/{}/qemu/{}", vm.node, vm.vmid)
        } else {
            format!("nodes/{}/qemu/{}/{}", vm.node, vm.vmid, suffix)
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        operation: &str,
        request: RequestBuilder,
    ) -> HypervisorResult<T> {
        self.limiter.until_ready().await;

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                HypervisorError::Timeout {
                    operation: operation.to_string(),
                }
            } else {
                HypervisorError::from(e)
            }
        })?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let message = error_message(&body, status.canonical_reason());
            debug!(operation, status = status.as_u16(), %message, "Proxmox API error");
            return Err(HypervisorError::api(operation, status.as_u16(), message));
        }

        serde_json::from_str::<Envelope<T>>(&body)
            .map(|envelope| envelope.data)
            .map_err(|e| HypervisorError::Decode {
                operation: operation.to_string(),
                message: e.to_string(),
            })
    }

    async fn next_vmid(&self) -> HypervisorResult<VmId> {
        let raw: serde_json::Value = self
            .send("nextid", self.request(Method::GET, "cluster/nextid"))
            .await?;
        parse_vmid(&raw).ok_or_else(|| HypervisorError::Decode {
            operation: "nextid".to_string(),
            message: format!("not a VM id: {raw}"),
        })
    }
}

fn parse_vmid(raw: &serde_json::Value) -> Option<VmId> {
    match raw {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_u64().and_then(|n| VmId::try_from(n).ok()),
        _ => None,
    }
}

/// Proxmox puts parameter errors in `errors` and everything else in the
/// status line, so fall back through both.
fn error_message(body: &str, reason: Option<&str>) -> String {
    let parsed: ErrorEnvelope = serde_json::from_str(body).unwrap_or_default();
    if let Some(errors) = parsed.errors.filter(|e| !e.is_empty()) {
        return errors
            .iter()
            .map(|(field, msg)| format!("{field}: {}", msg.as_str().unwrap_or_default().trim()))
            .collect::<Vec<_>>()
            .join("; ");
    }
    if let Some(message) = parsed.message {
        return message.trim().to_string();
    }
    let trimmed = body.trim();
    if trimmed.is_empty() || trimmed.starts_with('{') {
        reason.unwrap_or("unknown error").to_string()
    } else {
        trimmed.to_string()
    }
}

#[async_trait]
impl HypervisorClient for ProxmoxClient {
    async fn list_nodes(&self) -> HypervisorResult<Vec<NodeStatus>> {
        self.send("list nodes", self.request(Method::GET, "nodes")).await
    }

    async fn list_cluster_resources(&self) -> HypervisorResult<Vec<ClusterResource>> {
        self.send(
            "list cluster resources",
            self.request(Method::GET, "cluster/resources"),
        )
        .await
    }

    async fn clone_vm(&self, request: &CloneRequest) -> HypervisorResult<VmId> {
        let _gate = self.clone_gate.lock().await;
        let newid = self.next_vmid().await?;

        let form = [
            ("newid", newid.to_string()),
            ("name", request.name.clone()),
            ("target", request.target_node.clone()),
            ("full", if request.linked { "0" } else { "1" }.to_string()),
        ];
        let _: serde_json::Value = self
            .send(
                "clone",
                self.request(Method::POST, &Self::qemu_path(&request.template, "clone"))
                    .form(&form),
            )
            .await?;

        info!(
            template = %request.template,
            vmid = newid,
            node = %request.target_node,
            name = %request.name,
            "Clone requested"
        );
        Ok(newid)
    }

    async fn configure_vm(&self, vm: &VmRef, edit: &VmEdit) -> HypervisorResult<()> {
        let _: serde_json::Value = self
            .send(
                "configure",
                self.request(Method::POST, &Self::qemu_path(vm, "config"))
                    .form(&edit.form_params()),
            )
            .await?;
        Ok(())
    }

    async fn resize_disk(&self, vm: &VmRef, disk: &str, size_gb: u64) -> HypervisorResult<()> {
        let form = [("disk", disk.to_string()), ("size", format!("{size_gb}G"))];
        let _: serde_json::Value = self
            .send(
                "resize",
                self.request(Method::PUT, &Self::qemu_path(vm, "resize"))
                    .form(&form),
            )
            .await?;
        Ok(())
    }

    async fn boot(&self, vm: &VmRef) -> HypervisorResult<()> {
        let _: serde_json::Value = self
            .send(
                "boot",
                self.request(Method::POST, &Self::qemu_path(vm, "status/start")),
            )
            .await?;
        Ok(())
    }

    async fn shutdown(&self, vm: &VmRef) -> HypervisorResult<()> {
        let form = [
            ("forceStop", "1".to_string()),
            ("timeout", self.shutdown_timeout_secs.to_string()),
        ];
        let _: serde_json::Value = self
            .send(
                "shutdown",
                self.request(Method::POST, &Self::qemu_path(vm, "status/shutdown"))
                    .form(&form),
            )
            .await?;
        Ok(())
    }

    async fn force_stop(&self, vm: &VmRef) -> HypervisorResult<()> {
        let _: serde_json::Value = self
            .send(
                "stop",
                self.request(Method::POST, &Self::qemu_path(vm, "status/stop")),
            )
            .await?;
        Ok(())
    }

    async fn vm_status(&self, vm: &VmRef) -> HypervisorResult<VmPowerState> {
        let current: CurrentStatus = self
            .send(
                "status",
                self.request(Method::GET, &Self::qemu_path(vm, "status/current")),
            )
            .await?;
        Ok(VmPowerState::from(current.status.as_str()))
    }

    async fn delete_vm(&self, vm: &VmRef) -> HypervisorResult<()> {
        let _: serde_json::Value = self
            .send(
                "delete",
                self.request(Method::DELETE, &Self::qemu_path(vm, ""))
                    .query(&[("purge", "1"), ("destroy-unreferenced-disks", "1")]),
            )
            .await?;
        Ok(())
    }

    async fn templatize(&self, vm: &VmRef) -> HypervisorResult<()> {
        let _: serde_json::Value = self
            .send(
                "template",
                self.request(Method::POST, &Self::qemu_path(vm, "template")),
            )
            .await?;
        Ok(())
    }

    async fn guest_interfaces(&self, vm: &VmRef) -> HypervisorResult<Vec<GuestInterface>> {
        let agent: AgentResult<Vec<GuestInterface>> = self
            .send(
                "guest interfaces",
                self.request(
                    Method::GET,
                    &Self::qemu_path(vm, "agent/network-get-interfaces"),
                ),
            )
            .await?;
        Ok(agent.result)
    }
}
