use serde::{Deserialize, Serialize};
use std::fmt;

pub type ContestId = u32;
pub type TeamId = u32;
pub type QuestionId = u32;
pub type VmId = u32;

const BYTES_PER_MB: u64 = 1024 * 1024;
const BYTES_PER_GB: u64 = 1024 * BYTES_PER_MB;

/// One team's copy of one question inside one contest.
///
/// The key doubles as the VM display name on the cluster, which is how the
/// manager recognises VMs it owns without consulting the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProvisioningKey {
    pub contest_id: ContestId,
    pub team_id: TeamId,
    pub question_id: QuestionId,
}

impl ProvisioningKey {
    pub fn new(contest_id: ContestId, team_id: TeamId, question_id: QuestionId) -> Self {
        Self {
            contest_id,
            team_id,
            question_id,
        }
    }

    /// `"{contest}-{team}-{question}"`
    pub fn name(&self) -> String {
        provisioning_name(self.contest_id, self.team_id, self.question_id)
    }

    /// Inverse of [`ProvisioningKey::name`]. Rejects anything that is not
    /// exactly three dash-separated decimal numbers fitting in a `u32`.
    pub fn parse(name: &str) -> Option<Self> {
        let mut parts = name.split('-');
        let contest_id = parse_part(parts.next()?)?;
        let team_id = parse_part(parts.next()?)?;
        let question_id = parse_part(parts.next()?)?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(contest_id, team_id, question_id))
    }

    pub fn snippet_filename(&self) -> String {
        format!("{}.yaml", self.name())
    }
}

impl fmt::Display for ProvisioningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.contest_id, self.team_id, self.question_id)
    }
}

pub fn provisioning_name(contest_id: ContestId, team_id: TeamId, question_id: QuestionId) -> String {
    format!("{contest_id}-{team_id}-{question_id}")
}

/// Structural match for `^\d+-\d+-\d+$`, used by the cluster-wide sweep.
pub fn is_provisioning_name(name: &str) -> bool {
    let mut count = 0;
    for part in name.split('-') {
        if !is_digits(part) {
            return false;
        }
        count += 1;
    }
    count == 3
}

fn is_digits(part: &str) -> bool {
    !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit())
}

fn parse_part(part: &str) -> Option<u32> {
    if !is_digits(part) {
        return None;
    }
    part.parse().ok()
}

/// A VM addressed the way the Proxmox API wants it: node plus id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VmRef {
    pub node: String,
    pub vmid: VmId,
}

impl VmRef {
    pub fn new(node: impl Into<String>, vmid: VmId) -> Self {
        Self {
            node: node.into(),
            vmid,
        }
    }
}

impl fmt::Display for VmRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node, self.vmid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmPowerState {
    Running,
    Stopped,
    Paused,
    #[serde(other)]
    Unknown,
}

impl From<&str> for VmPowerState {
    fn from(state: &str) -> Self {
        match state {
            "running" => VmPowerState::Running,
            "stopped" => VmPowerState::Stopped,
            "paused" => VmPowerState::Paused,
            _ => VmPowerState::Unknown,
        }
    }
}

/// Sizing a question asks for, after defaults have been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub disk_gb: u64,
}

impl ResourceRequest {
    pub fn memory_bytes(&self) -> u64 {
        self.memory_mb.saturating_mul(BYTES_PER_MB)
    }

    pub fn disk_bytes(&self) -> u64 {
        self.disk_gb.saturating_mul(BYTES_PER_GB)
    }
}

/// Entry of `GET /nodes`. Offline nodes omit the usage fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node: String,
    pub status: String,
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub maxcpu: u32,
    #[serde(default)]
    pub mem: u64,
    #[serde(default)]
    pub maxmem: u64,
    #[serde(default)]
    pub disk: u64,
    #[serde(default)]
    pub maxdisk: u64,
}

impl NodeStatus {
    pub fn is_online(&self) -> bool {
        self.status == "online"
    }

    pub fn free_memory_bytes(&self) -> u64 {
        self.maxmem.saturating_sub(self.mem)
    }

    pub fn free_disk_bytes(&self) -> u64 {
        self.maxdisk.saturating_sub(self.disk)
    }
}

/// Entry of `GET /cluster/resources`. Nodes, storages and guests share one shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterResource {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub vmid: Option<VmId>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub template: u8,
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub maxcpu: u32,
    #[serde(default)]
    pub mem: u64,
    #[serde(default)]
    pub maxmem: u64,
    #[serde(default)]
    pub disk: u64,
    #[serde(default)]
    pub maxdisk: u64,
}

impl ClusterResource {
    pub fn is_vm(&self) -> bool {
        self.kind == "qemu"
    }

    pub fn is_template(&self) -> bool {
        self.template != 0
    }

    pub fn vm_ref(&self) -> Option<VmRef> {
        Some(VmRef::new(self.node.clone()?, self.vmid?))
    }
}

/// One interface reported by the QEMU guest agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GuestInterface {
    pub name: String,
    #[serde(default)]
    pub hardware_address: Option<String>,
    #[serde(default)]
    pub ip_addresses: Vec<GuestIpAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GuestIpAddress {
    pub ip_address: String,
    pub ip_address_type: String,
    #[serde(default)]
    pub prefix: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneRequest {
    pub template: VmRef,
    pub name: String,
    pub target_node: String,
    pub linked: bool,
}

/// Post-clone edits, sent as one `POST /config` form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmEdit {
    pub cores: Option<u32>,
    pub memory_mb: Option<u64>,
    pub cicustom: Option<String>,
    pub ipconfig0: Option<String>,
    pub net0: Option<String>,
}

impl VmEdit {
    pub fn form_params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(cores) = self.cores {
            params.push(("cores", cores.to_string()));
        }
        if let Some(memory) = self.memory_mb {
            params.push(("memory", memory.to_string()));
        }
        if let Some(cicustom) = &self.cicustom {
            params.push(("cicustom", cicustom.clone()));
        }
        if let Some(ipconfig) = &self.ipconfig0 {
            params.push(("ipconfig0", ipconfig.clone()));
        }
        if let Some(net) = &self.net0 {
            params.push(("net0", net.clone()));
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_follow_the_convention() {
        assert_eq!(provisioning_name(3, 7, 12), "3-7-12");
        assert_eq!(ProvisioningKey::new(3, 7, 12).name(), "3-7-12");
        assert_eq!(ProvisioningKey::new(3, 7, 12).snippet_filename(), "3-7-12.yaml");
    }

    #[test]
    fn sweep_pattern_is_strict() {
        assert!(is_provisioning_name("3-7-12"));
        assert!(is_provisioning_name("0-0-0"));
        assert!(!is_provisioning_name("template-base"));
        assert!(!is_provisioning_name("3-7"));
        assert!(!is_provisioning_name("3-7-12-1"));
        assert!(!is_provisioning_name("3--12"));
        assert!(!is_provisioning_name("3-7-12 "));
        assert!(!is_provisioning_name("-3-7"));
        assert!(!is_provisioning_name(""));
    }

    #[test]
    fn parse_inverts_name() {
        let key = ProvisioningKey::new(42, 1, 900);
        assert_eq!(ProvisioningKey::parse(&key.name()), Some(key));
        assert_eq!(ProvisioningKey::parse("1-2"), None);
        assert_eq!(ProvisioningKey::parse("1-2-+3"), None);
        // matches the pattern but overflows u32
        assert!(is_provisioning_name("1-2-99999999999"));
        assert_eq!(ProvisioningKey::parse("1-2-99999999999"), None);
    }

    #[test]
    fn offline_node_decodes_without_usage() {
        let node: NodeStatus =
            serde_json::from_str(r#"{"node":"pve3","status":"offline"}"#).unwrap();
        assert!(!node.is_online());
        assert_eq!(node.free_memory_bytes(), 0);
    }

    #[test]
    fn edit_form_only_carries_set_fields() {
        let edit = VmEdit {
            cores: Some(2),
            cicustom: Some("user=cephfs:snippets/1-2-3.yaml".into()),
            ..Default::default()
        };
        let params = edit.form_params();
        assert_eq!(params.len(), 2);
        assert_eq!(params[0], ("cores", "2".to_string()));
    }
}
