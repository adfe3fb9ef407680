pub mod cloudinit;
pub mod credentials;
pub mod proxmox;
pub mod snippets;
pub mod vm;

// exports for the rest of the crate
pub use cloudinit::{CloudInitBuilder, CloudInitDocument};
pub use credentials::{AccessCredential, CredentialGenerator};
pub use proxmox::{HypervisorClient, ProxmoxClient};
pub use snippets::{LocalSnippetStorage, ScpSnippetStorage, SnippetStorage};
pub use vm::{ProvisioningKey, VmId, VmRef};
