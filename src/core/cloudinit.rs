use serde::Serialize;

use crate::config::ProvisioningSettings;
use crate::core::credentials::AccessCredential;
use crate::core::vm::ProvisioningKey;
use crate::errors::StorageResult;

const SUDO_RULE: &str = "ALL=(ALL) NOPASSWD:ALL";
const LOGIN_SHELL: &str = "/bin/bash";

#[derive(Debug, Serialize)]
struct CloudConfig<'a> {
    hostname: String,
    fqdn: String,
    ssh_pwauth: bool,
    chpasswd: ChPasswd,
    users: Vec<CloudUser<'a>>,
    packages: &'a [String],
}

#[derive(Debug, Serialize)]
struct ChPasswd {
    expire: bool,
}

#[derive(Debug, Serialize)]
struct CloudUser<'a> {
    name: &'a str,
    sudo: &'a str,
    shell: &'a str,
    lock_passwd: bool,
    plain_text_passwd: &'a str,
    #[serde(skip_serializing_if = "no_keys")]
    ssh_authorized_keys: &'a [String],
}

fn no_keys(keys: &&[String]) -> bool {
    keys.is_empty()
}

/// A rendered user-data file, ready to stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudInitDocument {
    pub filename: String,
    pub hostname: String,
    pub contents: String,
}

/// Renders per-VM `#cloud-config` user-data.
#[derive(Debug, Clone)]
pub struct CloudInitBuilder {
    guest_user: String,
    hostname_prefix: String,
    packages: Vec<String>,
}

impl CloudInitBuilder {
    pub fn new(
        guest_user: impl Into<String>,
        hostname_prefix: impl Into<String>,
        packages: Vec<String>,
    ) -> Self {
        Self {
            guest_user: guest_user.into(),
            hostname_prefix: hostname_prefix.into(),
            packages,
        }
    }

    pub fn from_settings(settings: &ProvisioningSettings) -> Self {
        Self::new(
            settings.guest_user.clone(),
            settings.hostname_prefix.clone(),
            settings.packages.clone(),
        )
    }

    pub fn hostname(&self, key: &ProvisioningKey) -> String {
        if self.hostname_prefix.is_empty() {
            key.name()
        } else {
            format!("{}-{}", self.hostname_prefix, key.name())
        }
    }

    pub fn render(
        &self,
        key: &ProvisioningKey,
        credential: &AccessCredential,
        ssh_keys: &[String],
    ) -> StorageResult<CloudInitDocument> {
        let hostname = self.hostname(key);
        let config = CloudConfig {
            hostname: hostname.clone(),
            fqdn: hostname.clone(),
            ssh_pwauth: true,
            chpasswd: ChPasswd { expire: false },
            users: vec![CloudUser {
                name: &self.guest_user,
                sudo: SUDO_RULE,
                shell: LOGIN_SHELL,
                lock_passwd: false,
                plain_text_passwd: credential.expose(),
                ssh_authorized_keys: ssh_keys,
            }],
            packages: &self.packages,
        };
        let body = serde_yaml::to_string(&config)?;

        Ok(CloudInitDocument {
            filename: key.snippet_filename(),
            hostname,
            contents: format!("#cloud-config\n{body}"),
        })
    }
}
