//! Credential domain types
//!
//! Secret fields (`password`, `secret`, `ssh_key_data`, `ssh_key_unlock`,
//! `become_password`, `authorize_password`) are stored encrypted and must be
//! passed through the secret codec before use.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Credential kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialKind {
    /// Machine credential for SSH hosts
    #[default]
    Ssh,
    /// Network device credential
    Net,
    /// Machine credential for Windows hosts (Kerberos)
    Windows,
    /// Source control credential
    Scm,
    Aws,
    /// Rackspace
    Rax,
    Vmware,
    Satellite6,
    Cloudforms,
    /// Google Compute Engine
    Gce,
    Azure,
    Openstack,
}

impl CredentialKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CredentialKind::Ssh => "ssh",
            CredentialKind::Net => "net",
            CredentialKind::Windows => "windows",
            CredentialKind::Scm => "scm",
            CredentialKind::Aws => "aws",
            CredentialKind::Rax => "rax",
            CredentialKind::Vmware => "vmware",
            CredentialKind::Satellite6 => "satellite6",
            CredentialKind::Cloudforms => "cloudforms",
            CredentialKind::Gce => "gce",
            CredentialKind::Azure => "azure",
            CredentialKind::Openstack => "openstack",
        }
    }
}

impl std::fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed secret/identity record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Credential {
    pub id: Uuid,
    pub name: String,
    pub kind: CredentialKind,
    pub cloud: bool,
    pub description: String,
    pub host: String,
    pub username: String,
    pub password: String,
    pub security_token: String,
    pub project: String,
    pub email: String,
    pub domain: String,
    pub ssh_key_data: String,
    pub ssh_key_unlock: String,
    pub become_method: String,
    pub become_username: String,
    pub become_password: String,
    pub vault_password: String,
    pub subscription: String,
    pub tenant: String,
    pub secret: String,
    pub client: String,
    pub authorize: bool,
    pub authorize_password: String,
}

impl Credential {
    /// Whether the credential carries SSH key material
    pub fn has_ssh_key(&self) -> bool {
        !self.ssh_key_data.is_empty()
    }

    /// Login name, qualified with the domain when one is set
    pub fn qualified_username(&self) -> String {
        if self.domain.is_empty() {
            self.username.clone()
        } else {
            format!("{}@{}", self.username, self.domain)
        }
    }
}
