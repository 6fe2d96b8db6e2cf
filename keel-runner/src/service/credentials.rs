//! Cloud credential materializer
//!
//! Turns the cloud credential of a job into environment variables and, for
//! providers that read their secrets from disk, a private temp file. The
//! returned [`CloudMaterial`] owns that file and removes it on cleanup or drop.

use keel_core::domain::credential::{Credential, CredentialKind};
use serde_json::json;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use thiserror::Error;
use tracing::{debug, warn};

use crate::family::Environment;
use crate::secret::{SecretCodec, SecretError};

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("unable to decrypt {field}: {source}")]
    Decrypt {
        field: &'static str,
        #[source]
        source: SecretError,
    },

    #[error("{provider} credential file creation failed: {source}")]
    File {
        provider: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Environment and optional secret file produced for one credential
#[derive(Debug, Default)]
pub struct CloudMaterial {
    pub env: Environment,
    file: Option<TempPath>,
}

impl CloudMaterial {
    /// Path of the materialized secret file, if the provider needs one
    pub fn file_path(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    /// Deletes the secret file; calling it again is a no-op
    pub fn cleanup(&mut self) {
        if let Some(file) = self.file.take() {
            let path = file.to_path_buf();
            if let Err(e) = file.close() {
                warn!("Unable to remove credential file {}: {}", path.display(), e);
            }
        }
    }
}

impl Drop for CloudMaterial {
    fn drop(&mut self) {
        self.cleanup();
    }
}

pub struct CredentialMaterializer {
    codec: SecretCodec,
    tmp_dir: PathBuf,
}

impl CredentialMaterializer {
    pub fn new(codec: SecretCodec, tmp_dir: impl Into<PathBuf>) -> Self {
        Self {
            codec,
            tmp_dir: tmp_dir.into(),
        }
    }

    /// Produces the environment (and file) for `credential`
    ///
    /// Kinds without cloud rules yield an empty environment.
    pub fn materialize(&self, credential: &Credential) -> Result<CloudMaterial, CredentialError> {
        let mut material = CloudMaterial::default();
        let env = &mut material.env;

        match credential.kind {
            CredentialKind::Aws => {
                env.set("AWS_ACCESS_KEY_ID", &credential.client);
                env.set("AWS_SECRET_ACCESS_KEY", self.decrypt("secret", &credential.secret)?);
                if !credential.security_token.is_empty() {
                    env.set("AWS_SECURITY_TOKEN", &credential.security_token);
                }
            }
            CredentialKind::Rax => {
                let content = format!(
                    "#!/usr/bin/python\n[rackspace_cloud]\nusername={}\napi_key={}",
                    credential.username,
                    self.decrypt("secret", &credential.secret)?
                );
                // executed as a python script by the inventory
                let file = self.write_file("rackspace", &content, 0o500)?;
                env.set("RAX_CREDS_FILE", file.display().to_string());
                material.file = Some(file);
            }
            CredentialKind::Gce => {
                let key = self.decrypt("ssh_key_data", &credential.ssh_key_data)?;
                let file = self.write_file("gce", &key, 0o400)?;
                env.set("GCE_EMAIL", &credential.email);
                env.set("GCE_PROJECT", &credential.project);
                env.set("GCE_CREDENTIALS_FILE_PATH", file.display().to_string());
                material.file = Some(file);
            }
            CredentialKind::Azure => {
                if !credential.username.is_empty() {
                    env.set("AZURE_AD_USER", &credential.username);
                    env.set("AZURE_PASSWORD", self.decrypt("password", &credential.password)?);
                    env.set("AZURE_SUBSCRIPTION_ID", &credential.subscription);
                } else {
                    env.set("AZURE_CLIENT_ID", &credential.client);
                    env.set("AZURE_SECRET", self.decrypt("secret", &credential.secret)?);
                    env.set("AZURE_SUBSCRIPTION_ID", &credential.subscription);
                    env.set("AZURE_TENANT", &credential.tenant);
                }
            }
            CredentialKind::Vmware => {
                env.set("VMWARE_USER", &credential.username);
                env.set("VMWARE_PASSWORD", self.decrypt("password", &credential.password)?);
                env.set("VMWARE_HOST", &credential.host);
            }
            CredentialKind::Openstack => {
                let mut auth = json!({
                    "auth_url": credential.host,
                    "username": credential.username,
                    "password": self.decrypt("password", &credential.password)?,
                    "project_name": credential.project,
                });
                if !credential.domain.is_empty() {
                    auth["domain_name"] = json!(credential.domain);
                }
                // JSON is valid YAML, which is what the client library expects
                let content = json!({ "clouds": { "keel": { "auth": auth } } }).to_string();
                let file = self.write_file("openstack", &content, 0o400)?;
                env.set("OS_CLIENT_CONFIG_FILE", file.display().to_string());
                material.file = Some(file);
            }
            _ => {}
        }

        debug!(
            "Materialized {} credential {}: {:?}",
            credential.kind, credential.id, material.env
        );
        Ok(material)
    }

    fn decrypt(&self, field: &'static str, value: &str) -> Result<String, CredentialError> {
        self.codec
            .decrypt(value)
            .map(|s| s.expose().to_string())
            .map_err(|source| CredentialError::Decrypt { field, source })
    }

    fn write_file(
        &self,
        provider: &'static str,
        content: &str,
        mode: u32,
    ) -> Result<TempPath, CredentialError> {
        let to_error = |source| CredentialError::File { provider, source };

        std::fs::create_dir_all(&self.tmp_dir).map_err(to_error)?;
        let mut file = tempfile::Builder::new()
            .prefix(&format!("keel_credential_{}", provider))
            .tempfile_in(&self.tmp_dir)
            .map_err(to_error)?;
        file.write_all(content.as_bytes()).map_err(to_error)?;
        file.flush().map_err(to_error)?;

        let path = file.into_temp_path();
        set_mode(&path, mode).map_err(to_error)?;
        Ok(path)
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn materializer(dir: &Path) -> (CredentialMaterializer, SecretCodec) {
        let codec = SecretCodec::new("0123456789abcdef").unwrap();
        (CredentialMaterializer::new(codec.clone(), dir), codec)
    }

    #[test]
    fn test_aws_is_inline_only() {
        let dir = tempfile::tempdir().unwrap();
        let (materializer, codec) = materializer(dir.path());
        let credential = Credential {
            kind: CredentialKind::Aws,
            cloud: true,
            client: "AKIAEXAMPLE".to_string(),
            secret: codec.encrypt("aws-secret").unwrap(),
            ..Default::default()
        };

        let material = materializer.materialize(&credential).unwrap();
        assert_eq!(material.env.get("AWS_ACCESS_KEY_ID"), Some("AKIAEXAMPLE"));
        assert_eq!(material.env.get("AWS_SECRET_ACCESS_KEY"), Some("aws-secret"));
        assert!(!material.env.contains("AWS_SECURITY_TOKEN"));
        assert!(material.file_path().is_none());
    }

    #[test]
    fn test_gce_file_is_private_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let (materializer, codec) = materializer(dir.path());
        let credential = Credential {
            kind: CredentialKind::Gce,
            cloud: true,
            email: "svc@example.iam".to_string(),
            project: "infra".to_string(),
            ssh_key_data: codec.encrypt("{\"private_key\": \"gce\"}").unwrap(),
            ..Default::default()
        };

        let mut material = materializer.materialize(&credential).unwrap();
        let path = material.file_path().unwrap().to_path_buf();

        assert_eq!(
            material.env.get("GCE_CREDENTIALS_FILE_PATH"),
            Some(path.display().to_string().as_str())
        );
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"private_key\": \"gce\"}");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o400);
        }

        material.cleanup();
        assert!(!path.exists());
        material.cleanup();
    }

    #[test]
    fn test_rackspace_sets_a_single_variable() {
        let dir = tempfile::tempdir().unwrap();
        let (materializer, codec) = materializer(dir.path());
        let credential = Credential {
            kind: CredentialKind::Rax,
            cloud: true,
            username: "rackuser".to_string(),
            secret: codec.encrypt("rack-key").unwrap(),
            ..Default::default()
        };

        let path = {
            let material = materializer.materialize(&credential).unwrap();
            assert_eq!(material.env.names().collect::<Vec<_>>(), vec!["RAX_CREDS_FILE"]);

            let path = material.file_path().unwrap().to_path_buf();
            let content = std::fs::read_to_string(&path).unwrap();
            assert!(content.starts_with("#!/usr/bin/python\n[rackspace_cloud]"));
            assert!(content.contains("api_key=rack-key"));

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mode = std::fs::metadata(&path).unwrap().permissions().mode();
                assert_eq!(mode & 0o777, 0o500);
            }
            path
        };
        // dropped without explicit cleanup
        assert!(!path.exists());
    }

    #[test]
    fn test_azure_variants() {
        let dir = tempfile::tempdir().unwrap();
        let (materializer, codec) = materializer(dir.path());

        let ad = Credential {
            kind: CredentialKind::Azure,
            username: "ops@example.com".to_string(),
            password: codec.encrypt("ad-pass").unwrap(),
            subscription: "sub-1".to_string(),
            ..Default::default()
        };
        let material = materializer.materialize(&ad).unwrap();
        assert_eq!(
            material.env.names().collect::<Vec<_>>(),
            vec!["AZURE_AD_USER", "AZURE_PASSWORD", "AZURE_SUBSCRIPTION_ID"]
        );

        let principal = Credential {
            kind: CredentialKind::Azure,
            client: "client-id".to_string(),
            secret: codec.encrypt("sp-secret").unwrap(),
            subscription: "sub-1".to_string(),
            tenant: "tenant-1".to_string(),
            ..Default::default()
        };
        let material = materializer.materialize(&principal).unwrap();
        assert_eq!(material.env.get("AZURE_SECRET"), Some("sp-secret"));
        assert_eq!(material.env.get("AZURE_TENANT"), Some("tenant-1"));
        assert!(!material.env.contains("AZURE_AD_USER"));
    }

    #[test]
    fn test_undecryptable_secret_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (materializer, _) = materializer(dir.path());
        let credential = Credential {
            kind: CredentialKind::Aws,
            secret: "not base64 !!".to_string(),
            ..Default::default()
        };

        let result = materializer.materialize(&credential);
        assert!(matches!(
            result,
            Err(CredentialError::Decrypt { field: "secret", .. })
        ));
    }

    #[test]
    fn test_machine_kinds_yield_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (materializer, _) = materializer(dir.path());
        let material = materializer.materialize(&Credential::default()).unwrap();
        assert!(material.env.is_empty());
    }
}
