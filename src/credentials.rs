//! Secret store: per-adapter credential blobs in a private directory.
//!
//! Adapters read credentials lazily, per call. Secret values never appear
//! in logs: the debug representation is redacted, and the audit logger is
//! seeded with every known secret string for exact-match scrubbing.

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use thiserror::Error;

/// Canonical blob names inside the secrets directory.
pub mod blobs {
    /// Gmail OAuth token blob.
    pub const GMAIL: &str = "gmail_token.json";
    /// LinkedIn OAuth token blob.
    pub const LINKEDIN: &str = "linkedin_token.json";
    /// Instagram Graph credentials blob.
    pub const INSTAGRAM: &str = "instagram_credentials.json";
    /// Odoo RPC credentials blob.
    pub const ODOO: &str = "odoo_credentials.json";
    /// WhatsApp Web session directory.
    pub const WHATSAPP_SESSION: &str = "whatsapp_session";
    /// Content-model credentials blob (external collaborator).
    pub const AI: &str = "ai_credentials.json";
}

/// Credential loading failures.
#[derive(Debug, Error)]
pub enum CredentialsError {
    /// The blob does not exist; the adapter is unauthenticated.
    #[error("credential blob missing: {0}")]
    Missing(PathBuf),
    /// The blob or directory is readable by other users.
    #[error("credentials at {path} must be private, found mode {mode:o}")]
    TooPermissive {
        /// Offending path.
        path: PathBuf,
        /// Observed permission bits.
        mode: u32,
    },
    /// The blob could not be parsed.
    #[error("failed to parse credential blob {path}: {detail}")]
    Parse {
        /// Offending path.
        path: PathBuf,
        /// Parser message.
        detail: String,
    },
    /// Filesystem error while reading.
    #[error("failed to read credential blob {path}: {source}")]
    Io {
        /// Offending path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
}

/// Handle to the secrets directory.
#[derive(Clone)]
pub struct SecretsDir {
    root: PathBuf,
}

impl std::fmt::Debug for SecretsDir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretsDir")
            .field("root", &self.root)
            .field("contents", &"[REDACTED]")
            .finish()
    }
}

impl SecretsDir {
    /// Open a secrets directory (it need not exist yet; individual loads
    /// fail with [`CredentialsError::Missing`]).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The directory path.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a named blob.
    pub fn blob_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Whether a named blob exists.
    pub fn has_blob(&self, name: &str) -> bool {
        self.blob_path(name).exists()
    }

    /// Load and parse a JSON credential blob, enforcing private file
    /// permissions.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialsError::Missing`] when absent,
    /// [`CredentialsError::TooPermissive`] when group/other readable.
    pub fn load_json<T: DeserializeOwned>(&self, name: &str) -> Result<T, CredentialsError> {
        let path = self.blob_path(name);
        if !path.exists() {
            return Err(CredentialsError::Missing(path));
        }
        validate_private(&path)?;
        let text = fs::read_to_string(&path).map_err(|source| CredentialsError::Io {
            path: path.clone(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|e| CredentialsError::Parse {
            path,
            detail: e.to_string(),
        })
    }

    /// Write a JSON blob with private permissions (used by `init` and by
    /// adapters persisting refreshed tokens).
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn store_json<T: serde::Serialize>(
        &self,
        name: &str,
        value: &T,
    ) -> Result<(), CredentialsError> {
        let path = self.blob_path(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| CredentialsError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let text = serde_json::to_string_pretty(value).map_err(|e| CredentialsError::Parse {
            path: path.clone(),
            detail: e.to_string(),
        })?;
        fs::write(&path, text).map_err(|source| CredentialsError::Io {
            path: path.clone(),
            source,
        })?;
        set_private(&path)
    }

    /// Every secret-looking string in every blob, for exact-match
    /// redaction. Values shorter than 8 characters are skipped (they would
    /// scrub ordinary text).
    pub fn known_secrets(&self) -> Vec<String> {
        let mut secrets = Vec::new();
        let Ok(entries) = fs::read_dir(&self.root) else {
            return secrets;
        };
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(text) = fs::read_to_string(&path) else {
                continue;
            };
            let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) else {
                continue;
            };
            collect_string_leaves(&value, &mut secrets);
        }
        secrets.retain(|s| s.len() >= 8);
        secrets
    }
}

fn collect_string_leaves(value: &serde_json::Value, out: &mut Vec<String>) {
    match value {
        serde_json::Value::String(s) => out.push(s.clone()),
        serde_json::Value::Array(items) => {
            for item in items {
                collect_string_leaves(item, out);
            }
        }
        serde_json::Value::Object(map) => {
            for item in map.values() {
                collect_string_leaves(item, out);
            }
        }
        _ => {}
    }
}

#[cfg(unix)]
fn validate_private(path: &Path) -> Result<(), CredentialsError> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = fs::metadata(path).map_err(|source| CredentialsError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mode = metadata.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        return Err(CredentialsError::TooPermissive {
            path: path.to_path_buf(),
            mode,
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn validate_private(_path: &Path) -> Result<(), CredentialsError> {
    Ok(())
}

#[cfg(unix)]
fn set_private(path: &Path) -> Result<(), CredentialsError> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|source| {
        CredentialsError::Io {
            path: path.to_path_buf(),
            source,
        }
    })
}

#[cfg(not(unix))]
fn set_private(_path: &Path) -> Result<(), CredentialsError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, serde::Deserialize, serde::Serialize)]
    struct TokenBlob {
        access_token: String,
    }

    #[test]
    fn test_missing_blob() {
        let dir = tempfile::tempdir().expect("tempdir");
        let secrets = SecretsDir::new(dir.path());
        let result: Result<TokenBlob, _> = secrets.load_json(blobs::GMAIL);
        assert!(matches!(result, Err(CredentialsError::Missing(_))));
    }

    #[test]
    fn test_store_and_load_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let secrets = SecretsDir::new(dir.path());
        secrets
            .store_json(
                blobs::GMAIL,
                &TokenBlob {
                    access_token: "ya29.secret-token-value".to_owned(),
                },
            )
            .expect("store");
        let loaded: TokenBlob = secrets.load_json(blobs::GMAIL).expect("load");
        assert_eq!(loaded.access_token, "ya29.secret-token-value");
    }

    #[cfg(unix)]
    #[test]
    fn test_world_readable_blob_rejected() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let secrets = SecretsDir::new(dir.path());
        secrets
            .store_json(
                blobs::ODOO,
                &TokenBlob {
                    access_token: "odoo-key-value".to_owned(),
                },
            )
            .expect("store");

        let path = secrets.blob_path(blobs::ODOO);
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).expect("chmod");

        let result: Result<TokenBlob, _> = secrets.load_json(blobs::ODOO);
        assert!(matches!(
            result,
            Err(CredentialsError::TooPermissive { .. })
        ));
    }

    #[test]
    fn test_known_secrets_collects_long_strings() {
        let dir = tempfile::tempdir().expect("tempdir");
        let secrets = SecretsDir::new(dir.path());
        secrets
            .store_json(
                blobs::LINKEDIN,
                &serde_json::json!({
                    "access_token": "linkedin-token-123456",
                    "scope": "w",
                }),
            )
            .expect("store");

        let known = secrets.known_secrets();
        assert!(known.contains(&"linkedin-token-123456".to_owned()));
        assert!(!known.contains(&"w".to_owned()), "short values skipped");
    }

    #[test]
    fn test_debug_redacts() {
        let secrets = SecretsDir::new("/tmp/secrets");
        let debug = format!("{secrets:?}");
        assert!(debug.contains("[REDACTED]"));
    }
}
