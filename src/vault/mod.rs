//! Vault store: typed, race-safe access to the on-disk vault tree.
//!
//! The vault is the authoritative store for intakes, plans, and approvals.
//! Approval happens by moving plan files between folders, so every move
//! must be an atomic rename on the same filesystem. The store conceals the
//! tree layout behind the [`folders`] constants and refuses operations that
//! would corrupt the approval protocol (deletes inside approval folders,
//! silent parent creation outside the fixed allow-list, copy-then-delete
//! moves across filesystems).
//!
//! The store never retries; callers decide what a failed operation means.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub mod folders;

use folders::PROTECTED_PREFIXES;

/// Errors produced by vault operations.
///
/// Each failure mode is a distinct kind so callers can tell a cross-device
/// rename (configuration error) from a missing file (race with the human)
/// from a permission problem (operator action required).
#[derive(Debug, Error)]
pub enum VaultError {
    /// A rename would cross filesystem boundaries. The vault must live on a
    /// single filesystem; this is a configuration error, never retried.
    #[error("cross-device rename from {src} to {dst}; vault must be on one filesystem")]
    CrossDevice {
        /// Source path of the attempted rename.
        src: PathBuf,
        /// Destination path of the attempted rename.
        dst: PathBuf,
    },
    /// The operating system denied access to a path.
    #[error("permission denied: {path}")]
    PermissionDenied {
        /// Path that could not be accessed.
        path: PathBuf,
    },
    /// A path that was expected to exist does not.
    #[error("not found: {path}")]
    NotFound {
        /// The missing path.
        path: PathBuf,
    },
    /// The operation would modify a protected folder (approval folders and
    /// the `Plans/` subtree are append/move-only).
    #[error("refusing to delete inside protected folder: {path}")]
    ProtectedPath {
        /// Path inside the protected subtree.
        path: PathBuf,
    },
    /// The path escapes the vault root or its parent is not on the
    /// directory allow-list.
    #[error("path outside the vault tree: {path}")]
    OutsideVault {
        /// The offending path.
        path: PathBuf,
    },
    /// A glob pattern could not be parsed.
    #[error("invalid glob pattern {pattern}: {source}")]
    InvalidPattern {
        /// The pattern as given.
        pattern: String,
        /// Parse error from the glob crate.
        source: glob::PatternError,
    },
    /// Any other I/O failure, tagged with the path it occurred on.
    #[error("vault I/O error at {path}: {source}")]
    Io {
        /// Path the operation was acting on.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

impl VaultError {
    fn from_io(path: &Path, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound {
                path: path.to_path_buf(),
            },
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied {
                path: path.to_path_buf(),
            },
            _ => Self::Io {
                path: path.to_path_buf(),
                source: err,
            },
        }
    }
}

/// Typed handle to one vault tree rooted at a single directory.
#[derive(Debug, Clone)]
pub struct VaultStore {
    root: PathBuf,
}

impl VaultStore {
    /// Open an existing vault rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::NotFound`] if the root directory is missing.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, VaultError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(VaultError::NotFound { path: root });
        }
        Ok(Self { root })
    }

    /// Create the full vault tree under `root` and open it.
    ///
    /// Creates every allow-listed folder. Idempotent: an existing tree is
    /// left untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created.
    pub fn init(root: impl Into<PathBuf>) -> Result<Self, VaultError> {
        let root = root.into();
        for dir in folders::ALL {
            let path = root.join(dir);
            fs::create_dir_all(&path).map_err(|e| VaultError::from_io(&path, e))?;
        }
        debug!(root = %root.display(), "vault tree initialised");
        Ok(Self { root })
    }

    /// The vault root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a vault-relative path to an absolute one, rejecting
    /// traversal outside the root.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::OutsideVault`] for absolute paths or paths
    /// containing `..` components.
    pub fn resolve(&self, rel: impl AsRef<Path>) -> Result<PathBuf, VaultError> {
        let rel = rel.as_ref();
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(VaultError::OutsideVault {
                path: rel.to_path_buf(),
            });
        }
        Ok(self.root.join(rel))
    }

    /// Read the full contents of a vault file.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::NotFound`] for missing files.
    pub fn read(&self, rel: impl AsRef<Path>) -> Result<Vec<u8>, VaultError> {
        let path = self.resolve(rel)?;
        fs::read(&path).map_err(|e| VaultError::from_io(&path, e))
    }

    /// Read a vault file as UTF-8 text.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or not valid UTF-8.
    pub fn read_to_string(&self, rel: impl AsRef<Path>) -> Result<String, VaultError> {
        let path = self.resolve(rel)?;
        fs::read_to_string(&path).map_err(|e| VaultError::from_io(&path, e))
    }

    /// Write a file atomically: contents land under a temporary name in the
    /// destination directory, then an atomic rename publishes them.
    ///
    /// Parent directories are created only when they are on the fixed
    /// allow-list; anything else fails instead of silently growing the tree.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or disallowed parent.
    pub fn write_atomic(&self, rel: impl AsRef<Path>, bytes: &[u8]) -> Result<(), VaultError> {
        let rel = rel.as_ref();
        let path = self.resolve(rel)?;
        self.ensure_parent(rel, &path)?;

        let parent = path.parent().ok_or_else(|| VaultError::OutsideVault {
            path: rel.to_path_buf(),
        })?;
        let tmp = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let mut file = fs::File::create(&tmp).map_err(|e| VaultError::from_io(&tmp, e))?;
        file.write_all(bytes)
            .and_then(|()| file.flush())
            .map_err(|e| VaultError::from_io(&tmp, e))?;
        drop(file);

        fs::rename(&tmp, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            VaultError::from_io(&path, e)
        })?;
        Ok(())
    }

    /// Append bytes to a file using append-only open semantics, flushing
    /// before returning. Used by the audit mirror.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or disallowed parent.
    pub fn append(&self, rel: impl AsRef<Path>, bytes: &[u8]) -> Result<(), VaultError> {
        let rel = rel.as_ref();
        let path = self.resolve(rel)?;
        self.ensure_parent(rel, &path)?;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| VaultError::from_io(&path, e))?;
        file.write_all(bytes)
            .and_then(|()| file.flush())
            .map_err(|e| VaultError::from_io(&path, e))
    }

    /// Move a file by atomic rename within the vault.
    ///
    /// This is the synchronisation primitive of the approval protocol.
    /// A cross-filesystem move fails loudly as [`VaultError::CrossDevice`];
    /// the store never degrades to copy-then-delete.
    ///
    /// # Errors
    ///
    /// Returns an error if the source is missing, the rename crosses
    /// filesystems, or the destination parent is disallowed.
    pub fn rename(
        &self,
        src_rel: impl AsRef<Path>,
        dst_rel: impl AsRef<Path>,
    ) -> Result<(), VaultError> {
        let dst_rel = dst_rel.as_ref();
        let src = self.resolve(src_rel.as_ref())?;
        let dst = self.resolve(dst_rel)?;
        self.ensure_parent(dst_rel, &dst)?;

        fs::rename(&src, &dst).map_err(|e| {
            if is_cross_device(&e) {
                VaultError::CrossDevice { src, dst }
            } else {
                VaultError::from_io(&src, e)
            }
        })?;
        Ok(())
    }

    /// List vault files matching a glob pattern relative to the root,
    /// e.g. `Approved/*.md`. Returns vault-relative paths, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::InvalidPattern`] for unparsable patterns.
    pub fn list(&self, pattern: &str) -> Result<Vec<PathBuf>, VaultError> {
        let full = self.root.join(pattern);
        let full_str = full.to_string_lossy().into_owned();
        let paths = glob::glob(&full_str).map_err(|source| VaultError::InvalidPattern {
            pattern: pattern.to_owned(),
            source,
        })?;

        let mut out = Vec::new();
        for entry in paths {
            let Ok(path) = entry else { continue };
            if let Ok(rel) = path.strip_prefix(&self.root) {
                out.push(rel.to_path_buf());
            }
        }
        out.sort();
        Ok(out)
    }

    /// Whether a vault-relative path exists.
    pub fn exists(&self, rel: impl AsRef<Path>) -> bool {
        self.resolve(rel).map(|p| p.exists()).unwrap_or(false)
    }

    /// Delete a vault file.
    ///
    /// Refuses to delete anything under `Pending_Approval/`, `Approved/`,
    /// `Rejected/`, or the `Plans/` subtree: those folders are the approval
    /// record and may only change through moves.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::ProtectedPath`] for protected paths.
    pub fn delete(&self, rel: impl AsRef<Path>) -> Result<(), VaultError> {
        let rel = rel.as_ref();
        for prefix in PROTECTED_PREFIXES {
            if rel.starts_with(prefix) {
                return Err(VaultError::ProtectedPath {
                    path: rel.to_path_buf(),
                });
            }
        }
        let path = self.resolve(rel)?;
        fs::remove_file(&path).map_err(|e| VaultError::from_io(&path, e))
    }

    /// Parent-directory policy: allow-listed folders may be created on
    /// demand; anything else must already exist.
    fn ensure_parent(&self, rel: &Path, abs: &Path) -> Result<(), VaultError> {
        let Some(parent_abs) = abs.parent() else {
            return Err(VaultError::OutsideVault {
                path: rel.to_path_buf(),
            });
        };
        if parent_abs.is_dir() {
            return Ok(());
        }
        let parent_rel = rel.parent().unwrap_or(Path::new(""));
        let allowed = folders::ALL
            .iter()
            .any(|dir| Path::new(dir) == parent_rel || parent_rel.starts_with(dir));
        if !allowed {
            return Err(VaultError::OutsideVault {
                path: rel.to_path_buf(),
            });
        }
        fs::create_dir_all(parent_abs).map_err(|e| VaultError::from_io(parent_abs, e))
    }
}

/// Whether an I/O error is the platform's cross-device rename failure.
fn is_cross_device(err: &std::io::Error) -> bool {
    // EXDEV on unix, ERROR_NOT_SAME_DEVICE on windows.
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(18)
    }
    #[cfg(windows)]
    {
        err.raw_os_error() == Some(17)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = err;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_vault() -> (tempfile::TempDir, VaultStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let vault = VaultStore::init(dir.path()).expect("init vault");
        (dir, vault)
    }

    #[test]
    fn test_init_creates_tree() {
        let (_dir, vault) = temp_vault();
        assert!(vault.exists(folders::INBOX));
        assert!(vault.exists(folders::PENDING_APPROVAL));
        assert!(vault.exists(folders::PLANS_FAILED));
        assert!(vault.exists(folders::SOCIAL_INBOX));
        assert!(vault.exists(folders::BUSINESS_ACCOUNTING));
    }

    #[test]
    fn test_open_missing_root() {
        let result = VaultStore::open("/nonexistent/vault/root");
        assert!(matches!(result, Err(VaultError::NotFound { .. })));
    }

    #[test]
    fn test_write_atomic_and_read() {
        let (_dir, vault) = temp_vault();
        vault
            .write_atomic("Inbox/note.md", b"hello")
            .expect("write");
        let bytes = vault.read("Inbox/note.md").expect("read");
        assert_eq!(bytes, b"hello");
    }

    #[test]
    fn test_write_atomic_leaves_no_temp_files() {
        let (_dir, vault) = temp_vault();
        vault.write_atomic("Inbox/a.md", b"x").expect("write");
        let leftovers = vault.list("Inbox/.tmp-*").expect("list");
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_write_refuses_unknown_parent() {
        let (_dir, vault) = temp_vault();
        let result = vault.write_atomic("Random_Folder/x.md", b"x");
        assert!(matches!(result, Err(VaultError::OutsideVault { .. })));
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        let (_dir, vault) = temp_vault();
        assert!(matches!(
            vault.resolve("../escape.md"),
            Err(VaultError::OutsideVault { .. })
        ));
        assert!(matches!(
            vault.resolve("/etc/passwd"),
            Err(VaultError::OutsideVault { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_rename_preserves_inode() {
        use std::os::unix::fs::MetadataExt;

        let (_dir, vault) = temp_vault();
        vault
            .write_atomic("Pending_Approval/p.md", b"plan")
            .expect("write");
        let before = fs::metadata(vault.resolve("Pending_Approval/p.md").expect("resolve"))
            .expect("metadata")
            .ino();

        vault
            .rename("Pending_Approval/p.md", "Approved/p.md")
            .expect("rename");
        let after = fs::metadata(vault.resolve("Approved/p.md").expect("resolve"))
            .expect("metadata")
            .ino();

        assert_eq!(before, after, "move must preserve inode identity");
        assert!(!vault.exists("Pending_Approval/p.md"));
    }

    #[test]
    fn test_rename_missing_source() {
        let (_dir, vault) = temp_vault();
        let result = vault.rename("Pending_Approval/ghost.md", "Approved/ghost.md");
        assert!(matches!(result, Err(VaultError::NotFound { .. })));
    }

    #[test]
    fn test_delete_gated_on_protected_folders() {
        let (_dir, vault) = temp_vault();
        vault.write_atomic("Approved/p.md", b"plan").expect("write");
        vault
            .write_atomic("Plans/completed/q.md", b"plan")
            .expect("write");

        for rel in ["Approved/p.md", "Plans/completed/q.md", "Rejected/x.md"] {
            let result = vault.delete(rel);
            assert!(
                matches!(result, Err(VaultError::ProtectedPath { .. })),
                "delete of {rel} should be refused"
            );
        }

        // Unprotected folders still allow deletes.
        vault.write_atomic("Done/d.md", b"done").expect("write");
        vault.delete("Done/d.md").expect("delete in Done/");
    }

    #[test]
    fn test_list_glob() {
        let (_dir, vault) = temp_vault();
        vault.write_atomic("Approved/a.md", b"1").expect("write");
        vault.write_atomic("Approved/b.md", b"2").expect("write");
        vault.write_atomic("Approved/c.txt", b"3").expect("write");

        let listed = vault.list("Approved/*.md").expect("list");
        assert_eq!(
            listed,
            vec![
                PathBuf::from("Approved/a.md"),
                PathBuf::from("Approved/b.md")
            ]
        );
    }

    #[test]
    fn test_list_invalid_pattern() {
        let (_dir, vault) = temp_vault();
        let result = vault.list("Approved/[");
        assert!(matches!(result, Err(VaultError::InvalidPattern { .. })));
    }

    #[test]
    fn test_append_accumulates() {
        let (_dir, vault) = temp_vault();
        vault.append("Logs/x.json", b"line1\n").expect("append");
        vault.append("Logs/x.json", b"line2\n").expect("append");
        let text = vault.read_to_string("Logs/x.json").expect("read");
        assert_eq!(text, "line1\nline2\n");
    }
}
