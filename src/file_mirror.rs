//! Hardlink mirroring of derived files (thumbnails, previews, face crops).
//!
//! Every path handled here is normalized lexically and must stay inside one
//! of the configured storage roots. A target link always lives under the same
//! root as its source, which also keeps both names on one filesystem.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::StorageConfig;

/// Path remapping failures. Always fail closed: no file operation follows.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("path '{path}' does not start with prefix '{prefix}'")]
    NotUnderPrefix { path: String, prefix: String },
    #[error("path '{path}' normalizes to '{resolved}', which escapes '{root}'")]
    Escapes {
        path: String,
        resolved: String,
        root: String,
    },
}

/// Reasons a single file was not mirrored. The caller skips the file.
#[derive(Debug, Error)]
pub enum FileMirrorError {
    #[error("source '{0}' is outside the storage roots")]
    SourceOutsideRoots(PathBuf),
    #[error("source '{0}' does not exist")]
    SourceMissing(PathBuf),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("failed to link '{source_path}' to '{target}': {error}")]
    Link {
        source_path: PathBuf,
        target: PathBuf,
        #[source]
        error: std::io::Error,
    },
}

/// Result of a successful mirror call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorOutcome {
    /// A new link was created by this call.
    Linked(PathBuf),
    /// The target name already existed; nothing was changed.
    AlreadyPresent(PathBuf),
}

impl MirrorOutcome {
    pub fn path(&self) -> &Path {
        match self {
            Self::Linked(path) | Self::AlreadyPresent(path) => path,
        }
    }

    /// Only links created by this call are undone on rollback.
    pub fn created(&self) -> bool {
        matches!(self, Self::Linked(_))
    }
}

/// Outcome of removing a set of target links.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UnmirrorReport {
    pub removed: usize,
    pub missing: usize,
    pub failed: Vec<(PathBuf, String)>,
}

impl UnmirrorReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Creates and removes hardlinks confined to the storage roots.
#[derive(Debug, Clone)]
pub struct FileMirror {
    upload_root: PathBuf,
    roots: Vec<PathBuf>,
}

impl FileMirror {
    pub fn new(storage: &StorageConfig) -> Self {
        Self::with_roots(&storage.upload_root, &storage.external_library_root)
    }

    pub fn with_roots(upload_root: &Path, external_library_root: &Path) -> Self {
        let upload_root = normalize_path(upload_root);
        let external = normalize_path(external_library_root);
        let mut roots = vec![upload_root.clone()];
        if external != upload_root {
            roots.push(external);
        }
        Self { upload_root, roots }
    }

    fn containing_root(&self, path: &Path) -> Option<&Path> {
        self.roots
            .iter()
            .find(|root| path.starts_with(root))
            .map(PathBuf::as_path)
    }

    /// Links a derived file of `source_record` to the equivalent path of `target_record`.
    ///
    /// The owner segment and the record-id file-name prefix are substituted;
    /// everything else in the path is kept.
    pub async fn mirror(
        &self,
        source_path: &str,
        source_owner: Uuid,
        target_owner: Uuid,
        source_record: Uuid,
        target_record: Uuid,
    ) -> Result<MirrorOutcome, FileMirrorError> {
        let source = normalize_path(Path::new(source_path));
        let target = remap_derived_path(
            &source,
            source_owner,
            target_owner,
            source_record,
            target_record,
        );
        self.link(&source, &target).await
    }

    /// Links a person's face crop into the target owner's thumbnail tree:
    /// `thumbs/{owner}/{id[0..2]}/{id[2..4]}/{id}.{ext}` under the upload root.
    pub async fn mirror_person_thumbnail(
        &self,
        source_path: &str,
        target_owner: Uuid,
        target_person: Uuid,
    ) -> Result<MirrorOutcome, FileMirrorError> {
        let source = normalize_path(Path::new(source_path));
        let target = person_thumbnail_path(&self.upload_root, &source, target_owner, target_person);
        self.link(&source, &target).await
    }

    async fn link(&self, source: &Path, target: &Path) -> Result<MirrorOutcome, FileMirrorError> {
        let Some(root) = self.containing_root(source) else {
            return Err(FileMirrorError::SourceOutsideRoots(source.to_path_buf()));
        };

        let target = normalize_path(target);
        if !target.starts_with(root) {
            return Err(PathError::Escapes {
                path: target.display().to_string(),
                resolved: target.display().to_string(),
                root: root.display().to_string(),
            }
            .into());
        }

        let link_err = |error: std::io::Error| FileMirrorError::Link {
            source_path: source.to_path_buf(),
            target: target.clone(),
            error,
        };

        match tokio::fs::symlink_metadata(source).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Err(FileMirrorError::SourceMissing(source.to_path_buf())),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(FileMirrorError::SourceMissing(source.to_path_buf()));
            }
            Err(err) => return Err(link_err(err)),
        }

        if tokio::fs::symlink_metadata(&target).await.is_ok() {
            debug!(target = %target.display(), "Target link already exists");
            return Ok(MirrorOutcome::AlreadyPresent(target));
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(link_err)?;
        }

        match tokio::fs::hard_link(source, &target).await {
            Ok(()) => {
                debug!(
                    source = %source.display(),
                    target = %target.display(),
                    "Hardlinked derived file"
                );
                Ok(MirrorOutcome::Linked(target))
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                Ok(MirrorOutcome::AlreadyPresent(target))
            }
            Err(err) => Err(link_err(err)),
        }
    }

    /// Removes target links. Failures are logged and reported, never raised.
    pub async fn unmirror<P: AsRef<Path>>(&self, paths: &[P]) -> UnmirrorReport {
        let mut report = UnmirrorReport::default();
        for path in paths {
            let path = normalize_path(path.as_ref());
            if self.containing_root(&path).is_none() {
                warn!(path = %path.display(), "Refusing to remove file outside storage roots");
                report
                    .failed
                    .push((path, "outside storage roots".to_string()));
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    debug!(path = %path.display(), "Removed mirrored link");
                    report.removed += 1;
                }
                Err(err) if err.kind() == ErrorKind::NotFound => report.missing += 1,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Failed to remove mirrored link");
                    report.failed.push((path, err.to_string()));
                }
            }
        }
        report
    }
}

/// Remaps an asset's original path from the job's source prefix to its target prefix.
///
/// With an empty target prefix the path is kept but must still stay inside
/// the source prefix after normalization.
pub fn remap_asset_path(
    source_path: &str,
    source_prefix: &str,
    target_prefix: &str,
) -> Result<String, PathError> {
    let Some(rest) = source_path.strip_prefix(source_prefix) else {
        return Err(PathError::NotUnderPrefix {
            path: source_path.to_string(),
            prefix: source_prefix.to_string(),
        });
    };

    let root = if target_prefix.is_empty() {
        source_prefix
    } else {
        target_prefix
    };
    let remapped = format!("{root}{rest}");
    let normalized = normalize_posix(&remapped);

    if !is_within(&normalized, root) {
        return Err(PathError::Escapes {
            path: remapped,
            resolved: normalized,
            root: root.to_string(),
        });
    }
    Ok(normalized)
}

/// Substitutes whole path segments: a segment equal to the source owner id
/// becomes the target owner id, and a segment starting with the source record
/// id gets that prefix swapped for the target record id.
pub fn remap_derived_path(
    source: &Path,
    source_owner: Uuid,
    target_owner: Uuid,
    source_record: Uuid,
    target_record: Uuid,
) -> PathBuf {
    let source_owner = source_owner.to_string();
    let target_owner = target_owner.to_string();
    let source_record = source_record.to_string();
    let target_record = target_record.to_string();

    let mut out = PathBuf::new();
    for component in source.components() {
        match component {
            Component::Normal(segment) => {
                let segment = segment.to_string_lossy();
                if segment == source_owner.as_str() {
                    out.push(&target_owner);
                } else if let Some(rest) = segment.strip_prefix(source_record.as_str()) {
                    out.push(format!("{target_record}{rest}"));
                } else {
                    out.push(segment.as_ref());
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn person_thumbnail_path(
    upload_root: &Path,
    source: &Path,
    target_owner: Uuid,
    target_person: Uuid,
) -> PathBuf {
    let id = target_person.to_string();
    let file_name = match source.extension() {
        Some(ext) => format!("{id}.{}", ext.to_string_lossy()),
        None => id.clone(),
    };
    upload_root
        .join("thumbs")
        .join(target_owner.to_string())
        .join(&id[..2])
        .join(&id[2..4])
        .join(file_name)
}

/// Lexically resolves `.` and `..` without touching the filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(out.components().next_back(), Some(Component::Normal(_))) {
                    out.pop();
                } else if !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// POSIX string normalization; the host stores paths as text.
pub fn normalize_posix(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|last| *last != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

fn is_within(path: &str, root: &str) -> bool {
    let root = normalize_posix(root);
    if root == "/" {
        return path.starts_with('/');
    }
    path == root || path.starts_with(&format!("{root}/"))
}
