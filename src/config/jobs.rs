//! Sync job descriptors.
//!
//! Jobs are read from a TOML file holding an ordered `[[sync_jobs]]` list.
//! When the file does not exist, up to two implicit jobs are built from flat
//! `MIRROR_*` settings: an external-library job and an upload-library job.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ConfigError, StorageConfig};

/// Jobs file looked up relative to the config base directory.
pub const DEFAULT_JOBS_FILE: &str = "sync_jobs.toml";

/// One source owner to target owner mirroring relationship.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncJob {
    pub name: String,
    pub source_user_id: Uuid,
    pub target_user_id: Uuid,
    pub target_library_id: Uuid,
    pub source_path_prefix: String,
    pub target_path_prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub album_id: Option<Uuid>,
}

#[derive(Debug, Default, Deserialize)]
struct JobsFile {
    #[serde(default)]
    sync_jobs: Vec<RawJob>,
}

/// Unvalidated job entry; every field is optional so a missing one can be
/// reported by name instead of as a generic parse error.
#[derive(Debug, Default, Deserialize)]
struct RawJob {
    name: Option<String>,
    source_user_id: Option<String>,
    target_user_id: Option<String>,
    target_library_id: Option<String>,
    source_path_prefix: Option<String>,
    target_path_prefix: Option<String>,
    album_id: Option<String>,
}

/// Loads jobs from `path` if it exists, otherwise from flat settings.
pub(super) fn load_jobs(
    path: &Path,
    layered: &mut BTreeMap<String, String>,
    storage: &StorageConfig,
) -> Result<Vec<SyncJob>, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => parse_jobs(&contents).map_err(|err| match err {
            JobsParseError::Toml(source) => ConfigError::JobsFileParse {
                path: path.to_path_buf(),
                source,
            },
            JobsParseError::Config(err) => err,
        }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            implicit_jobs(layered, storage)
        }
        Err(source) => Err(ConfigError::JobsFileRead {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[derive(Debug)]
pub(super) enum JobsParseError {
    Toml(toml::de::Error),
    Config(ConfigError),
}

impl From<ConfigError> for JobsParseError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

/// Parses the TOML job list, keeping file order.
pub(super) fn parse_jobs(contents: &str) -> Result<Vec<SyncJob>, JobsParseError> {
    let file: JobsFile = toml::from_str(contents).map_err(JobsParseError::Toml)?;
    let mut jobs = Vec::with_capacity(file.sync_jobs.len());
    for (index, raw) in file.sync_jobs.into_iter().enumerate() {
        jobs.push(raw.into_job(index)?);
    }
    Ok(jobs)
}

impl RawJob {
    fn into_job(self, index: usize) -> Result<SyncJob, ConfigError> {
        let name = match self.name.map(|n| n.trim().to_string()) {
            Some(name) if !name.is_empty() => name,
            _ => {
                return Err(ConfigError::MissingJobField {
                    job: format!("#{}", index + 1),
                    field: "name",
                });
            }
        };

        let source_user_id = required_uuid(&name, "source_user_id", self.source_user_id)?;
        let target_user_id = required_uuid(&name, "target_user_id", self.target_user_id)?;
        let target_library_id =
            required_uuid(&name, "target_library_id", self.target_library_id)?;
        let source_path_prefix =
            required_text(&name, "source_path_prefix", self.source_path_prefix)?;
        // Empty keeps the source path, placed in the target library.
        let target_path_prefix = self
            .target_path_prefix
            .map(|v| v.trim().to_string())
            .unwrap_or_default();
        let album_id = match self.album_id.filter(|v| !v.trim().is_empty()) {
            Some(value) => Some(parse_uuid(&name, "album_id", &value)?),
            None => None,
        };

        Ok(SyncJob {
            name,
            source_user_id,
            target_user_id,
            target_library_id,
            source_path_prefix,
            target_path_prefix,
            album_id,
        })
    }
}

fn required_text(
    job: &str,
    field: &'static str,
    value: Option<String>,
) -> Result<String, ConfigError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::MissingJobField {
            job: job.to_string(),
            field,
        })
}

fn required_uuid(
    job: &str,
    field: &'static str,
    value: Option<String>,
) -> Result<Uuid, ConfigError> {
    let value = required_text(job, field, value)?;
    parse_uuid(job, field, &value)
}

fn parse_uuid(job: &str, field: &'static str, value: &str) -> Result<Uuid, ConfigError> {
    Uuid::parse_str(value.trim()).map_err(|_| ConfigError::InvalidJobField {
        job: job.to_string(),
        field,
        value: value.to_string(),
    })
}

/// Builds the implicit jobs from flat settings.
///
/// The external-library job exists when `SOURCE_PATH_PREFIX` is set. The
/// upload-library job exists when `UPLOAD_SOURCE_USER_ID` is set; its source
/// prefix is the source owner's folder inside the upload tree.
fn implicit_jobs(
    layered: &mut BTreeMap<String, String>,
    storage: &StorageConfig,
) -> Result<Vec<SyncJob>, ConfigError> {
    let mut take = |key: &str| layered.remove(key).filter(|v| !v.trim().is_empty());

    let source_user_id = take("SOURCE_USER_ID");
    let target_user_id = take("TARGET_USER_ID");
    let target_library_id = take("TARGET_LIBRARY_ID");
    let source_path_prefix = take("SOURCE_PATH_PREFIX");
    let target_path_prefix = take("TARGET_PATH_PREFIX");
    let album_id = take("ALBUM_ID");
    let upload_source_user_id = take("UPLOAD_SOURCE_USER_ID");
    let upload_target_user_id = take("UPLOAD_TARGET_USER_ID");
    let upload_target_library_id = take("UPLOAD_TARGET_LIBRARY_ID");
    let upload_target_path_prefix = take("UPLOAD_TARGET_PATH_PREFIX");

    let mut jobs = Vec::new();

    if source_path_prefix.is_some() {
        jobs.push(
            RawJob {
                name: Some("external-library".to_string()),
                source_user_id,
                target_user_id: target_user_id.clone(),
                target_library_id,
                source_path_prefix,
                target_path_prefix,
                album_id: album_id.clone(),
            }
            .into_job(jobs.len())?,
        );
    }

    if let Some(upload_source) = upload_source_user_id {
        let upload_root = storage.upload_root.to_string_lossy();
        let prefix = format!(
            "{}/library/{}/",
            upload_root.trim_end_matches('/'),
            upload_source.trim()
        );
        jobs.push(
            RawJob {
                name: Some("internal-library".to_string()),
                source_user_id: Some(upload_source),
                target_user_id: upload_target_user_id.or(target_user_id),
                target_library_id: upload_target_library_id,
                source_path_prefix: Some(prefix),
                target_path_prefix: upload_target_path_prefix,
                album_id,
            }
            .into_job(jobs.len())?,
        );
    }

    Ok(jobs)
}

/// Rejects duplicate names and jobs mirroring a user onto itself.
pub fn validate_jobs(jobs: &[SyncJob]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for job in jobs {
        if !seen.insert(job.name.as_str()) {
            return Err(ConfigError::DuplicateJobName {
                name: job.name.clone(),
            });
        }
        if job.source_user_id == job.target_user_id {
            return Err(ConfigError::SameSourceAndTarget {
                job: job.name.clone(),
            });
        }
    }
    Ok(())
}
