//! Prometheus file_sd target file.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::registry::Services;
use crate::{Error, Result};

pub const DEFAULT_TARGET_FILE: &str = "tg_group.json";
pub const JOB_LABEL: &str = "job";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetGroup {
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl TargetGroup {
    pub fn job(&self) -> Option<&str> {
        self.labels.get(JOB_LABEL).map(String::as_str)
    }
}

/// One group per service, empty services included.
pub fn build_groups(services: &Services) -> Vec<TargetGroup> {
    services
        .iter()
        .map(|(job, instances)| TargetGroup {
            targets: instances.values().cloned().collect(),
            labels: BTreeMap::from([(JOB_LABEL.to_string(), job.clone())]),
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct TargetFile {
    path: PathBuf,
}

impl TargetFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the target file from `services`.
    ///
    /// The file is replaced with write-then-rename, so readers see either the
    /// previous contents or the new ones. On error the previous file is left
    /// untouched. Returns the number of groups written.
    pub fn persist(&self, services: &Services) -> Result<usize> {
        let groups = build_groups(services);
        let data = serde_json::to_vec(&groups)?;
        self.write_atomic(&data).map_err(|source| Error::Persist {
            path: self.path.clone(),
            source,
        })?;
        Ok(groups.len())
    }

    /// Parse the groups currently on disk.
    pub fn load(&self) -> Result<Vec<TargetGroup>> {
        let data = std::fs::read(&self.path).map_err(|source| Error::Persist {
            path: self.path.clone(),
            source,
        })?;
        Ok(serde_json::from_slice(&data)?)
    }

    fn write_atomic(&self, data: &[u8]) -> std::io::Result<()> {
        let tmp = self.tmp_path();
        let result = (|| {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(data)?;
            file.sync_all()?;
            std::fs::rename(&tmp, &self.path)
        })();
        if result.is_err() {
            let _ = std::fs::remove_file(&tmp);
        }
        result
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}
