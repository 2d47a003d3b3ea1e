use std::fmt;
use std::path::{Path, PathBuf};

use crate::device::DeviceVariant;
use crate::params::{ParameterStore, StimulusKey};

/// Post-processing stage an artifact belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Step {
    /// Raw capture.
    P0,
    /// Trimmed and loudness normalized.
    P1,
    /// Synthetic buffering applied.
    P2,
    /// Timestamps reset to zero.
    P3,
}

impl Step {
    pub fn index(self) -> u8 {
        match self {
            Step::P0 => 0,
            Step::P1 => 1,
            Step::P2 => 2,
            Step::P3 => 3,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.index())
    }
}

/// Names artifacts `TYPE-TABLE-ENTRY_E1-{S|G|R}-VERSION_PN.avi` under one directory.
#[derive(Debug, Clone)]
pub struct ArtifactNamer {
    dir: PathBuf,
    variant: DeviceVariant,
    release: String,
}

impl ArtifactNamer {
    pub fn new(dir: impl Into<PathBuf>, variant: DeviceVariant, release: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            variant,
            release: release.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_name(&self, key: &StimulusKey, step: Step) -> String {
        format!(
            "{key}_E1-{}-{}_{step}.avi",
            self.variant.tag(),
            self.release
        )
    }

    pub fn path(&self, key: &StimulusKey, step: Step) -> PathBuf {
        self.dir.join(self.file_name(key, step))
    }

    /// Finds an existing artifact for `key`, or for an interchangeable entry of the same table.
    pub fn resolve(
        &self,
        key: &StimulusKey,
        step: Step,
        store: &dyn ParameterStore,
    ) -> Option<PathBuf> {
        let own = self.path(key, step);
        if is_artifact(&own) {
            return Some(own);
        }
        let params = store.get(key)?;
        store
            .entries(&key.type_id, &key.table_id)
            .into_iter()
            .filter(|candidate| candidate != key)
            .filter(|candidate| {
                store
                    .get(candidate)
                    .is_some_and(|other| params.interchangeable(other, step))
            })
            .map(|candidate| self.path(&candidate, step))
            .find(|path| is_artifact(path))
    }
}

fn is_artifact(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}
