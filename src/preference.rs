use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferenceRecord {
    pub prompt: String,
    pub chosen: String,
    pub rejected: String,
}

impl PreferenceRecord {
    pub fn new(
        prompt: impl Into<String>,
        chosen: impl Into<String>,
        rejected: impl Into<String>,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            chosen: chosen.into(),
            rejected: rejected.into(),
        }
    }
}

/// Judgments in the order they were made. Duplicate prompts are kept.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PreferenceStore {
    records: Vec<PreferenceRecord>,
}

impl PreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: PreferenceRecord) {
        self.records.push(record);
    }

    pub(crate) fn pop(&mut self) -> Option<PreferenceRecord> {
        self.records.pop()
    }

    pub fn records(&self) -> &[PreferenceRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Every prompt, once per record.
    pub fn prompts(&self) -> Vec<String> {
        self.records.iter().map(|record| record.prompt.clone()).collect()
    }

    /// Replaces whatever is at `path` with the whole store. The new contents
    /// are written beside the target first and then renamed over it.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let serialized = serde_json::to_string_pretty(&self.records)?;
        let staging_path = staging_path(path);
        fs::write(&staging_path, serialized)?;
        if let Err(error) = fs::rename(&staging_path, path) {
            if let Err(cleanup_error) = fs::remove_file(&staging_path) {
                warn!(
                    "could not remove {}: {}",
                    staging_path.display(),
                    cleanup_error
                );
            }
            return Err(error.into());
        }
        info!("saved {} preferences to {}", self.len(), path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|error| match error.kind() {
            io::ErrorKind::NotFound => PipelineError::not_found("preference file", path),
            _ => PipelineError::Io(error),
        })?;
        let records: Vec<PreferenceRecord> = serde_json::from_str(&contents)?;
        Ok(Self { records })
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let mut file_name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("preferences"));
    file_name.push(".tmp");
    path.with_file_name(file_name)
}

/// Column-oriented view of the store, the shape the trainers consume.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PreferenceDataset {
    pub prompt: Vec<String>,
    pub chosen: Vec<String>,
    pub rejected: Vec<String>,
}

pub fn prepare_dataset(records: &[PreferenceRecord]) -> PreferenceDataset {
    let mut dataset = PreferenceDataset::default();
    for record in records {
        dataset.prompt.push(record.prompt.clone());
        dataset.chosen.push(record.chosen.clone());
        dataset.rejected.push(record.rejected.clone());
    }
    dataset
}

impl PreferenceDataset {
    pub fn len(&self) -> usize {
        self.prompt.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompt.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<PreferenceRecord> {
        Some(PreferenceRecord::new(
            self.prompt.get(index)?.clone(),
            self.chosen.get(index)?.clone(),
            self.rejected.get(index)?.clone(),
        ))
    }

    fn select(&self, indices: &[usize]) -> PreferenceDataset {
        let mut selected = PreferenceDataset::default();
        for &i in indices {
            selected.prompt.push(self.prompt[i].clone());
            selected.chosen.push(self.chosen[i].clone());
            selected.rejected.push(self.rejected[i].clone());
        }
        selected
    }

    /// Shuffles, then holds out `ceil(len * test_fraction)` rows for
    /// evaluation. Returns `(train, test)`.
    pub fn train_test_split(
        &self,
        test_fraction: f32,
        rng: &mut StdRng,
    ) -> (PreferenceDataset, PreferenceDataset) {
        let mut indices = (0..self.len()).collect::<Vec<_>>();
        indices.shuffle(rng);
        let test_count = ((self.len() as f32) * test_fraction.clamp(0., 1.)).ceil() as usize;
        let (test, train) = indices.split_at(test_count);
        (self.select(train), self.select(test))
    }
}
