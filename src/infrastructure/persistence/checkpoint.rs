//! Directory checkpoints of a trained ensemble.
//!
//! ```text
//! <dir>/manifest.json      config, batch shape, model count, phase
//! <dir>/model_{i}.json     generator + discriminator parameters of model i
//! <dir>/meta_learner.json  meta-learner parameters
//! ```
//!
//! Optimizer moments are not stored; a restored ensemble resumes with fresh Adam state.

use crate::application::ml::ensemble::{EnsemblePhase, GafWganEnsemble};
use crate::application::ml::meta_learner::MetaLearner;
use crate::application::ml::wgan::ModelSnapshot;
use crate::domain::errors::CheckpointError;
use crate::domain::ml::model_config::EnsembleConfig;
use crate::domain::ml::model_metrics::ModelMetrics;
use crate::domain::ml::sample::BatchShape;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

const MANIFEST_FILE: &str = "manifest.json";
const META_FILE: &str = "meta_learner.json";
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub format_version: u32,
    pub config: EnsembleConfig,
    pub shape: BatchShape,
    pub n_models: usize,
    pub phase: EnsemblePhase,
    pub latest_metrics: Option<ModelMetrics>,
    pub saved_at: DateTime<Utc>,
}

pub struct CheckpointStore {
    dir: PathBuf,
}

fn io_error(path: &Path, source: std::io::Error) -> CheckpointError {
    CheckpointError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn serde_error(path: &Path, source: serde_json::Error) -> CheckpointError {
    CheckpointError::Serde {
        path: path.display().to_string(),
        source,
    }
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn model_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("model_{index}.json"))
    }

    /// Atomic write: temp file then rename.
    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), CheckpointError> {
        let content = serde_json::to_string(value).map_err(|e| serde_error(path, e))?;
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, content).map_err(|e| io_error(&temp_path, e))?;
        fs::rename(&temp_path, path).map_err(|e| io_error(path, e))
    }

    fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<T, CheckpointError> {
        let content = fs::read_to_string(path).map_err(|e| io_error(path, e))?;
        serde_json::from_str(&content).map_err(|e| serde_error(path, e))
    }

    pub fn save(&self, ensemble: &GafWganEnsemble) -> Result<CheckpointManifest, CheckpointError> {
        fs::create_dir_all(&self.dir).map_err(|e| io_error(&self.dir, e))?;

        for (index, model) in ensemble.models().iter().enumerate() {
            self.write_json(&self.model_path(index), &model.snapshot())?;
        }
        self.write_json(&self.dir.join(META_FILE), ensemble.meta_learner())?;

        let manifest = CheckpointManifest {
            format_version: FORMAT_VERSION,
            config: ensemble.config().clone(),
            shape: ensemble.shape(),
            n_models: ensemble.models().len(),
            phase: ensemble.phase(),
            latest_metrics: ensemble.latest_metrics().cloned(),
            saved_at: Utc::now(),
        };
        // Written last so a partial checkpoint never has a manifest.
        self.write_json(&self.dir.join(MANIFEST_FILE), &manifest)?;

        info!(
            "Saved checkpoint of {} models ({}) to {:?}",
            manifest.n_models, manifest.phase, self.dir
        );
        Ok(manifest)
    }

    pub fn load_manifest(&self) -> Result<CheckpointManifest, CheckpointError> {
        self.read_json(&self.dir.join(MANIFEST_FILE))
    }

    /// Rebuilds the ensemble without retraining.
    pub fn load(&self) -> Result<GafWganEnsemble, CheckpointError> {
        let manifest = self.load_manifest()?;
        if manifest.n_models != manifest.config.n_models {
            return Err(CheckpointError::CountMismatch {
                expected: manifest.n_models,
                actual: manifest.config.n_models,
            });
        }

        let mut snapshots = Vec::with_capacity(manifest.n_models);
        for index in 0..manifest.n_models {
            let path = self.model_path(index);
            if !path.exists() {
                return Err(CheckpointError::MissingModel { index });
            }
            snapshots.push(self.read_json::<ModelSnapshot>(&path)?);
        }
        let meta: MetaLearner = self.read_json(&self.dir.join(META_FILE))?;

        let ensemble = GafWganEnsemble::from_parts(
            manifest.config,
            manifest.shape,
            snapshots,
            meta,
            manifest.phase,
        )?
        .with_latest_metrics(manifest.latest_metrics);
        info!(
            "Loaded checkpoint of {} models ({}) from {:?}",
            manifest.n_models, manifest.phase, self.dir
        );
        Ok(ensemble)
    }
}
