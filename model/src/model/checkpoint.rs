use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use tracing::info;

use super::builder::ModelBuilder;
use super::config::NetworkConfig;
use super::core::CapsNet;
use super::layers::Layer;
use crate::error::{CapsError, Result};

pub const CHECKPOINT_VERSION: u32 = 1;

/// Architecture du réseau et tous ses tenseurs de paramètres nommés.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub network: NetworkConfig,
    pub params: BTreeMap<String, ArrayD<f32>>,
}

impl Checkpoint {
    pub fn from_model(model: &CapsNet) -> Self {
        let params = model
            .parameters()
            .into_iter()
            .map(|(name, value)| (name, value.to_owned()))
            .collect();
        Self {
            version: CHECKPOINT_VERSION,
            network: model.network_config.clone(),
            params,
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let writer = BufWriter::new(File::create(path.as_ref())?);
        serde_json::to_writer(writer, self)?;
        info!(path = %path.as_ref().display(), params = self.params.len(), "checkpoint saved");
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let checkpoint: Self = serde_json::from_reader(reader)?;
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(CapsError::Checkpoint(format!(
                "unsupported version {} (expected {})",
                checkpoint.version, CHECKPOINT_VERSION
            )));
        }
        Ok(checkpoint)
    }

    /// Copie les tenseurs dans `model`, noms et formes doivent correspondre exactement.
    pub fn restore_into(&self, model: &mut CapsNet) -> Result<()> {
        let mut params = model.parameters_mut();
        if params.len() != self.params.len() {
            return Err(CapsError::Checkpoint(format!(
                "checkpoint holds {} tensors, model has {}",
                self.params.len(),
                params.len()
            )));
        }
        for param in params.iter_mut() {
            let stored = self.params.get(&param.name).ok_or_else(|| {
                CapsError::Checkpoint(format!("missing tensor {}", param.name))
            })?;
            if stored.shape() != param.value.shape() {
                return Err(CapsError::Checkpoint(format!(
                    "tensor {} has shape {:?}, model expects {:?}",
                    param.name,
                    stored.shape(),
                    param.value.shape()
                )));
            }
            param.value.assign(stored);
        }
        Ok(())
    }

    /// Reconstruit l'architecture sauvegardée et charge ses poids.
    pub fn into_model(self) -> Result<CapsNet> {
        let mut model = ModelBuilder::new()
            .with_network_config(self.network.clone())
            .build()?;
        self.restore_into(&mut model)?;
        Ok(model)
    }
}

impl CapsNet {
    pub fn save_weights<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        Checkpoint::from_model(self).save(path)
    }

    pub fn load_weights<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        Checkpoint::load(path)?.restore_into(self)
    }
}
