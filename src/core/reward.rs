use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::{info, warn};
use ndarray::prelude::*;

use super::serialization::deserialize;
use super::vocabulary::TokenVocabulary;
use super::{Parameter, Parameterized, Scorer};
use crate::error::{PipelineError, Result};

pub const REWARD_MODEL_IDENTIFIER: &str = "reward_model";
pub const REWARD_MODEL_WEIGHTS_FILE: &str = "reward_model.npz";

/// Scores a text by a linear function of its character frequencies.
pub struct LinearRewardModel {
    identifier: String,
    token_vocabulary: TokenVocabulary,
    weights: Rc<Parameter>,
    bias: Rc<Parameter>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RewardModelSource {
    Supplied(PathBuf),
    DefaultPretrained,
}

impl LinearRewardModel {
    pub fn new(
        identifier: &str,
        token_vocabulary: TokenVocabulary,
        weights: Array1<f32>,
        bias: f32,
    ) -> Self {
        assert_eq!(weights.len(), token_vocabulary.size());
        Self {
            weights: Parameter::new(&format!("{}_weights", identifier), weights.into_dyn()),
            bias: Parameter::new(&format!("{}_bias", identifier), array![bias].into_dyn()),
            identifier: identifier.to_owned(),
            token_vocabulary,
        }
    }

    /// Generic prior: plain prose is rewarded, stray symbols are penalized.
    pub fn default_pretrained(token_vocabulary: TokenVocabulary) -> Self {
        let weights = Array1::from_shape_fn(token_vocabulary.size(), |id| {
            match token_vocabulary.token(id) {
                Some(c) if c.is_ascii_lowercase() => 1.0,
                Some(c) if c.is_ascii_uppercase() => 0.25,
                Some(' ') | Some('.') | Some(',') => 0.5,
                Some(c) if c.is_ascii_digit() => 0.0,
                _ => -1.0,
            }
        });
        Self::new(REWARD_MODEL_IDENTIFIER, token_vocabulary, weights, 0.0)
    }

    /// Reads `reward_model.npz` from a reward-model directory.
    pub fn load(token_vocabulary: TokenVocabulary, directory: &Path) -> Result<Self> {
        let size = token_vocabulary.size();
        let model = Self::new(REWARD_MODEL_IDENTIFIER, token_vocabulary, Array1::zeros(size), 0.0);
        deserialize(&model, &directory.join(REWARD_MODEL_WEIGHTS_FILE))?;
        Ok(model)
    }
}

impl Parameterized for LinearRewardModel {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn parameters(&self) -> Vec<Rc<Parameter>> {
        vec![self.weights.clone(), self.bias.clone()]
    }
}

impl Scorer for LinearRewardModel {
    fn score(&self, text: &str, max_length: usize) -> Result<f32> {
        let mut ids = self.token_vocabulary.tokenize(text);
        ids.truncate(max_length);
        let bias = self.bias.borrow_array()[0];
        if ids.is_empty() {
            return Ok(bias);
        }
        let weights = self.weights.borrow_array();
        let total: f32 = ids.iter().map(|&id| weights[id]).sum();
        let reward = bias + total / ids.len() as f32;
        if !reward.is_finite() {
            return Err(PipelineError::ScoringFailure(format!(
                "non-finite reward for {:?}",
                text
            )));
        }
        Ok(reward)
    }
}

/// Uses the reward model at `path` when one has been supplied there, otherwise
/// falls back to `LinearRewardModel::default_pretrained`.
pub fn load_reward_model(
    token_vocabulary: TokenVocabulary,
    path: &Path,
) -> Result<(LinearRewardModel, RewardModelSource)> {
    if !path.exists() {
        warn!(
            "reward model not found at {}, using the default pretrained scorer",
            path.display()
        );
        return Ok((
            LinearRewardModel::default_pretrained(token_vocabulary),
            RewardModelSource::DefaultPretrained,
        ));
    }
    let model = LinearRewardModel::load(token_vocabulary, path)?;
    info!("loaded reward model from {}", path.display());
    Ok((model, RewardModelSource::Supplied(path.to_owned())))
}
