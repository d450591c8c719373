use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

pub const DEFAULT_ANNOTATION_PROMPTS: [&str; 8] = [
    "Explain what artificial intelligence is in simple terms.",
    "Write a short story about a robot learning to paint.",
    "How does the internet work?",
    "What is happiness?",
    "Explain gravity in simple words.",
    "Describe your dream job.",
    "What makes life meaningful?",
    "Explain the solar system.",
];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfiguration {
    pub model_name: String,
    pub model_dir: PathBuf,
    pub corpus_path: PathBuf,
    pub output_dir: PathBuf,
    pub data_dir: PathBuf,
    pub preference_file: String,
    pub annotation_prompts: Vec<String>,

    pub batch_size: usize,
    pub learning_rate: f32,
    pub dpo_learning_rate: f32,
    pub dpo_beta: f32,
    pub dpo_epochs: usize,
    /// Token budget for each chosen or rejected response during DPO.
    pub dpo_max_length: usize,
    pub eval_fraction: f32,
    pub pretrain_epochs: usize,
    pub pretrain_learning_rate: f32,
    pub ppo_steps: usize,
    pub kl_penalty: f32,

    pub max_new_tokens: usize,
    pub annotation_max_new_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
    pub reward_max_length: usize,

    pub seed: u64,
}

impl Default for PipelineConfiguration {
    fn default() -> Self {
        Self {
            model_name: "base_policy".to_owned(),
            model_dir: PathBuf::from("models"),
            corpus_path: PathBuf::from("training_data.txt"),
            output_dir: PathBuf::from("output"),
            data_dir: PathBuf::from("data"),
            preference_file: "preferences.json".to_owned(),
            annotation_prompts: DEFAULT_ANNOTATION_PROMPTS
                .iter()
                .map(|prompt| prompt.to_string())
                .collect(),
            batch_size: 4,
            learning_rate: 0.05,
            dpo_learning_rate: 0.1,
            dpo_beta: 0.1,
            dpo_epochs: 3,
            dpo_max_length: 256,
            eval_fraction: 0.2,
            pretrain_epochs: 3,
            pretrain_learning_rate: 0.5,
            ppo_steps: 100,
            kl_penalty: 0.1,
            max_new_tokens: 50,
            annotation_max_new_tokens: 100,
            temperature: 0.9,
            top_p: 0.9,
            reward_max_length: 256,
            seed: 42,
        }
    }
}

impl PipelineConfiguration {
    /// Reads a JSON configuration file; fields it omits keep their defaults.
    /// With no path, the defaults are used as they are.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let contents = fs::read_to_string(path).map_err(|error| match error.kind() {
            io::ErrorKind::NotFound => PipelineError::not_found("configuration file", path),
            _ => PipelineError::Io(error),
        })?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn preference_path(&self) -> PathBuf {
        self.data_dir.join(&self.preference_file)
    }

    pub fn reward_model_path(&self) -> PathBuf {
        self.output_dir.join("reward_model")
    }

    pub fn base_policy_path(&self) -> PathBuf {
        self.model_dir.join(format!("{}.npz", self.model_name))
    }

    pub fn dpo_model_path(&self) -> PathBuf {
        self.output_dir.join("dpo_model")
    }

    pub fn ppo_model_path(&self) -> PathBuf {
        self.output_dir.join("ppo_model")
    }
}
