use std::fs;
use std::io;

use log::{error, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::configuration::PipelineConfiguration;
use crate::core::serialization::serialize;
use crate::core::vocabulary::TokenVocabulary;
use crate::core::Parameterized;
use crate::error::{PipelineError, Result};
use crate::language_model::{self, BigramLanguageModel};
use crate::preference::PreferenceStore;

pub mod dpo;
pub mod ppo;

const PRETRAINING_CONTEXT_WINDOW_SIZE: usize = 100;

/// The preference file is a precondition of every trainer; a missing file
/// means annotation has not happened yet.
pub fn load_preferences(configuration: &PipelineConfiguration) -> Result<PreferenceStore> {
    let path = configuration.preference_path();
    match PreferenceStore::load(&path) {
        Err(error) if error.is_not_found() => {
            error!(
                "no annotations collected yet ({}); run `annotate` first",
                path.display()
            );
            Err(error)
        }
        loaded => loaded,
    }
}

pub fn load_base_policy(
    configuration: &PipelineConfiguration,
    rng: &mut StdRng,
) -> Result<BigramLanguageModel> {
    BigramLanguageModel::load(
        &configuration.model_name,
        TokenVocabulary::default(),
        &configuration.base_policy_path(),
        StdRng::seed_from_u64(rng.gen()),
    )
}

/// Fits a fresh base policy on the configured corpus and writes it where the
/// other entry points look for it. Returns the final mean loss.
pub fn pretrain_base_policy(configuration: &PipelineConfiguration) -> Result<f32> {
    let corpus = fs::read_to_string(&configuration.corpus_path).map_err(|error| {
        match error.kind() {
            io::ErrorKind::NotFound => {
                PipelineError::not_found("training corpus", &configuration.corpus_path)
            }
            _ => PipelineError::Io(error),
        }
    })?;
    let mut rng = StdRng::seed_from_u64(configuration.seed);
    let network = BigramLanguageModel::new(
        &configuration.model_name,
        TokenVocabulary::default(),
        StdRng::seed_from_u64(rng.gen()),
    );
    println!("parameter count: {}", network.parameter_count());
    let loss = language_model::pretrain(
        &network,
        &corpus,
        configuration.pretrain_epochs,
        PRETRAINING_CONTEXT_WINDOW_SIZE,
        configuration.pretrain_learning_rate,
    )?;
    serialize(&network, &configuration.base_policy_path())?;
    info!(
        "base policy written to {}",
        configuration.base_policy_path().display()
    );
    Ok(loss)
}
