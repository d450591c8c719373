//! Preference optimisation directly from chosen/rejected pairs.
//!
//! For a pair with log-ratios `r = log π(y) - log π_ref(y)` against the frozen
//! starting policy, the per-pair loss is
//!
//! ```text
//! L = -log σ(β (r_chosen - r_rejected))
//! ```
//!
//! and minibatches are applied as plain gradient steps on the logit table.

use std::path::Path;
use std::rc::Rc;

use log::info;
use ndarray::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::{load_base_policy, load_preferences};
use crate::configuration::PipelineConfiguration;
use crate::core::optimization::logit_matrix;
use crate::core::serialization::serialize;
use crate::core::vocabulary::TokenVocabulary;
use crate::core::{Parameter, Parameterized};
use crate::error::{PipelineError, Result};
use crate::language_model::{
    accumulate_log_probability_gradient, context_token, sequence_log_probability,
};
use crate::preference::{prepare_dataset, PreferenceDataset, PreferenceRecord};

const LOGGING_STEPS: usize = 5;

#[derive(Clone, Debug, PartialEq)]
pub struct PreferenceEvaluation {
    pub mean_loss: f32,
    /// Fraction of pairs whose chosen response has the larger log-ratio.
    pub accuracy: f32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DpoReport {
    pub step_count: usize,
    pub final_train_loss: f32,
    pub evaluation: Option<PreferenceEvaluation>,
}

fn sigmoid(x: f32) -> f32 {
    1. / (1. + (-x).exp())
}

/// `-log σ(x)`, stable for large |x|.
fn negative_log_sigmoid(x: f32) -> f32 {
    if x >= 0. {
        (-x).exp().ln_1p()
    } else {
        -x + x.exp().ln_1p()
    }
}

struct TokenizedPair {
    context: usize,
    chosen: Vec<usize>,
    rejected: Vec<usize>,
}

pub struct DirectPreferenceTrainer {
    identifier: String,
    token_vocabulary: TokenVocabulary,
    policy_logits: Rc<Parameter>,
    reference_logits: Array2<f32>,
    β: f32,
    learning_rate: f32,
    max_length: usize,
    step_count: usize,
}

impl DirectPreferenceTrainer {
    pub fn new(
        policy: &dyn Parameterized,
        token_vocabulary: TokenVocabulary,
        β: f32,
        learning_rate: f32,
        max_length: usize,
    ) -> Result<Self> {
        let policy_logits = policy.parameters().into_iter().next().ok_or_else(|| {
            PipelineError::OptimizerFailure(format!("{} has no parameters", policy.identifier()))
        })?;
        let reference_logits = logit_matrix(&policy_logits)?;
        Ok(Self {
            identifier: policy.identifier().to_owned(),
            token_vocabulary,
            policy_logits,
            reference_logits,
            β,
            learning_rate,
            max_length,
            step_count: 0,
        })
    }

    fn tokenize(&self, record: &PreferenceRecord) -> TokenizedPair {
        let mut chosen = self.token_vocabulary.tokenize(&record.chosen);
        chosen.truncate(self.max_length);
        let mut rejected = self.token_vocabulary.tokenize(&record.rejected);
        rejected.truncate(self.max_length);
        TokenizedPair {
            context: context_token(&self.token_vocabulary.tokenize(&record.prompt)),
            chosen,
            rejected,
        }
    }

    /// β times the difference of chosen and rejected log-ratios.
    fn margin(&self, logits: ArrayView2<f32>, pair: &TokenizedPair) -> f32 {
        let reference_logits = self.reference_logits.view();
        let log_ratio = |continuation: &[usize]| {
            sequence_log_probability(logits, pair.context, continuation)
                - sequence_log_probability(reference_logits, pair.context, continuation)
        };
        self.β * (log_ratio(&pair.chosen) - log_ratio(&pair.rejected))
    }

    /// One gradient step on the mean loss of `records`. Returns that loss as
    /// measured before the step.
    pub fn train_batch(&mut self, records: &[PreferenceRecord]) -> Result<f32> {
        if records.is_empty() {
            return Err(PipelineError::EmptyDataset("empty minibatch"));
        }
        let logits = logit_matrix(&self.policy_logits)?;
        let mut gradient = Array2::zeros(logits.raw_dim());
        let mut total_loss = 0.;
        for record in records {
            let pair = self.tokenize(record);
            let margin = self.margin(logits.view(), &pair);
            total_loss += negative_log_sigmoid(margin);
            // ascent direction on log σ(margin)
            let weight = (1. - sigmoid(margin)) * self.β / records.len() as f32;
            accumulate_log_probability_gradient(
                logits.view(),
                pair.context,
                &pair.chosen,
                weight,
                &mut gradient,
            );
            accumulate_log_probability_gradient(
                logits.view(),
                pair.context,
                &pair.rejected,
                -weight,
                &mut gradient,
            );
        }
        let mean_loss = total_loss / records.len() as f32;
        if !mean_loss.is_finite() {
            return Err(PipelineError::OptimizerFailure(
                "preference loss diverged to a non-finite value".to_owned(),
            ));
        }
        self.policy_logits
            .borrow_array_mut()
            .scaled_add(self.learning_rate, &gradient);
        self.step_count += 1;
        Ok(mean_loss)
    }

    pub fn evaluate(&self, dataset: &PreferenceDataset) -> Result<Option<PreferenceEvaluation>> {
        if dataset.is_empty() {
            return Ok(None);
        }
        let logits = logit_matrix(&self.policy_logits)?;
        let mut total_loss = 0.;
        let mut correct = 0;
        for record in (0..dataset.len()).filter_map(|i| dataset.get(i)) {
            let margin = self.margin(logits.view(), &self.tokenize(&record));
            total_loss += negative_log_sigmoid(margin);
            if margin > 0. {
                correct += 1;
            }
        }
        Ok(Some(PreferenceEvaluation {
            mean_loss: total_loss / dataset.len() as f32,
            accuracy: correct as f32 / dataset.len() as f32,
        }))
    }

    pub fn train(
        &mut self,
        train_dataset: &PreferenceDataset,
        eval_dataset: &PreferenceDataset,
        epochs: usize,
        batch_size: usize,
    ) -> Result<DpoReport> {
        if train_dataset.is_empty() {
            return Err(PipelineError::EmptyDataset("no preference pairs to train on"));
        }
        let records = (0..train_dataset.len())
            .filter_map(|i| train_dataset.get(i))
            .collect::<Vec<_>>();
        let mut final_train_loss = 0.;
        for epoch in 0..epochs {
            for batch in records.chunks(batch_size.max(1)) {
                final_train_loss = self.train_batch(batch)?;
                if self.step_count % LOGGING_STEPS == 0 {
                    info!(
                        "epoch {}, step {}: loss = {:.4}",
                        epoch, self.step_count, final_train_loss
                    );
                }
            }
            if let Some(evaluation) = self.evaluate(eval_dataset)? {
                info!(
                    "epoch {} eval loss = {:.4}, accuracy = {:.2}",
                    epoch, evaluation.mean_loss, evaluation.accuracy
                );
            }
        }
        Ok(DpoReport {
            step_count: self.step_count,
            final_train_loss,
            evaluation: self.evaluate(eval_dataset)?,
        })
    }

    /// Writes `<identifier>.npz` into the directory at `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        serialize(self, &path.join(format!("{}.npz", self.identifier)))
    }
}

impl Parameterized for DirectPreferenceTrainer {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn parameters(&self) -> Vec<Rc<Parameter>> {
        vec![self.policy_logits.clone()]
    }
}

pub fn train_dpo(configuration: &PipelineConfiguration) -> Result<DpoReport> {
    let mut rng = StdRng::seed_from_u64(configuration.seed);

    let preferences = load_preferences(configuration)?;
    let dataset = prepare_dataset(preferences.records());
    let (train_dataset, eval_dataset) =
        dataset.train_test_split(configuration.eval_fraction, &mut rng);
    if train_dataset.is_empty() {
        return Err(PipelineError::EmptyDataset("no preference pairs to train on"));
    }
    info!(
        "{} training pairs, {} held out",
        train_dataset.len(),
        eval_dataset.len()
    );

    let policy = load_base_policy(configuration, &mut rng)?;
    let mut trainer = DirectPreferenceTrainer::new(
        &policy,
        policy.token_vocabulary().clone(),
        configuration.dpo_beta,
        configuration.dpo_learning_rate,
        configuration.dpo_max_length,
    )?;

    println!("Starting DPO Training...");
    let report = trainer.train(
        &train_dataset,
        &eval_dataset,
        configuration.dpo_epochs,
        configuration.batch_size,
    )?;
    println!("DPO Training finished!");

    trainer.save(&configuration.dpo_model_path())?;
    Ok(report)
}
