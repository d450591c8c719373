use std::path::Path;
use std::rc::Rc;

use ndarray::prelude::*;

use super::serialization::serialize;
use super::{Optimizer, Parameter, Parameterized, StepStatistics};
use crate::error::{PipelineError, Result};
use crate::language_model::{
    accumulate_log_probability_gradient, context_token, sequence_log_probability,
};

pub fn logit_matrix(parameter: &Parameter) -> Result<Array2<f32>> {
    parameter
        .borrow_array()
        .clone()
        .into_dimensionality::<Ix2>()
        .map_err(|error| {
            PipelineError::OptimizerFailure(format!(
                "{} is not a logit table: {}",
                parameter.identifier(),
                error
            ))
        })
}

/// Reward-weighted likelihood ascent on a bigram policy. The reward is shaped
/// by a penalty on the sampled log-ratio against a frozen copy of the policy
/// taken at construction.
pub struct PolicyGradientOptimizer {
    identifier: String,
    policy_logits: Rc<Parameter>,
    reference_logits: Array2<f32>,
    learning_rate: f32,
    kl_penalty: f32,
    step_count: usize,
}

impl PolicyGradientOptimizer {
    pub fn new(policy: &dyn Parameterized, learning_rate: f32, kl_penalty: f32) -> Result<Self> {
        let policy_logits = policy.parameters().into_iter().next().ok_or_else(|| {
            PipelineError::OptimizerFailure(format!("{} has no parameters", policy.identifier()))
        })?;
        let reference_logits = logit_matrix(&policy_logits)?;
        Ok(Self {
            identifier: policy.identifier().to_owned(),
            policy_logits,
            reference_logits,
            learning_rate,
            kl_penalty,
            step_count: 0,
        })
    }

    fn check_ids(&self, ids: &[usize]) -> Result<()> {
        let size = self.reference_logits.nrows();
        match ids.iter().find(|&&id| id >= size) {
            Some(id) => Err(PipelineError::OptimizerFailure(format!(
                "token id {} outside vocabulary of {}",
                id, size
            ))),
            None => Ok(()),
        }
    }
}

impl Parameterized for PolicyGradientOptimizer {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn parameters(&self) -> Vec<Rc<Parameter>> {
        vec![self.policy_logits.clone()]
    }
}

impl Optimizer for PolicyGradientOptimizer {
    fn step(
        &mut self,
        prompt_ids: &[usize],
        response_ids: &[usize],
        reward: f32,
    ) -> Result<StepStatistics> {
        self.check_ids(prompt_ids)?;
        self.check_ids(response_ids)?;
        if !reward.is_finite() {
            return Err(PipelineError::OptimizerFailure(format!(
                "non-finite reward {}",
                reward
            )));
        }
        let context = context_token(prompt_ids);
        let logits = logit_matrix(&self.policy_logits)?;

        let log_probability = sequence_log_probability(logits.view(), context, response_ids);
        let reference_log_probability =
            sequence_log_probability(self.reference_logits.view(), context, response_ids);
        let kl_divergence = log_probability - reference_log_probability;
        let shaped_reward = reward - self.kl_penalty * kl_divergence;

        let mut gradient = Array2::zeros(logits.raw_dim());
        if !response_ids.is_empty() {
            accumulate_log_probability_gradient(
                logits.view(),
                context,
                response_ids,
                shaped_reward / response_ids.len() as f32,
                &mut gradient,
            );
        }
        let update_norm = self.learning_rate * gradient.mapv(|g| g * g).sum().sqrt();
        if !update_norm.is_finite() {
            return Err(PipelineError::OptimizerFailure(
                "update diverged to a non-finite value".to_owned(),
            ));
        }
        self.policy_logits
            .borrow_array_mut()
            .scaled_add(self.learning_rate, &gradient);
        self.step_count += 1;

        Ok(StepStatistics {
            reward,
            kl_divergence,
            log_probability,
            update_norm,
        })
    }

    fn step_count(&self) -> usize {
        self.step_count
    }

    /// Writes `<identifier>.npz` into the directory at `path`.
    fn save(&self, path: &Path) -> Result<()> {
        serialize(self, &path.join(format!("{}.npz", self.identifier)))
    }
}
