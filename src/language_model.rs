use std::path::Path;
use std::rc::Rc;
use std::time;

use log::{debug, info};
use ndarray::prelude::*;
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand_distr::weighted_alias::WeightedAliasIndex;
use rand_distr::Distribution;

use crate::core::serialization::deserialize;
use crate::core::vocabulary::{TokenVocabulary, BOUNDARY_TOKEN_ID};
use crate::core::{GenerationParameters, Generator, Parameter, Parameterized};
use crate::error::{PipelineError, Result};

/// Character-level policy: one row of next-token logits per preceding token.
pub struct BigramLanguageModel {
    identifier: String,
    token_vocabulary: TokenVocabulary,
    transition_logits: Rc<Parameter>,
    rng: StdRng,
}

impl BigramLanguageModel {
    pub fn new(identifier: &str, token_vocabulary: TokenVocabulary, mut rng: StdRng) -> Self {
        let size = token_vocabulary.size();
        let logits = Array::random_using((size, size), StandardNormal, &mut rng)
            .mapv(|x: f32| 0.01 * x);
        Self::from_logits(identifier, token_vocabulary, logits, rng)
    }

    pub fn from_logits(
        identifier: &str,
        token_vocabulary: TokenVocabulary,
        logits: Array2<f32>,
        rng: StdRng,
    ) -> Self {
        assert_eq!(
            logits.shape(),
            &[token_vocabulary.size(), token_vocabulary.size()],
            "logit table should be square over the vocabulary"
        );
        Self {
            transition_logits: Parameter::new(
                &format!("{}_transition_logits", identifier),
                logits.into_dyn(),
            ),
            identifier: identifier.to_owned(),
            token_vocabulary,
            rng,
        }
    }

    /// Loads weights written by `serialize`. The identifier must match the one
    /// the weights were saved under.
    pub fn load(
        identifier: &str,
        token_vocabulary: TokenVocabulary,
        path: &Path,
        rng: StdRng,
    ) -> Result<Self> {
        if !path.exists() {
            return Err(PipelineError::not_found("base policy", path));
        }
        let size = token_vocabulary.size();
        let model =
            Self::from_logits(identifier, token_vocabulary, Array2::zeros((size, size)), rng);
        deserialize(&model, path)?;
        info!("loaded {} ({} parameters)", identifier, model.parameter_count());
        Ok(model)
    }

    pub fn token_vocabulary(&self) -> &TokenVocabulary {
        &self.token_vocabulary
    }

    pub fn transition_logits(&self) -> Rc<Parameter> {
        self.transition_logits.clone()
    }

    /// The token the first generated character is conditioned on.
    pub fn context_token(&self, prompt: &str) -> usize {
        context_token(&self.token_vocabulary.tokenize(prompt))
    }

    fn continue_from(
        &mut self,
        context: usize,
        parameters: &GenerationParameters,
    ) -> Result<Vec<usize>> {
        let logits = self.transition_logits.borrow_array();
        let logit_matrix = logits.view().into_dimensionality::<Ix2>().map_err(|error| {
            PipelineError::GenerationFailure(format!("malformed logit table: {}", error))
        })?;
        let mut previous = context;
        let mut continuation = Vec::new();
        for _ in 0..parameters.max_new_tokens {
            let next = sample_next_token(logit_matrix.row(previous), parameters, &mut self.rng)?;
            if next == BOUNDARY_TOKEN_ID {
                break;
            }
            continuation.push(next);
            previous = next;
        }
        Ok(continuation)
    }
}

impl Parameterized for BigramLanguageModel {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn parameters(&self) -> Vec<Rc<Parameter>> {
        vec![self.transition_logits.clone()]
    }
}

impl Generator for BigramLanguageModel {
    fn generate(
        &mut self,
        prompt: &str,
        parameters: &GenerationParameters,
        count: usize,
    ) -> Result<Vec<String>> {
        let context = self.context_token(prompt);
        let mut continuations = Vec::with_capacity(count);
        for _ in 0..count {
            let ids = self.continue_from(context, parameters)?;
            continuations.push(self.token_vocabulary.detokenize(&ids).trim().to_owned());
        }
        debug!("generated {} continuations for {:?}", count, prompt);
        Ok(continuations)
    }
}

pub fn context_token(prompt_ids: &[usize]) -> usize {
    prompt_ids.last().copied().unwrap_or(BOUNDARY_TOKEN_ID)
}

pub fn softmax(x: ArrayView1<f32>) -> Array1<f32> {
    let maximum = x.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let exp_x = x.mapv(|x_i| (x_i - maximum).exp());
    let scale = exp_x.sum();
    exp_x / scale
}

pub fn log_softmax(x: ArrayView1<f32>) -> Array1<f32> {
    let maximum = x.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let log_normalizer = maximum + x.mapv(|x_i| (x_i - maximum).exp()).sum().ln();
    x.mapv(|x_i| x_i - log_normalizer)
}

pub fn sample_next_token(
    logits: ArrayView1<f32>,
    parameters: &GenerationParameters,
    rng: &mut StdRng,
) -> Result<usize> {
    if !parameters.sample {
        let mut best = 0;
        for (i, logit) in logits.iter().enumerate() {
            if *logit > logits[best] {
                best = i;
            }
        }
        return Ok(best);
    }
    if !parameters.temperature.is_finite() || parameters.temperature <= 0. {
        return Err(PipelineError::GenerationFailure(format!(
            "temperature must be positive, got {}",
            parameters.temperature
        )));
    }
    if !(parameters.top_p > 0. && parameters.top_p <= 1.) {
        return Err(PipelineError::GenerationFailure(format!(
            "top_p must be in (0, 1], got {}",
            parameters.top_p
        )));
    }
    let probabilities = softmax((&logits / parameters.temperature).view());

    // nucleus: the smallest set of most-probable tokens whose mass reaches top_p
    let mut ranked = (0..probabilities.len()).collect::<Vec<_>>();
    ranked.sort_by(|&a, &b| probabilities[b].total_cmp(&probabilities[a]));
    let mut weights = vec![0.0; probabilities.len()];
    let mut cumulative = 0.0;
    for i in ranked {
        weights[i] = probabilities[i];
        cumulative += probabilities[i];
        if cumulative >= parameters.top_p {
            break;
        }
    }

    let next_token_distribution = WeightedAliasIndex::new(weights)
        .map_err(|error| PipelineError::GenerationFailure(error.to_string()))?;
    Ok(next_token_distribution.sample(rng))
}

pub fn sequence_log_probability(
    logits: ArrayView2<f32>,
    context: usize,
    continuation: &[usize],
) -> f32 {
    let mut previous = context;
    let mut total = 0.;
    for &token in continuation {
        total += log_softmax(logits.row(previous))[token];
        previous = token;
    }
    total
}

/// Adds `scale` times the gradient of `sequence_log_probability` with respect
/// to the logit table into `gradient`.
pub fn accumulate_log_probability_gradient(
    logits: ArrayView2<f32>,
    context: usize,
    continuation: &[usize],
    scale: f32,
    gradient: &mut Array2<f32>,
) {
    let mut previous = context;
    for &token in continuation {
        let probabilities = softmax(logits.row(previous));
        let mut row = gradient.row_mut(previous);
        row.scaled_add(-scale, &probabilities);
        row[token] += scale;
        previous = token;
    }
}

/// Maximum-likelihood fitting of the logit table on a plain-text corpus, one
/// gradient-ascent step per window. Returns the mean per-token negative
/// log-likelihood of the final epoch.
pub fn pretrain(
    network: &BigramLanguageModel,
    corpus: &str,
    epochs: usize,
    context_window_size: usize,
    learning_rate: f32,
) -> Result<f32> {
    let mut training_tokenstream = vec![BOUNDARY_TOKEN_ID];
    training_tokenstream.extend(network.token_vocabulary.tokenize(corpus));
    training_tokenstream.push(BOUNDARY_TOKEN_ID);
    if training_tokenstream.len() < 2 {
        return Err(PipelineError::EmptyDataset("corpus has no tokens"));
    }

    let start_time = time::Instant::now();
    let mut last_status_update = time::Instant::now();
    let mut mean_loss = 0.;
    let size = network.token_vocabulary.size();

    for epoch in 0..epochs {
        let mut total_loss = 0.;
        let mut token_count = 0;
        // windows overlap by one token so every transition is seen
        let stride = context_window_size.max(1);
        let mut start = 0;
        while start + 1 < training_tokenstream.len() {
            let end = (start + stride + 1).min(training_tokenstream.len());
            let context = training_tokenstream[start];
            let targets = &training_tokenstream[start + 1..end];

            let mut gradient = Array2::zeros((size, size));
            {
                let logits = network.transition_logits.borrow_array();
                let logit_matrix = logits.view().into_dimensionality::<Ix2>().map_err(|error| {
                    PipelineError::OptimizerFailure(format!("malformed logit table: {}", error))
                })?;
                total_loss -= sequence_log_probability(logit_matrix.view(), context, targets);
                accumulate_log_probability_gradient(
                    logit_matrix,
                    context,
                    targets,
                    1. / targets.len() as f32,
                    &mut gradient,
                );
            }
            token_count += targets.len();
            network
                .transition_logits
                .borrow_array_mut()
                .scaled_add(learning_rate, &gradient);

            if last_status_update.elapsed() > time::Duration::from_secs(10) {
                info!(
                    "after {}s, epoch {}, loss: {}",
                    start_time.elapsed().as_secs(),
                    epoch,
                    total_loss / token_count as f32
                );
                last_status_update = time::Instant::now();
            }
            start = end - 1;
        }
        mean_loss = total_loss / token_count as f32;
        info!("epoch {} mean loss: {:.4}", epoch, mean_loss);
    }
    Ok(mean_loss)
}
