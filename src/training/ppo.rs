use log::{debug, info};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::{load_base_policy, load_preferences};
use crate::configuration::PipelineConfiguration;
use crate::core::optimization::PolicyGradientOptimizer;
use crate::core::reward::{load_reward_model, RewardModelSource};
use crate::core::vocabulary::TokenVocabulary;
use crate::core::{GenerationParameters, Generator, Optimizer, Scorer};
use crate::error::{PipelineError, Result};

const LOG_EVERY_STEPS: usize = 10;

/// Rewards in step order. Kept in memory only.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RewardTrace {
    rewards: Vec<f32>,
}

impl RewardTrace {
    pub fn push(&mut self, reward: f32) {
        self.rewards.push(reward);
    }

    pub fn rewards(&self) -> &[f32] {
        &self.rewards
    }

    pub fn len(&self) -> usize {
        self.rewards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rewards.is_empty()
    }

    pub fn mean(&self) -> Option<f32> {
        if self.rewards.is_empty() {
            None
        } else {
            Some(self.rewards.iter().sum::<f32>() / self.rewards.len() as f32)
        }
    }
}

pub struct RewardLoop {
    steps: usize,
    generation_parameters: GenerationParameters,
    reward_max_length: usize,
}

impl RewardLoop {
    pub fn new(
        steps: usize,
        generation_parameters: GenerationParameters,
        reward_max_length: usize,
    ) -> Self {
        Self {
            steps,
            generation_parameters,
            reward_max_length,
        }
    }

    pub fn from_configuration(configuration: &PipelineConfiguration) -> Self {
        Self::new(
            configuration.ppo_steps,
            GenerationParameters {
                max_new_tokens: configuration.max_new_tokens,
                sample: true,
                temperature: 1.0,
                top_p: 1.0,
            },
            configuration.reward_max_length,
        )
    }

    /// Sample a prompt, generate, score `prompt + " " + response`, step the
    /// optimizer; `steps` times. The first failure ends the run.
    pub fn run(
        &self,
        prompts: &[String],
        token_vocabulary: &TokenVocabulary,
        generator: &mut dyn Generator,
        scorer: &dyn Scorer,
        optimizer: &mut dyn Optimizer,
        rng: &mut StdRng,
    ) -> Result<RewardTrace> {
        let mut trace = RewardTrace::default();
        for step in 0..self.steps {
            let prompt = prompts
                .choose(rng)
                .ok_or(PipelineError::EmptyDataset("no training prompts"))?;

            let response = generator
                .generate(prompt, &self.generation_parameters, 1)?
                .pop()
                .ok_or_else(|| {
                    PipelineError::GenerationFailure("generator returned no response".to_owned())
                })?;

            let combined = format!("{} {}", prompt, response);
            let reward = scorer.score(&combined, self.reward_max_length)?;

            let statistics = optimizer.step(
                &token_vocabulary.tokenize(prompt),
                &token_vocabulary.tokenize(&response),
                reward,
            )?;
            debug!("step {} statistics: {:?}", step, statistics);

            trace.push(reward);
            if step % LOG_EVERY_STEPS == 0 {
                info!("Step {}: Reward = {:.4}", step, reward);
            }
        }
        Ok(trace)
    }
}

#[derive(Debug)]
pub struct PpoOutcome {
    pub trace: RewardTrace,
    pub reward_model_source: RewardModelSource,
}

pub fn train_ppo(configuration: &PipelineConfiguration) -> Result<PpoOutcome> {
    let mut rng = StdRng::seed_from_u64(configuration.seed);

    let preferences = load_preferences(configuration)?;
    let training_prompts = preferences.prompts();
    if training_prompts.is_empty() {
        return Err(PipelineError::EmptyDataset(
            "the preference file has no records to draw prompts from",
        ));
    }

    let mut policy = load_base_policy(configuration, &mut rng)?;
    let token_vocabulary = policy.token_vocabulary().clone();
    let (reward_model, reward_model_source) =
        load_reward_model(token_vocabulary.clone(), &configuration.reward_model_path())?;
    let mut optimizer = PolicyGradientOptimizer::new(
        &policy,
        configuration.learning_rate,
        configuration.kl_penalty,
    )?;

    println!("Starting PPO Training Loop...");
    let trace = RewardLoop::from_configuration(configuration).run(
        &training_prompts,
        &token_vocabulary,
        &mut policy,
        &reward_model,
        &mut optimizer,
        &mut rng,
    )?;
    println!("PPO Training finished!");
    if let Some(mean) = trace.mean() {
        info!("mean reward over {} steps: {:.4}", trace.len(), mean);
    }

    optimizer.save(&configuration.ppo_model_path())?;
    Ok(PpoOutcome {
        trace,
        reward_model_source,
    })
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::path::Path;

    use super::*;
    use crate::core::StepStatistics;
    use crate::training::fixtures;

    struct EchoGenerator {
        prompts_seen: Vec<String>,
        fail_on_call: Option<usize>,
    }

    impl Generator for EchoGenerator {
        fn generate(
            &mut self,
            prompt: &str,
            parameters: &GenerationParameters,
            count: usize,
        ) -> Result<Vec<String>> {
            assert_eq!(count, 1);
            assert_eq!(parameters.max_new_tokens, 50);
            self.prompts_seen.push(prompt.to_owned());
            if Some(self.prompts_seen.len()) == self.fail_on_call {
                return Err(PipelineError::GenerationFailure("out of memory".to_owned()));
            }
            Ok(vec!["ok".to_owned()])
        }
    }

    /// Reward is the length of the scored text.
    struct LengthScorer {
        seen: RefCell<Vec<(String, usize)>>,
    }

    impl Scorer for LengthScorer {
        fn score(&self, text: &str, max_length: usize) -> Result<f32> {
            self.seen.borrow_mut().push((text.to_owned(), max_length));
            Ok(text.len() as f32)
        }
    }

    #[derive(Default)]
    struct RecordingOptimizer {
        steps: Vec<(Vec<usize>, Vec<usize>, f32)>,
    }

    impl Optimizer for RecordingOptimizer {
        fn step(
            &mut self,
            prompt_ids: &[usize],
            response_ids: &[usize],
            reward: f32,
        ) -> Result<StepStatistics> {
            self.steps
                .push((prompt_ids.to_vec(), response_ids.to_vec(), reward));
            Ok(StepStatistics {
                reward,
                ..StepStatistics::default()
            })
        }

        fn step_count(&self) -> usize {
            self.steps.len()
        }

        fn save(&self, _path: &Path) -> Result<()> {
            Ok(())
        }
    }

    fn reward_loop(steps: usize) -> RewardLoop {
        RewardLoop::new(
            steps,
            GenerationParameters {
                max_new_tokens: 50,
                ..GenerationParameters::default()
            },
            256,
        )
    }

    #[test]
    fn test_each_step_generates_scores_and_steps_once() {
        let prompts = vec!["hi".to_owned(), "hi".to_owned(), "yo".to_owned()];
        let vocabulary = TokenVocabulary::default();
        let mut generator = EchoGenerator {
            prompts_seen: Vec::new(),
            fail_on_call: None,
        };
        let scorer = LengthScorer {
            seen: RefCell::new(Vec::new()),
        };
        let mut optimizer = RecordingOptimizer::default();

        let trace = reward_loop(25)
            .run(
                &prompts,
                &vocabulary,
                &mut generator,
                &scorer,
                &mut optimizer,
                &mut StdRng::seed_from_u64(42),
            )
            .expect("should run");

        assert_eq!(trace.len(), 25);
        assert_eq!(optimizer.steps.len(), 25);
        assert!(trace.rewards().iter().all(|&reward| reward == 5.0));
        for (text, max_length) in scorer.seen.borrow().iter() {
            assert!(text == "hi ok" || text == "yo ok");
            assert_eq!(*max_length, 256);
        }
        let (prompt_ids, response_ids, _) = &optimizer.steps[0];
        assert_eq!(vocabulary.detokenize(response_ids), "ok");
        assert!(["hi", "yo"].contains(&vocabulary.detokenize(prompt_ids).as_str()));
    }

    #[test]
    fn test_prompts_are_sampled_with_replacement() {
        let prompts = vec!["a".to_owned(), "b".to_owned()];
        let mut generator = EchoGenerator {
            prompts_seen: Vec::new(),
            fail_on_call: None,
        };
        reward_loop(40)
            .run(
                &prompts,
                &TokenVocabulary::default(),
                &mut generator,
                &LengthScorer {
                    seen: RefCell::new(Vec::new()),
                },
                &mut RecordingOptimizer::default(),
                &mut StdRng::seed_from_u64(3),
            )
            .expect("should run");
        let a_count = generator.prompts_seen.iter().filter(|p| *p == "a").count();
        assert!(a_count > 0 && a_count < 40);
    }

    #[test]
    fn test_generation_failure_aborts_remaining_steps() {
        let prompts = vec!["hi".to_owned()];
        let mut generator = EchoGenerator {
            prompts_seen: Vec::new(),
            fail_on_call: Some(4),
        };
        let mut optimizer = RecordingOptimizer::default();
        let result = reward_loop(10).run(
            &prompts,
            &TokenVocabulary::default(),
            &mut generator,
            &LengthScorer {
                seen: RefCell::new(Vec::new()),
            },
            &mut optimizer,
            &mut StdRng::seed_from_u64(42),
        );
        assert!(matches!(result, Err(PipelineError::GenerationFailure(_))));
        assert_eq!(generator.prompts_seen.len(), 4);
        assert_eq!(optimizer.steps.len(), 3);
    }

    #[test]
    fn test_empty_prompt_set_is_rejected() {
        let result = reward_loop(1).run(
            &[],
            &TokenVocabulary::default(),
            &mut EchoGenerator {
                prompts_seen: Vec::new(),
                fail_on_call: None,
            },
            &LengthScorer {
                seen: RefCell::new(Vec::new()),
            },
            &mut RecordingOptimizer::default(),
            &mut StdRng::seed_from_u64(42),
        );
        assert!(matches!(result, Err(PipelineError::EmptyDataset(_))));
    }

    #[test]
    fn test_train_ppo_without_annotations_creates_no_output() {
        let directory = tempfile::tempdir().expect("tempdir");
        let configuration = fixtures::with_base_policy(directory.path());
        let error = train_ppo(&configuration).expect_err("should fail");
        assert!(error.is_not_found());
        assert!(!configuration.output_dir.exists());
    }

    #[test]
    fn test_train_ppo_falls_back_to_default_scorer() {
        let directory = tempfile::tempdir().expect("tempdir");
        let configuration = fixtures::with_base_policy(directory.path());
        fixtures::write_preferences(&configuration, 3);
        assert!(!configuration.reward_model_path().exists());

        let (outcome, records) = fixtures::capture_logs(|| train_ppo(&configuration));
        let outcome = outcome.expect("should train");
        let reward_model_path = configuration.reward_model_path().display().to_string();
        let fallback_warnings = records
            .iter()
            .filter(|(level, message)| {
                *level == log::Level::Warn && message.contains(&reward_model_path)
            })
            .count();
        assert_eq!(fallback_warnings, 1);
        assert_eq!(
            outcome.reward_model_source,
            RewardModelSource::DefaultPretrained
        );
        assert_eq!(outcome.trace.len(), configuration.ppo_steps);
        assert!(configuration
            .ppo_model_path()
            .join(format!("{}.npz", configuration.model_name))
            .exists());
    }
}
