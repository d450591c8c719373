#![allow(mixed_script_confusables)]

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use log::error;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::annotation::{run_terminal_annotation, AnnotationSession};
use crate::configuration::PipelineConfiguration;
use crate::core::vocabulary::TokenVocabulary;
use crate::core::{GenerationParameters, Parameterized};
use crate::error::Result;
use crate::jobs::{JobKind, JobSubmitter, ProcessJobSubmitter};
use crate::language_model::BigramLanguageModel;

mod annotation;
mod chat;
mod configuration;
mod core;
mod error;
mod jobs;
mod language_model;
mod preference;
mod training;

/// Collect pairwise preferences on a small policy and fine-tune it with DPO or
/// a reward-driven policy-gradient loop.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// JSON file overriding the default configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fit the base policy on the training corpus
    Pretrain,
    /// Judge pairs of base-policy responses and record preferences
    Annotate,
    /// Fine-tune the base policy on recorded preferences
    Dpo,
    /// Fine-tune the base policy against the reward model
    Ppo,
    /// Talk to a policy
    Chat {
        /// weights file to load instead of the base policy
        #[arg(long)]
        weights: Option<PathBuf>,
    },
    /// Start a training run in a separate process and return immediately
    Submit {
        #[arg(value_enum)]
        kind: JobKind,
    },
}

fn annotate(configuration: &PipelineConfiguration) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(configuration.seed);
    let mut policy = training::load_base_policy(configuration, &mut rng)?;
    println!("parameter count: {}", policy.parameter_count());
    let mut session = AnnotationSession::new(
        configuration.annotation_prompts.clone(),
        configuration.preference_path(),
        GenerationParameters {
            max_new_tokens: configuration.annotation_max_new_tokens,
            sample: true,
            temperature: configuration.temperature,
            top_p: configuration.top_p,
        },
    );
    let stdin = io::stdin();
    run_terminal_annotation(&mut session, &mut policy, stdin.lock(), io::stdout())
}

fn chat(configuration: &PipelineConfiguration, weights: Option<PathBuf>) -> Result<()> {
    let path = weights.unwrap_or_else(|| configuration.base_policy_path());
    println!("loading weights from {:?}", path);
    let mut policy = BigramLanguageModel::load(
        &configuration.model_name,
        TokenVocabulary::default(),
        &path,
        StdRng::seed_from_u64(configuration.seed),
    )?;
    let stdin = io::stdin();
    chat::run_chat(
        &mut policy,
        &chat::chat_generation_parameters(),
        stdin.lock(),
        io::stdout(),
    )?;
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let configuration = PipelineConfiguration::load(cli.config.as_deref())?;
    match cli.command {
        Command::Pretrain => {
            let loss = training::pretrain_base_policy(&configuration)?;
            println!("final loss: {:.4}", loss);
        }
        Command::Annotate => annotate(&configuration)?,
        Command::Dpo => {
            let report = training::dpo::train_dpo(&configuration)?;
            println!(
                "DPO finished after {} steps, final loss {:.4}",
                report.step_count, report.final_train_loss
            );
            if let Some(evaluation) = report.evaluation {
                println!(
                    "eval loss {:.4}, preference accuracy {:.2}",
                    evaluation.mean_loss, evaluation.accuracy
                );
            }
        }
        Command::Ppo => {
            training::ppo::train_ppo(&configuration)?;
        }
        Command::Chat { weights } => chat(&configuration, weights)?,
        Command::Submit { kind } => {
            let handle = ProcessJobSubmitter::for_current_executable(cli.config)?.submit(kind)?;
            println!("{}", handle);
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!("{}", error);
            eprintln!("error: {}", error);
            ExitCode::FAILURE
        }
    }
}
