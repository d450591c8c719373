use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::{info, warn};

use crate::core::{GenerationParameters, Generator};
use crate::error::{PipelineError, Result};
use crate::preference::{PreferenceRecord, PreferenceStore};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnnotationState {
    AwaitingGeneration,
    AwaitingJudgment,
    Complete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    A,
    B,
    Tie,
}

impl FromStr for Verdict {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(Verdict::A),
            "B" => Ok(Verdict::B),
            "T" | "TIE" => Ok(Verdict::Tie),
            _ => Err(PipelineError::InvalidVerdict(s.trim().to_owned())),
        }
    }
}

/// Walks a fixed prompt list, two candidates per prompt, recording which one
/// the judge preferred. The store is rewritten to `store_path` after every
/// judgment.
pub struct AnnotationSession {
    prompt_list: Vec<String>,
    current_index: usize,
    pending_candidates: Option<(String, String)>,
    store: PreferenceStore,
    store_path: PathBuf,
    generation_parameters: GenerationParameters,
}

impl AnnotationSession {
    pub fn new(
        prompt_list: Vec<String>,
        store_path: impl Into<PathBuf>,
        generation_parameters: GenerationParameters,
    ) -> Self {
        Self {
            prompt_list,
            current_index: 0,
            pending_candidates: None,
            store: PreferenceStore::new(),
            store_path: store_path.into(),
            generation_parameters,
        }
    }

    pub fn state(&self) -> AnnotationState {
        if self.current_index >= self.prompt_list.len() {
            AnnotationState::Complete
        } else if self.pending_candidates.is_some() {
            AnnotationState::AwaitingJudgment
        } else {
            AnnotationState::AwaitingGeneration
        }
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn prompt_count(&self) -> usize {
        self.prompt_list.len()
    }

    pub fn current_prompt(&self) -> Option<&str> {
        self.prompt_list.get(self.current_index).map(String::as_str)
    }

    pub fn pending_candidates(&self) -> Option<&(String, String)> {
        self.pending_candidates.as_ref()
    }

    pub fn store(&self) -> &PreferenceStore {
        &self.store
    }

    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    /// Samples the two candidates for the current prompt. On failure nothing
    /// about the session changes, so the call can simply be repeated.
    pub fn advance(&mut self, generator: &mut dyn Generator) -> Result<&(String, String)> {
        let state = self.state();
        if state != AnnotationState::AwaitingGeneration {
            return Err(PipelineError::InvalidState(state));
        }
        let prompt = &self.prompt_list[self.current_index];
        let mut candidates = generator.generate(prompt, &self.generation_parameters, 2)?;
        if candidates.len() != 2 {
            return Err(PipelineError::GenerationFailure(format!(
                "expected 2 candidates, generator returned {}",
                candidates.len()
            )));
        }
        let b = candidates.pop().unwrap_or_default();
        let a = candidates.pop().unwrap_or_default();
        Ok(self.pending_candidates.insert((a, b)))
    }

    /// Records the verdict on the pending pair and moves to the next prompt.
    /// A tie records nothing but still advances. If the store cannot be
    /// written the judgment is undone.
    pub fn judge(&mut self, verdict: Verdict) -> Result<Option<&PreferenceRecord>> {
        let state = self.state();
        let Some((candidate_a, candidate_b)) = self.pending_candidates.take() else {
            return Err(PipelineError::InvalidState(state));
        };
        let prompt = self.prompt_list[self.current_index].clone();
        let record = match verdict {
            Verdict::A => Some(PreferenceRecord::new(
                prompt,
                candidate_a.clone(),
                candidate_b.clone(),
            )),
            Verdict::B => Some(PreferenceRecord::new(
                prompt,
                candidate_b.clone(),
                candidate_a.clone(),
            )),
            Verdict::Tie => None,
        };
        let recorded = record.is_some();
        if let Some(record) = record {
            self.store.push(record);
        }

        if let Err(error) = self.store.save(&self.store_path) {
            if recorded {
                self.store.pop();
            }
            self.pending_candidates = Some((candidate_a, candidate_b));
            return Err(error);
        }
        self.current_index += 1;
        info!(
            "judged {:?} on prompt {}/{}, {} preferences recorded",
            verdict,
            self.current_index,
            self.prompt_list.len(),
            self.store.len()
        );

        Ok(if recorded { self.store.records().last() } else { None })
    }
}

/// Runs a session against a line-oriented judge: for each prompt the two
/// candidates are shown and an A/B/T answer is read. Invalid answers are asked
/// again. End of input stops the loop and leaves the session where it was.
pub fn run_terminal_annotation<R: BufRead, W: Write>(
    session: &mut AnnotationSession,
    generator: &mut dyn Generator,
    mut input: R,
    mut output: W,
) -> Result<()> {
    writeln!(output, "\n=== RLHF Annotation ===")?;
    let mut line = String::new();
    while session.state() != AnnotationState::Complete {
        if session.state() == AnnotationState::AwaitingGeneration {
            writeln!(
                output,
                "\nPrompt [{}/{}]: {}",
                session.current_index() + 1,
                session.prompt_count(),
                session.current_prompt().unwrap_or_default()
            )?;
            writeln!(output, "Generating responses...")?;
            let (a, b) = session.advance(generator)?;
            writeln!(output, "\n[A]: {}", a)?;
            writeln!(output, "\n[B]: {}", b)?;
        }

        loop {
            write!(output, "\nWhich is better? (A/B/T for Tie): ")?;
            output.flush()?;
            line.clear();
            if input.read_line(&mut line)? == 0 {
                warn!(
                    "input ended at prompt {}/{}",
                    session.current_index() + 1,
                    session.prompt_count()
                );
                if session.current_index() == 0 {
                    writeln!(output, "\nStopped before any judgment; nothing saved.")?;
                } else {
                    writeln!(
                        output,
                        "\nStopped at prompt {}/{}. {} preferences saved to {}",
                        session.current_index() + 1,
                        session.prompt_count(),
                        session.store().len(),
                        session.store_path().display()
                    )?;
                }
                return Ok(());
            }
            match line.parse::<Verdict>() {
                Ok(verdict) => {
                    session.judge(verdict)?;
                    break;
                }
                Err(_) => writeln!(output, "Invalid choice. Please enter A, B, or T.")?,
            }
        }
    }
    writeln!(
        output,
        "\nAnnotation Complete! {} preferences saved to {}",
        session.store().len(),
        session.store_path().display()
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::Cursor;

    /// Hands out canned candidate pairs; an `Err` entry simulates an
    /// unavailable model.
    struct ScriptedGenerator {
        responses: VecDeque<Result<Vec<String>>>,
        calls: usize,
    }

    impl ScriptedGenerator {
        fn new(responses: Vec<Result<Vec<String>>>) -> Self {
            Self {
                responses: responses.into(),
                calls: 0,
            }
        }

        fn pairs(count: usize) -> Self {
            Self::new(
                (0..count)
                    .map(|i| Ok(vec![format!("first {}", i), format!("second {}", i)]))
                    .collect(),
            )
        }
    }

    impl Generator for ScriptedGenerator {
        fn generate(
            &mut self,
            _prompt: &str,
            _parameters: &GenerationParameters,
            count: usize,
        ) -> Result<Vec<String>> {
            assert_eq!(count, 2);
            self.calls += 1;
            self.responses
                .pop_front()
                .unwrap_or_else(|| Err(PipelineError::GenerationFailure("exhausted".to_owned())))
        }
    }

    fn prompts(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("prompt {}", i)).collect()
    }

    fn session(directory: &Path, count: usize) -> AnnotationSession {
        AnnotationSession::new(
            prompts(count),
            directory.join("preferences.json"),
            GenerationParameters::default(),
        )
    }

    #[test]
    fn test_a_keeps_order_and_b_swaps() {
        let directory = tempfile::tempdir().expect("tempdir");
        let mut session = session(directory.path(), 2);
        let mut generator = ScriptedGenerator::new(vec![
            Ok(vec!["cats".to_owned(), "dogs".to_owned()]),
            Ok(vec!["cats".to_owned(), "dogs".to_owned()]),
        ]);

        session.advance(&mut generator).expect("advance");
        let record = session.judge(Verdict::A).expect("judge").cloned();
        assert_eq!(record, Some(PreferenceRecord::new("prompt 0", "cats", "dogs")));

        session.advance(&mut generator).expect("advance");
        let record = session.judge(Verdict::B).expect("judge").cloned();
        assert_eq!(record, Some(PreferenceRecord::new("prompt 1", "dogs", "cats")));
        assert_eq!(session.state(), AnnotationState::Complete);
    }

    #[test]
    fn test_ties_are_discarded_but_advance() {
        let directory = tempfile::tempdir().expect("tempdir");
        let mut session = session(directory.path(), 5);
        let mut generator = ScriptedGenerator::pairs(5);
        let verdicts = [Verdict::A, Verdict::Tie, Verdict::B, Verdict::Tie, Verdict::A];
        for verdict in verdicts {
            session.advance(&mut generator).expect("advance");
            session.judge(verdict).expect("judge");
        }
        assert_eq!(session.state(), AnnotationState::Complete);
        assert_eq!(session.current_index(), 5);
        assert_eq!(session.store().len(), 5 - 2);

        let persisted = PreferenceStore::load(session.store_path()).expect("load");
        assert_eq!(&persisted, session.store());
    }

    #[test]
    fn test_tie_still_persists_the_store() {
        let directory = tempfile::tempdir().expect("tempdir");
        let mut session = session(directory.path(), 1);
        let mut generator = ScriptedGenerator::pairs(1);
        session.advance(&mut generator).expect("advance");
        assert_eq!(session.judge(Verdict::Tie).expect("judge"), None);
        assert!(PreferenceStore::load(session.store_path())
            .expect("load")
            .is_empty());
    }

    #[test]
    fn test_generation_failure_leaves_session_resumable() {
        let directory = tempfile::tempdir().expect("tempdir");
        let mut session = session(directory.path(), 2);
        let mut generator = ScriptedGenerator::new(vec![
            Ok(vec!["x".to_owned(), "y".to_owned()]),
            Err(PipelineError::GenerationFailure("model unavailable".to_owned())),
            Ok(vec!["only one".to_owned()]),
            Ok(vec!["u".to_owned(), "v".to_owned()]),
        ]);
        session.advance(&mut generator).expect("advance");
        session.judge(Verdict::A).expect("judge");

        assert!(matches!(
            session.advance(&mut generator),
            Err(PipelineError::GenerationFailure(_))
        ));
        assert!(matches!(
            session.advance(&mut generator),
            Err(PipelineError::GenerationFailure(_))
        ));
        assert_eq!(session.current_index(), 1);
        assert_eq!(session.state(), AnnotationState::AwaitingGeneration);
        assert_eq!(session.store().len(), 1);

        session.advance(&mut generator).expect("retry");
        session.judge(Verdict::B).expect("judge");
        assert_eq!(
            session.store().records()[1],
            PreferenceRecord::new("prompt 1", "v", "u")
        );
    }

    #[test]
    fn test_empty_candidates_are_recorded_verbatim() {
        let directory = tempfile::tempdir().expect("tempdir");
        let mut session = session(directory.path(), 1);
        let mut generator =
            ScriptedGenerator::new(vec![Ok(vec![String::new(), "something".to_owned()])]);
        session.advance(&mut generator).expect("advance");
        let record = session.judge(Verdict::B).expect("judge").cloned();
        assert_eq!(record, Some(PreferenceRecord::new("prompt 0", "something", "")));
    }

    #[test]
    fn test_operations_out_of_order_are_rejected() {
        let directory = tempfile::tempdir().expect("tempdir");
        let mut session = session(directory.path(), 1);
        let mut generator = ScriptedGenerator::pairs(2);

        assert!(matches!(
            session.judge(Verdict::A),
            Err(PipelineError::InvalidState(AnnotationState::AwaitingGeneration))
        ));
        session.advance(&mut generator).expect("advance");
        assert!(matches!(
            session.advance(&mut generator),
            Err(PipelineError::InvalidState(AnnotationState::AwaitingJudgment))
        ));
        session.judge(Verdict::A).expect("judge");
        assert!(matches!(
            session.advance(&mut generator),
            Err(PipelineError::InvalidState(AnnotationState::Complete))
        ));
        assert_eq!(generator.calls, 1);
    }

    #[test]
    fn test_failed_save_rolls_back_the_judgment() {
        let directory = tempfile::tempdir().expect("tempdir");
        // the store path is a directory, so the final rename fails
        let blocked = directory.path().join("blocked");
        std::fs::create_dir_all(blocked.join("occupied")).expect("mkdir");
        let mut session =
            AnnotationSession::new(prompts(1), &blocked, GenerationParameters::default());
        let mut generator = ScriptedGenerator::pairs(1);

        session.advance(&mut generator).expect("advance");
        assert!(session.judge(Verdict::A).is_err());
        assert_eq!(session.current_index(), 0);
        assert!(session.store().is_empty());
        assert_eq!(session.state(), AnnotationState::AwaitingJudgment);
        assert!(!directory.path().join("blocked.tmp").exists());
    }

    #[test]
    fn test_verdict_parsing() {
        assert_eq!(" a\n".parse::<Verdict>().expect("parse"), Verdict::A);
        assert_eq!("B".parse::<Verdict>().expect("parse"), Verdict::B);
        assert_eq!("t".parse::<Verdict>().expect("parse"), Verdict::Tie);
        assert_eq!("tie".parse::<Verdict>().expect("parse"), Verdict::Tie);
        assert!(matches!(
            "maybe".parse::<Verdict>(),
            Err(PipelineError::InvalidVerdict(_))
        ));
    }

    #[test]
    fn test_terminal_session_with_scripted_judge() {
        let directory = tempfile::tempdir().expect("tempdir");
        let mut session = session(directory.path(), 3);
        let mut generator = ScriptedGenerator::pairs(3);
        let input = Cursor::new("A\nnope\nT\nb\n");
        let mut output = Vec::new();

        run_terminal_annotation(&mut session, &mut generator, input, &mut output)
            .expect("should run");

        let transcript = String::from_utf8(output).expect("utf-8");
        assert!(transcript.contains("Prompt [3/3]: prompt 2"));
        assert!(transcript.contains("Invalid choice."));
        assert!(transcript.contains("Annotation Complete!"));
        assert_eq!(
            session.store().records(),
            &[
                PreferenceRecord::new("prompt 0", "first 0", "second 0"),
                PreferenceRecord::new("prompt 2", "second 2", "first 2"),
            ]
        );
    }

    #[test]
    fn test_terminal_session_stops_at_end_of_input() {
        let directory = tempfile::tempdir().expect("tempdir");
        let mut session = session(directory.path(), 3);
        let mut generator = ScriptedGenerator::pairs(3);

        let mut output = Vec::new();
        run_terminal_annotation(&mut session, &mut generator, Cursor::new("A\n"), &mut output)
            .expect("should run");

        assert_eq!(session.current_index(), 1);
        assert_eq!(session.state(), AnnotationState::AwaitingJudgment);
        let transcript = String::from_utf8(output).expect("utf-8");
        assert!(transcript.contains("Stopped at prompt 2/3. 1 preferences saved to"));
        assert!(!transcript.contains("Annotation Complete!"));
    }

    #[test]
    fn test_terminal_session_without_judgments_reports_nothing_saved() {
        let directory = tempfile::tempdir().expect("tempdir");
        let mut session = session(directory.path(), 2);
        let mut generator = ScriptedGenerator::pairs(2);
        let mut output = Vec::new();

        run_terminal_annotation(&mut session, &mut generator, Cursor::new(""), &mut output)
            .expect("should run");

        let transcript = String::from_utf8(output).expect("utf-8");
        assert!(transcript.contains("nothing saved"));
        assert!(!transcript.contains("preferences saved"));
        assert!(!session.store_path().exists());
    }
}
