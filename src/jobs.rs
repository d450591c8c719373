use std::cell::Cell;
use std::fmt;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use chrono::{DateTime, Local};
use log::info;

use crate::error::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum JobKind {
    Dpo,
    Ppo,
}

impl JobKind {
    pub fn subcommand(self) -> &'static str {
        match self {
            JobKind::Dpo => "dpo",
            JobKind::Ppo => "ppo",
        }
    }
}

/// Receipt for a submitted job. There is no way to wait on, poll, or cancel
/// the job through it.
#[derive(Clone, Debug)]
pub struct JobHandle {
    pub id: u64,
    pub kind: JobKind,
    pub process_id: u32,
    pub submitted_at: DateTime<Local>,
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "job {} ({}) started as process {} at {}",
            self.id,
            self.kind.subcommand(),
            self.process_id,
            self.submitted_at.format("%Y-%m-%d %H:%M:%S")
        )
    }
}

pub trait JobSubmitter {
    fn submit(&self, kind: JobKind) -> Result<JobHandle>;
}

/// Launches `program <dpo|ppo> [--config <file>]` as an independent process
/// that inherits this one's stdout and stderr. Job ids count up per submitter.
pub struct ProcessJobSubmitter {
    program: PathBuf,
    configuration_path: Option<PathBuf>,
    submitted: Cell<u64>,
}

impl ProcessJobSubmitter {
    pub fn new(program: impl Into<PathBuf>, configuration_path: Option<PathBuf>) -> Self {
        Self {
            program: program.into(),
            configuration_path,
            submitted: Cell::new(0),
        }
    }

    pub fn for_current_executable(configuration_path: Option<PathBuf>) -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?, configuration_path))
    }
}

impl JobSubmitter for ProcessJobSubmitter {
    fn submit(&self, kind: JobKind) -> Result<JobHandle> {
        let mut command = Command::new(&self.program);
        command.arg(kind.subcommand()).stdin(Stdio::null());
        if let Some(path) = &self.configuration_path {
            command.arg("--config").arg(path);
        }
        let child = command.spawn()?;
        self.submitted.set(self.submitted.get() + 1);
        let handle = JobHandle {
            id: self.submitted.get(),
            kind,
            process_id: child.id(),
            submitted_at: Local::now(),
        };
        info!("{}", handle);
        Ok(handle)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_submission_returns_distinct_handles() {
        let submitter = ProcessJobSubmitter::new("true", None);
        let first = submitter.submit(JobKind::Dpo).expect("should spawn");
        let second = submitter.submit(JobKind::Ppo).expect("should spawn");
        assert_eq!((first.id, second.id), (1, 2));
        assert_eq!(first.kind, JobKind::Dpo);
        assert_eq!(second.kind, JobKind::Ppo);
        assert!(first.process_id > 0);
        assert!(first.to_string().contains("(dpo)"));
    }

    #[test]
    fn test_missing_program_fails_submission() {
        let submitter = ProcessJobSubmitter::new("/nonexistent/preference-loop", None);
        assert!(submitter.submit(JobKind::Ppo).is_err());
    }
}
