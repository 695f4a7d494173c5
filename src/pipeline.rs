use crate::fs::copy_directory;
use crate::git::{CommitIdentity, VersionControl};
use crate::gitlab::Project;
use derive_more::Display;
use log::{error, info};
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Step {
    #[display(fmt = "clone")]
    Clone,
    #[display(fmt = "copy")]
    Overlay,
    #[display(fmt = "add")]
    Stage,
    #[display(fmt = "commit")]
    Commit,
    #[display(fmt = "push")]
    Push,
}

#[derive(Debug)]
pub struct StepFailure {
    pub step: Step,
    pub message: String,
}

/// Outcome of running the pipeline for a single project
#[derive(Debug)]
pub struct PipelineReport {
    pub name: String,
    pub path: PathBuf,
    pub failures: Vec<StepFailure>,
}

impl PipelineReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Logs and keeps the error of a failed step
    fn record<T, E: fmt::Display>(&mut self, step: Step, result: Result<T, E>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                error!("Git {step} error: {err} {}", self.path.display());
                self.failures.push(StepFailure {
                    step,
                    message: err.to_string(),
                });
                None
            }
        }
    }
}

/// Clones a project, copies the template over it, commits and pushes.
pub struct Pipeline {
    repos_dir: PathBuf,
    template_dir: PathBuf,
    identity: CommitIdentity,
    vcs: Box<dyn VersionControl>,
}

impl Pipeline {
    pub fn new(
        repos_dir: impl Into<PathBuf>,
        template_dir: impl Into<PathBuf>,
        identity: CommitIdentity,
        vcs: impl VersionControl + 'static,
    ) -> Self {
        Self {
            repos_dir: repos_dir.into(),
            template_dir: template_dir.into(),
            identity,
            vcs: Box::new(vcs),
        }
    }

    /// Where the project is cloned to
    pub fn local_path(&self, project: &Project) -> PathBuf {
        self.repos_dir.join(&project.name)
    }

    pub fn template_dir(&self) -> &Path {
        &self.template_dir
    }

    /// Runs every step for `project` on a best effort basis: a failed
    /// step is logged and recorded in the report, and the remaining steps
    /// still run against whatever the earlier ones left behind. Nothing
    /// is retried or rolled back.
    pub fn run(&self, project: &Project) -> PipelineReport {
        let path = self.local_path(project);
        let mut report = PipelineReport {
            name: project.name.clone(),
            path: path.clone(),
            failures: Vec::new(),
        };

        info!("Clone: {}", project.name);
        report.record(
            Step::Clone,
            self.vcs.clone_repository(&project.ssh_url_to_repo, &path),
        );

        info!("Copy from template: {}", project.name);
        report.record(Step::Overlay, copy_directory(&self.template_dir, &path));

        report.record(Step::Stage, self.vcs.stage_all(&path));
        if let Some(oid) = report.record(Step::Commit, self.vcs.commit(&path, &self.identity)) {
            info!("Committed {oid} in {}", project.name);
        }
        report.record(Step::Push, self.vcs.push(&path));

        report
    }
}
