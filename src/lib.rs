use crate::fanout::{FanOut, FanOutConfig};
use crate::fs::create_directory;
use crate::git::{CommitIdentity, VersionControl};
use crate::gitlab::Project;
use crate::pipeline::{Pipeline, PipelineReport};
use futures::future::join_all;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;

pub mod fanout;
pub mod fs;
pub mod git;
pub mod gitlab;
pub mod pipeline;

/// Everything a run needs besides the projects themselves
#[derive(Debug, Clone)]
pub struct RunContext {
    pub repos_dir: PathBuf,
    pub template_dir: PathBuf,
    pub fan_out: FanOutConfig,
    pub identity: CommitIdentity,
}

impl Default for RunContext {
    fn default() -> Self {
        Self {
            repos_dir: PathBuf::from("repos"),
            template_dir: PathBuf::from("template"),
            fan_out: FanOutConfig::default(),
            identity: CommitIdentity::default(),
        }
    }
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub reports: Vec<PipelineReport>,
    /// Projects whose pipeline panicked before producing a report
    pub aborted: Vec<String>,
}

impl RunSummary {
    pub fn failed(&self) -> impl Iterator<Item = &PipelineReport> {
        self.reports.iter().filter(|report| !report.is_success())
    }

    pub fn log(&self) {
        let failed = self.failed().count() + self.aborted.len();
        info!(
            "Processed {} projects, {} failed",
            self.reports.len() + self.aborted.len(),
            failed
        );
        for report in self.failed() {
            let steps: Vec<String> = report
                .failures
                .iter()
                .map(|failure| failure.step.to_string())
                .collect();
            warn!("{} failed at: {}", report.name, steps.join(", "));
        }
        for name in &self.aborted {
            warn!("{name} was aborted");
        }
    }
}

/// Pushes the template into every project and waits for all of them
/// to finish
pub async fn run(
    context: &RunContext,
    projects: Vec<Project>,
    vcs: impl VersionControl + 'static,
) -> RunSummary {
    if let Err(err) = create_directory(&context.repos_dir).await {
        error!(
            "Failed to create repos directory {}: {err}",
            context.repos_dir.display()
        );
    }

    let pipeline = Arc::new(Pipeline::new(
        &context.repos_dir,
        &context.template_dir,
        context.identity.clone(),
        vcs,
    ));
    if !pipeline.template_dir().is_dir() {
        warn!(
            "Template directory {} is missing, nothing will be copied",
            pipeline.template_dir().display()
        );
    }

    let names: Vec<String> = projects.iter().map(|project| project.name.clone()).collect();
    let fan_out = FanOut::new(context.fan_out);
    let handles = fan_out
        .dispatch(projects, move |project| pipeline.run(&project))
        .await;

    let mut summary = RunSummary::default();
    for (name, result) in names.into_iter().zip(join_all(handles).await) {
        match result {
            Ok(report) => summary.reports.push(report),
            Err(err) => {
                error!("Pipeline for {name} did not finish: {err}");
                summary.aborted.push(name);
            }
        }
    }
    summary
}
