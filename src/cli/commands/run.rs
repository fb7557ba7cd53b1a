//! Run one research cycle end to end against the in-process adapters.

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

use super::load_config;
use crate::application::ResearchRuntime;
use crate::cli::output::{output, table, truncate, CommandOutput};
use crate::domain::models::{CycleSnapshot, ProjectState, ResearchProject, SafetyStatusReport, WorkflowState};
use crate::domain::ports::ProjectStore;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Template id to run
    #[arg(short, long)]
    pub template: String,

    /// Research question for the project
    #[arg(short, long)]
    pub question: Option<String>,

    /// Hypothesis under test
    #[arg(long)]
    pub hypothesis: Option<String>,

    /// Project title
    #[arg(long)]
    pub title: Option<String>,

    /// Give up waiting after this many seconds
    #[arg(long, default_value = "3600")]
    pub timeout_secs: u64,

    /// Override the scheduler dispatch period
    #[arg(long)]
    pub dispatch_interval_ms: Option<u64>,
}

/// Final state of a `run` invocation.
#[derive(Debug, Serialize)]
pub struct RunOutput {
    /// Cycle snapshot at exit.
    pub cycle: CycleSnapshot,
    /// Project state at exit.
    pub project_state: Option<ProjectState>,
    /// Safety status at exit.
    pub safety: SafetyStatusReport,
}

impl CommandOutput for RunOutput {
    fn to_human(&self) -> String {
        let cycle = &self.cycle;
        let mut summary = table(&["FIELD", "VALUE"]);
        summary.add_row(vec!["Cycle".to_string(), cycle.cycle_id.to_string()]);
        summary.add_row(vec!["Template".to_string(), cycle.template_name.clone()]);
        summary.add_row(vec!["State".to_string(), cycle.state.to_string()]);
        summary.add_row(vec![
            "Progress".to_string(),
            format!("{:.0}% ({}/{} steps)", cycle.progress_percentage, cycle.current_step, cycle.total_steps),
        ]);
        summary.add_row(vec!["Quality score".to_string(), format!("{:.2}", cycle.quality_score)]);
        summary.add_row(vec![
            "Project".to_string(),
            self.project_state.map_or_else(|| "-".to_string(), |s| s.to_string()),
        ]);
        summary.add_row(vec![
            "Safety".to_string(),
            format!(
                "{} ({} active violations)",
                self.safety.system_safety_status, self.safety.active_violations
            ),
        ]);
        if let Some(reason) = &cycle.failure_reason {
            summary.add_row(vec!["Failure".to_string(), reason.clone()]);
        }

        let mut steps = table(&["STEP", "PROVIDER", "OUTPUTS"]);
        let mut step_ids: Vec<&String> = cycle.step_results.keys().collect();
        step_ids.sort();
        for step_id in step_ids {
            let outputs = cycle.step_results[step_id]
                .keys()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ");
            steps.add_row(vec![
                step_id.clone(),
                cycle
                    .assigned_providers
                    .get(step_id)
                    .cloned()
                    .unwrap_or_else(|| "-".to_string()),
                truncate(&outputs, 60),
            ]);
        }

        format!("{summary}\n{steps}")
    }
}

/// Start a runtime, run one cycle to completion and print the outcome.
pub async fn execute(args: RunArgs, config_path: Option<&Path>, json_mode: bool) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(ms) = args.dispatch_interval_ms {
        config.scheduler.dispatch_interval_ms = ms.max(1);
    }

    let (runtime, projects) = ResearchRuntime::in_memory(config)?;
    runtime
        .engine()
        .get_template(&args.template)
        .await
        .with_context(|| format!("Unknown template '{}'", args.template))?;

    let question = args
        .question
        .unwrap_or_else(|| format!("Exploratory run of {}", args.template));
    let title = args.title.unwrap_or_else(|| truncate(&question, 60));
    let mut project = ResearchProject::new(title, question);
    if let Some(hypothesis) = args.hypothesis {
        project = project.with_hypothesis(hypothesis);
    }
    let project_id = projects.insert(project).await;

    runtime.start().await?;
    let outcome = async {
        let cycle_id = runtime.start_cycle(project_id, &args.template).await?;
        runtime
            .wait_for_cycle(cycle_id, Duration::from_secs(args.timeout_secs))
            .await
    }
    .await;
    runtime.stop().await?;
    let cycle = outcome?;

    let project_state = projects
        .get_project(project_id)
        .await?
        .map(|p| p.state);
    let safety = runtime.monitor().get_safety_status().await;
    let failed = cycle.state == WorkflowState::Failed;

    output(
        &RunOutput {
            cycle,
            project_state,
            safety,
        },
        json_mode,
    );
    if failed {
        anyhow::bail!("research cycle failed");
    }
    Ok(())
}
