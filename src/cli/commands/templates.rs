//! Template CLI commands.

use anyhow::Result;
use clap::{Args, Subcommand};
use serde::Serialize;

use crate::cli::output::{label, output, table, truncate, CommandOutput};
use crate::domain::models::WorkflowTemplate;
use crate::services::TemplateRegistry;

#[derive(Args, Debug)]
pub struct TemplatesArgs {
    #[command(subcommand)]
    pub command: TemplateCommands,
}

#[derive(Subcommand, Debug)]
pub enum TemplateCommands {
    /// List built-in workflow templates
    List,
    /// Show a template's steps and criteria
    Show {
        /// Template id
        id: String,
    },
}

/// One row of `templates list`.
#[derive(Debug, Serialize)]
pub struct TemplateSummary {
    /// Template id.
    pub template_id: String,
    /// Display name.
    pub template_name: String,
    /// Research domain.
    pub domain: String,
    /// Number of steps.
    pub steps: usize,
    /// Planning estimate.
    pub estimated_total_duration_hours: f64,
}

impl From<&WorkflowTemplate> for TemplateSummary {
    fn from(template: &WorkflowTemplate) -> Self {
        Self {
            template_id: template.template_id.clone(),
            template_name: template.template_name.clone(),
            domain: template.domain.clone(),
            steps: template.steps.len(),
            estimated_total_duration_hours: template.estimated_total_duration_hours,
        }
    }
}

/// Output of `templates list`.
#[derive(Debug, Serialize)]
pub struct TemplateListOutput {
    /// One row per template.
    pub templates: Vec<TemplateSummary>,
    /// Number of templates.
    pub total: usize,
}

impl CommandOutput for TemplateListOutput {
    fn to_human(&self) -> String {
        if self.templates.is_empty() {
            return "No templates registered.".to_string();
        }
        let mut t = table(&["ID", "NAME", "DOMAIN", "STEPS", "EST. HOURS"]);
        for template in &self.templates {
            t.add_row(vec![
                template.template_id.clone(),
                truncate(&template.template_name, 40),
                template.domain.clone(),
                template.steps.to_string(),
                format!("{:.1}", template.estimated_total_duration_hours),
            ]);
        }
        format!("{} template(s):\n{t}", self.total)
    }
}

/// Output of `templates show`.
#[derive(Debug, Serialize)]
pub struct TemplateDetailOutput {
    /// The full template.
    pub template: WorkflowTemplate,
}

impl CommandOutput for TemplateDetailOutput {
    fn to_human(&self) -> String {
        let template = &self.template;
        let mut lines = vec![
            format!("Template: {}", template.template_name),
            format!("ID: {}", template.template_id),
            format!("Domain: {}", template.domain),
            format!("Description: {}", template.description),
            String::new(),
        ];

        let mut steps = table(&["#", "STEP", "PROVIDER", "CAPABILITIES", "DEPENDS ON", "EST. MIN"]);
        for (index, step) in template.steps.iter().enumerate() {
            steps.add_row(vec![
                (index + 1).to_string(),
                step.step_id.clone(),
                step.required_provider_type.to_string(),
                step.required_capabilities.iter().map(label).collect::<Vec<_>>().join(", "),
                if step.dependencies.is_empty() {
                    "-".to_string()
                } else {
                    step.dependencies.join(", ")
                },
                format!("{:.0}", step.estimated_duration_minutes),
            ]);
        }
        lines.push(steps.to_string());

        if !template.success_criteria.is_empty() {
            lines.push("\nSuccess criteria:".to_string());
            lines.extend(template.success_criteria.iter().map(|c| format!("  - {c}")));
        }
        if !template.failure_conditions.is_empty() {
            lines.push("\nFailure conditions:".to_string());
            lines.extend(template.failure_conditions.iter().map(|c| format!("  - {c}")));
        }
        lines.join("\n")
    }
}

/// Run a `templates` subcommand.
pub fn execute(args: TemplatesArgs, json_mode: bool) -> Result<()> {
    let registry = TemplateRegistry::with_builtin()?;

    match args.command {
        TemplateCommands::List => {
            let templates: Vec<TemplateSummary> = registry
                .list()
                .iter()
                .map(|t| TemplateSummary::from(t.as_ref()))
                .collect();
            let total = templates.len();
            output(&TemplateListOutput { templates, total }, json_mode);
        }
        TemplateCommands::Show { id } => {
            let template = registry.get(&id)?;
            output(
                &TemplateDetailOutput {
                    template: template.as_ref().clone(),
                },
                json_mode,
            );
        }
    }
    Ok(())
}
