//! Rendering finalized runs into outbound message bodies.
//!
//! The `[output]` block of a workflow names the step output fields to
//! surface; without one, every output of the run's terminal steps is
//! included. Bodies carry a timestamp and attribution to the triggering
//! message.

use std::collections::HashMap;

use crate::workflow::definition::{OutputFormat, WorkflowDefinition, resolve_dotted};
use crate::workflow::run::{StepStatus, WorkflowRun};

/// Who triggered the run; rendered into the body header.
#[derive(Debug, Clone)]
pub struct Attribution {
    pub sender: String,
    pub subject: Option<String>,
}

/// Subject line for the outbound message.
pub fn render_subject(run: &WorkflowRun) -> String {
    let label = match run.status {
        Some(status) => format!("{status:?}").to_lowercase(),
        None => "unfinished".to_string(),
    };
    format!("mailflow: {} ({label})", run.workflow)
}

/// Render the run's output fields into a body in the requested format.
pub fn render_body(
    run: &WorkflowRun,
    definition: &WorkflowDefinition,
    attribution: &Attribution,
    wrap_width: usize,
) -> String {
    let format = definition
        .output
        .as_ref()
        .map(|o| o.format)
        .unwrap_or_default();
    let fields = collect_fields(run, definition);

    let timestamp = run
        .completed_at
        .unwrap_or(run.created_at)
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    let subject = attribution.subject.as_deref().unwrap_or("(no subject)");

    let mut body = String::new();
    match format {
        OutputFormat::Markdown => {
            body.push_str(&format!("# {}\n\n", definition.workflow.name));
            body.push_str(&format!(
                "Triggered by {} (\"{}\") at {}\n",
                attribution.sender, subject, timestamp
            ));
            for (path, value) in &fields {
                body.push_str(&format!("\n## {path}\n\n{value}\n"));
            }
        }
        OutputFormat::Plaintext => {
            body.push_str(&format!("{}\n", definition.workflow.name));
            body.push_str(&wrap(
                &format!(
                    "Triggered by {} (\"{}\") at {}",
                    attribution.sender, subject, timestamp
                ),
                wrap_width,
            ));
            body.push('\n');
            for (path, value) in &fields {
                body.push_str(&format!("\n{path}:\n"));
                body.push_str(&wrap(value, wrap_width));
                body.push('\n');
            }
        }
    }
    body
}

/// Resolve the declared output fields, or fall back to every output of the
/// run's succeeded terminal steps. Unresolvable paths are silently dropped.
fn collect_fields(run: &WorkflowRun, definition: &WorkflowDefinition) -> Vec<(String, String)> {
    let step_outputs: HashMap<String, serde_json::Value> = run
        .steps
        .iter()
        .filter(|s| s.status == StepStatus::Succeeded)
        .map(|s| (s.step_id.clone(), s.output.clone()))
        .collect();

    let declared = definition
        .output
        .as_ref()
        .map(|o| o.fields.as_slice())
        .unwrap_or(&[]);

    if !declared.is_empty() {
        return declared
            .iter()
            .filter_map(|path| {
                resolve_dotted(&step_outputs, path).map(|v| (path.clone(), render_value(v)))
            })
            .collect();
    }

    let mut fields = Vec::new();
    for idx in definition.leaf_indices() {
        let step = &run.steps[idx];
        if let serde_json::Value::Object(map) = &step.output {
            for (key, value) in map {
                fields.push((format!("{}.{}", step.step_id, key), render_value(value)));
            }
        }
    }
    fields
}

fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Greedy word wrap; existing line breaks are preserved.
pub fn wrap(text: &str, width: usize) -> String {
    if width == 0 {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    for (i, line) in text.lines().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        let mut column = 0;
        for word in line.split_whitespace() {
            if column > 0 && column + 1 + word.len() > width {
                out.push('\n');
                column = 0;
            } else if column > 0 {
                out.push(' ');
                column += 1;
            }
            out.push_str(word);
            column += word.len();
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::run::RunStatus;

    fn sample_run(def: &WorkflowDefinition) -> WorkflowRun {
        let mut run = WorkflowRun::new(
            &def.workflow.name,
            "m-1",
            serde_json::json!({}),
            def.steps.iter().map(|s| s.id.as_str()),
        );
        for step in &mut run.steps {
            step.status = StepStatus::Succeeded;
        }
        run
    }

    const DOC: &str = r#"
        [workflow]
        name = "digest"
        version = "1"

        [[steps]]
        id = "ingested"
        agent = "ingest"

        [[steps]]
        id = "summary"
        agent = "template"
        input_from = "ingested"

        [output]
        format = "markdown"
        fields = ["summary.rendered", "ingested.metadata.word_count"]
    "#;

    #[test]
    fn markdown_body_renders_declared_fields_with_attribution() {
        let def = WorkflowDefinition::from_toml(DOC).unwrap();
        let mut run = sample_run(&def);
        run.steps[0].output = serde_json::json!({"metadata": {"word_count": 42}});
        run.steps[1].output = serde_json::json!({"rendered": "All quiet."});
        run.finalize(RunStatus::Succeeded);

        let body = render_body(
            &run,
            &def,
            &Attribution {
                sender: "ops@example.com".into(),
                subject: Some("Daily summary".into()),
            },
            80,
        );

        assert!(body.starts_with("# digest\n"));
        assert!(body.contains("Triggered by ops@example.com (\"Daily summary\")"));
        assert!(body.contains("## summary.rendered\n\nAll quiet."));
        assert!(body.contains("## ingested.metadata.word_count\n\n42"));
    }

    #[test]
    fn unresolvable_fields_are_dropped() {
        let def = WorkflowDefinition::from_toml(DOC).unwrap();
        let mut run = sample_run(&def);
        // summary produced nothing usable; only ingested resolves.
        run.steps[0].output = serde_json::json!({"metadata": {"word_count": 7}});
        run.steps[1].status = StepStatus::Failed;
        run.finalize(RunStatus::Partial);

        let body = render_body(
            &run,
            &def,
            &Attribution {
                sender: "a@b.com".into(),
                subject: None,
            },
            80,
        );
        assert!(!body.contains("summary.rendered"));
        assert!(body.contains("ingested.metadata.word_count"));
        assert!(body.contains("(no subject)"));
    }

    #[test]
    fn missing_output_block_falls_back_to_leaf_outputs() {
        let doc = r#"
            [workflow]
            name = "bare"
            version = "1"

            [[steps]]
            id = "only"
            agent = "template"
        "#;
        let def = WorkflowDefinition::from_toml(doc).unwrap();
        let mut run = sample_run(&def);
        run.steps[0].output = serde_json::json!({"rendered": "done"});
        run.finalize(RunStatus::Succeeded);

        let body = render_body(
            &run,
            &def,
            &Attribution {
                sender: "a@b.com".into(),
                subject: Some("x".into()),
            },
            80,
        );
        assert!(body.contains("only.rendered"));
        assert!(body.contains("done"));
    }

    #[test]
    fn plaintext_wraps_at_the_requested_column() {
        let text = "one two three four five six seven eight nine ten";
        let wrapped = wrap(text, 15);
        for line in wrapped.lines() {
            assert!(line.len() <= 15, "line too long: {line:?}");
        }
        assert_eq!(wrapped.split_whitespace().count(), 10);
    }

    #[test]
    fn wrap_preserves_existing_line_breaks() {
        let wrapped = wrap("first line\nsecond line", 80);
        assert_eq!(wrapped, "first line\nsecond line");
    }

    #[test]
    fn subject_names_workflow_and_status() {
        let def = WorkflowDefinition::from_toml(DOC).unwrap();
        let mut run = sample_run(&def);
        run.finalize(RunStatus::Partial);
        assert_eq!(render_subject(&run), "mailflow: digest (partial)");
    }
}
