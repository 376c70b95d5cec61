//! `validate` - check a stream definition without running it

use anyhow::Context;
use clap::Args;
use colored::Colorize;
use processor::config::{StreamSpec, WindowKind, WindowSpec};
use std::path::{Path, PathBuf};

#[derive(Args, Debug, Clone)]
pub struct ValidateArgs {
    /// Stream definition (YAML or JSON)
    #[arg(value_name = "SPEC")]
    pub spec: PathBuf,
}

impl ValidateArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let spec = load_spec(&self.spec)?;
        println!("{} {}", "✓".green().bold(), self.spec.display());
        print!("{}", summarize(&spec));
        Ok(())
    }
}

/// Load and validate a stream definition
pub fn load_spec(path: &Path) -> anyhow::Result<StreamSpec> {
    let spec: StreamSpec = stream_analytics_config::load_document(path)
        .with_context(|| format!("reading stream definition {}", path.display()))?;
    spec.validate()
        .with_context(|| format!("invalid stream definition {}", path.display()))?;
    Ok(spec)
}

pub fn summarize(spec: &StreamSpec) -> String {
    let mut out = String::new();
    out.push_str(&format!("  {:<14}{}\n", "stream", spec.id.bold()));
    if let Some(description) = &spec.description {
        out.push_str(&format!("  {:<14}{}\n", "description", description));
    }
    out.push_str(&format!(
        "  {:<14}{} filters, {} transforms, {} enrichments\n",
        "stages",
        spec.filters.len(),
        spec.transforms.len(),
        spec.enrichments.len()
    ));

    for aggregation in &spec.aggregations {
        let functions: Vec<String> = aggregation
            .functions
            .iter()
            .map(|f| format!("{}({})", f.function.name(), f.field))
            .collect();
        let group_by = if aggregation.group_by.is_empty() {
            String::new()
        } else {
            format!(" by {}", aggregation.group_by.join(", "))
        };
        out.push_str(&format!(
            "  {:<14}{} {} [{}]{}\n",
            "aggregation",
            aggregation.id.cyan(),
            describe_window(&aggregation.window),
            functions.join(", "),
            group_by
        ));
    }

    out.push_str(&format!("  {:<14}{}\n", "alerts", spec.alerts.len()));
    out.push_str(&format!(
        "  {:<14}max out-of-order {}ms, idle timeout {}ms\n",
        "watermark", spec.watermark.max_out_of_order_ms, spec.watermark.idle_timeout_ms
    ));
    out.push_str(&format!(
        "  {:<14}{} (threshold {})\n",
        "backpressure",
        spec.backpressure.kind.name(),
        spec.backpressure.threshold
    ));
    let checkpoint = if spec.checkpoint.enabled {
        format!("every {}ms", spec.checkpoint.interval_ms)
    } else {
        "disabled".to_string()
    };
    out.push_str(&format!("  {:<14}{}\n", "checkpoint", checkpoint));
    out
}

fn describe_window(window: &WindowSpec) -> String {
    let mut text = match window.kind {
        WindowKind::Tumbling => format!("tumbling {}ms", window.size_ms.unwrap_or_default()),
        WindowKind::Sliding => format!(
            "sliding {}ms every {}ms",
            window.size_ms.unwrap_or_default(),
            window.slide_ms.unwrap_or_default()
        ),
        WindowKind::Session => format!("session gap {}ms", window.session_timeout_ms.unwrap_or_default()),
        WindowKind::Global => "global".to_string(),
    };
    if window.allowed_lateness_ms > 0 {
        text.push_str(&format!(" +{}ms lateness", window.allowed_lateness_ms));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_spec(contents: &str, suffix: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_and_summarize_yaml_spec() {
        let file = write_spec(
            r#"
id: orders
description: order totals
filters:
  - name: positive
    condition: "amount > 0"
aggregations:
  - id: per_minute
    group_by: [region]
    window:
      type: tumbling
      size_ms: 60000
      allowed_lateness_ms: 5000
    functions:
      - field: "*"
        function: count
      - field: amount
        function: sum
"#,
            ".yaml",
        );

        let spec = load_spec(file.path()).unwrap();
        assert_eq!(spec.id, "orders");

        colored::control::set_override(false);
        let summary = summarize(&spec);
        assert!(summary.contains("1 filters, 0 transforms, 0 enrichments"));
        assert!(summary.contains("per_minute tumbling 60000ms +5000ms lateness [count(*), sum(amount)] by region"));
        assert!(summary.contains("every 10000ms"));
    }

    #[test]
    fn test_invalid_spec_is_rejected() {
        let file = write_spec(
            r#"{"id": "bad", "aggregations": [{"id": "s", "window": {"type": "session"}, "functions": [{"field": "*", "function": "count"}]}]}"#,
            ".json",
        );
        let err = load_spec(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("invalid stream definition"));
    }

    #[test]
    fn test_missing_file() {
        let err = load_spec(Path::new("/nonexistent/stream.yaml")).unwrap_err();
        assert!(format!("{:#}", err).contains("not found"));
    }
}
