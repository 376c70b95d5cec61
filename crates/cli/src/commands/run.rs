//! `run` - execute a stream definition over a JSON-lines file
//!
//! Results go to stdout (one JSON object per line) or to `--output`. The job
//! stops once the input is drained, or on Ctrl-C with `--follow`.

use super::validate::load_spec;
use anyhow::{bail, Context};
use clap::Args;
use colored::Colorize;
use processor::checkpoint::{CheckpointStore, FsCheckpointStore, MemoryCheckpointStore};
use processor::metrics::MetricsRegistry;
use processor::sink::{FileSink, OutputSink, StdoutSink};
use processor::source::JsonLinesSource;
use processor::supervisor::{JobContext, JobSupervisor};
use std::path::PathBuf;
use std::sync::Arc;
use stream_analytics_config::EngineConfig;
use stream_analytics_types::{JobRun, JobStatus};
use tracing::info;

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Stream definition (YAML or JSON)
    #[arg(value_name = "SPEC")]
    pub spec: PathBuf,

    /// JSON-lines input file
    #[arg(short, long, value_name = "FILE")]
    pub input: PathBuf,

    /// Write results to a JSON-lines file instead of stdout
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Persist checkpoints under this directory (overrides the config file)
    #[arg(long, value_name = "DIR")]
    pub checkpoint_dir: Option<PathBuf>,

    /// Keep tailing the input after reaching its end
    #[arg(short, long)]
    pub follow: bool,

    /// Print Prometheus metrics to stderr when the job finishes
    #[arg(long)]
    pub print_metrics: bool,
}

impl RunArgs {
    pub async fn execute(&self, config: &EngineConfig) -> anyhow::Result<()> {
        let spec = load_spec(&self.spec)?;
        let source = JsonLinesSource::new(&self.input, spec.source.time_field.clone()).follow(self.follow);

        let sink: Arc<dyn OutputSink> = match &self.output {
            Some(path) => Arc::new(
                FileSink::open(path)
                    .await
                    .with_context(|| format!("opening output {}", path.display()))?,
            ),
            None => Arc::new(StdoutSink),
        };

        let checkpoint_dir = self.checkpoint_dir.clone().or_else(|| config.checkpoint.dir.clone());
        let store: Arc<dyn CheckpointStore> = match checkpoint_dir {
            Some(dir) => Arc::new(FsCheckpointStore::new(dir, config.checkpoint.max_checkpoints)),
            None => Arc::new(MemoryCheckpointStore::with_retention(config.checkpoint.max_checkpoints)),
        };

        let mut ctx = JobContext::new()
            .with_sink(sink)
            .with_checkpoint_store(store)
            .stop_when_exhausted(!self.follow);
        ctx.dispatch_capacity = config.service.channel_capacity;
        ctx.spill_dir = config.spill_dir.clone();

        let mut handle = JobSupervisor::start(spec, Box::new(source), ctx).await?;
        info!(
            service = %config.service.name,
            stream_id = %handle.stream_id(),
            job_id = %handle.job_id(),
            input = %self.input.display(),
            "Job started"
        );

        let interrupted = tokio::select! {
            _ = handle.wait_for_status(JobStatus::Stopped) => false,
            result = tokio::signal::ctrl_c() => {
                result.context("listening for Ctrl-C")?;
                info!("Interrupted, stopping job");
                true
            }
        };
        let run = if interrupted {
            handle.stop().await
        } else {
            handle.wait().await
        };

        eprint!("{}", report(&run));
        if self.print_metrics {
            let metrics = MetricsRegistry::global().encode()?;
            eprintln!("{}", metrics);
        }

        if run.status == JobStatus::Failed {
            bail!(
                "job {} failed: {}",
                run.job_id,
                run.failure.as_deref().unwrap_or("unknown error")
            );
        }
        Ok(())
    }
}

fn report(run: &JobRun) -> String {
    let status = match run.status {
        JobStatus::Stopped => run.status.name().green(),
        JobStatus::Failed => run.status.name().red(),
        _ => run.status.name().yellow(),
    };
    let mut out = format!(
        "{} {} {}\n",
        "job".bold(),
        run.job_id,
        status.bold()
    );
    out.push_str(&format!("  {:<12}{}\n", "processed", run.events_processed));
    out.push_str(&format!("  {:<12}{}\n", "failed", run.events_failed));
    out.push_str(&format!("  {:<12}{}\n", "checkpoints", run.checkpoints.len()));
    if run.recoveries > 0 {
        out.push_str(&format!("  {:<12}{}\n", "recoveries", run.recoveries));
    }
    for error in run.errors.iter().take(5) {
        let stage = format!("{:?}", error.stage).to_lowercase();
        out.push_str(&format!("  {} {}: {}\n", "!".yellow(), stage, error.message));
    }
    if run.errors_dropped > 0 {
        out.push_str(&format!("  ... {} more errors not recorded\n", run.errors_dropped));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use stream_analytics_types::{JobId, StreamId};

    #[test]
    fn test_report_lists_counts() {
        colored::control::set_override(false);
        let mut run = JobRun::new(JobId::new(), StreamId::new("orders").unwrap());
        run.status = JobStatus::Stopped;
        run.events_processed = 42;
        run.events_failed = 2;

        let text = report(&run);
        assert!(text.contains("stopped"));
        assert!(text.contains("processed   42"));
        assert!(text.contains("failed      2"));
        assert!(!text.contains("recoveries"));
    }

    #[tokio::test]
    async fn test_run_writes_window_results() {
        let dir = tempfile::tempdir().unwrap();
        let spec_path = dir.path().join("orders.yaml");
        let input = dir.path().join("orders.jsonl");
        let output = dir.path().join("results.jsonl");

        std::fs::write(
            &spec_path,
            r#"
id: orders
source:
  time_field: ts
  poll_interval_ms: 5
aggregations:
  - id: per_minute
    window:
      type: tumbling
      size_ms: 60000
    functions:
      - field: "*"
        function: count
        output: n
"#,
        )
        .unwrap();
        let mut file = std::fs::File::create(&input).unwrap();
        for ts in [1_000, 2_000, 61_000] {
            writeln!(file, r#"{{"ts": {}, "amount": 1}}"#, ts).unwrap();
        }
        drop(file);

        let args = RunArgs {
            spec: spec_path,
            input,
            output: Some(output.clone()),
            checkpoint_dir: Some(dir.path().join("checkpoints")),
            follow: false,
            print_metrics: false,
        };
        args.execute(&EngineConfig::default()).await.unwrap();

        let lines: Vec<serde_json::Value> = std::fs::read_to_string(&output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert!(dir.path().join("checkpoints").exists());
    }
}
