//! `checkpoints` - list checkpoints persisted for a stream

use anyhow::Context;
use clap::Args;
use colored::Colorize;
use processor::checkpoint::{CheckpointStore, FsCheckpointStore};
use std::path::PathBuf;
use stream_analytics_config::EngineConfig;
use stream_analytics_types::{CheckpointRef, StreamId};

#[derive(Args, Debug, Clone)]
pub struct CheckpointsArgs {
    /// Checkpoint directory
    #[arg(value_name = "DIR")]
    pub dir: PathBuf,

    /// Stream identifier
    #[arg(value_name = "STREAM_ID")]
    pub stream_id: String,
}

impl CheckpointsArgs {
    pub async fn execute(&self, config: &EngineConfig) -> anyhow::Result<()> {
        let stream_id = StreamId::new(&self.stream_id).context("invalid stream id")?;
        let store = FsCheckpointStore::new(&self.dir, config.checkpoint.max_checkpoints);
        let refs = store
            .list(&stream_id)
            .await
            .with_context(|| format!("listing checkpoints in {}", self.dir.display()))?;

        if refs.is_empty() {
            println!("No checkpoints for {}", stream_id.as_str().bold());
            return Ok(());
        }
        print!("{}", format_table(&refs));
        Ok(())
    }
}

fn format_table(refs: &[CheckpointRef]) -> String {
    let mut out = format!(
        "{:<22} {:<25} {:>15} {:>10} {:>8}\n",
        "CHECKPOINT".bold(),
        "CREATED".bold(),
        "WATERMARK".bold(),
        "OFFSET".bold(),
        "WINDOWS".bold()
    );
    for r in refs {
        let offset = r
            .last_offset
            .map(|o| o.to_string())
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "{:<22} {:<25} {:>15} {:>10} {:>8}\n",
            r.checkpoint_id.cyan(),
            r.created_at.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
            r.watermark,
            offset,
            r.window_count
        ));
    }
    out
}
