use crate::docker::ExtractedLayer;
use crate::error::Result;
use chrono::{DateTime, Utc};
use log::info;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Terminal state of one layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LayerOutcome {
    Extracted(ExtractedLayer),
    /// The nested archive was missing at extraction time
    Skipped { reason: String },
    /// Extraction failed; any nested archive on disk was left in place
    Failed { error: String },
}

/// Outcome record for one layer member
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerReport {
    /// Path of the layer member inside the image archive
    pub member: String,
    /// Output directory for the layer (not created when the member was rejected)
    pub layer_dir: PathBuf,
    #[serde(flatten)]
    pub outcome: LayerOutcome,
}

impl LayerReport {
    pub fn is_extracted(&self) -> bool {
        matches!(self.outcome, LayerOutcome::Extracted(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.outcome, LayerOutcome::Skipped { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, LayerOutcome::Failed { .. })
    }
}

/// Summary of one unpack run, reduced from the per-layer reports
#[derive(Debug, Clone, Serialize)]
pub struct UnpackSummary {
    pub archive: PathBuf,
    pub output_root: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub layers: Vec<LayerReport>,
}

impl UnpackSummary {
    pub fn succeeded(&self) -> usize {
        self.layers.iter().filter(|layer| layer.is_extracted()).count()
    }

    pub fn failed(&self) -> usize {
        self.layers.iter().filter(|layer| layer.is_failed()).count()
    }

    pub fn skipped(&self) -> usize {
        self.layers.iter().filter(|layer| layer.is_skipped()).count()
    }

    /// True when there was at least one layer and none of them made it
    pub fn all_failed(&self) -> bool {
        !self.layers.is_empty() && self.failed() == self.layers.len()
    }

    pub fn log_summary(&self) {
        info!(
            "Unpacked {} into {}: {} layers, {} succeeded, {} failed, {} skipped",
            self.archive.display(),
            self.output_root.display(),
            self.layers.len(),
            self.succeeded(),
            self.failed(),
            self.skipped()
        );
    }

    /// Write the summary as pretty-printed JSON
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }
}
