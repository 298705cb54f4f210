//! Output formatting and persistence for pipeline reports.
//!
//! Supports pretty-printing, JSON serialization (optionally gzipped), and
//! CSV append of flat stress rows.

use anyhow::Result;
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Serialize;
use tracing::{debug, info};

use crate::analyzers::types::{Domain, Recommendation, StressBand, StressScore};
use crate::pipeline::Report;
use csv::WriterBuilder;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

/// One CSV row per stress score. Missing domains are left blank.
#[derive(Debug, Serialize)]
pub struct StressRow {
    pub zone_id: String,
    pub period: String,
    pub composite_score: f64,
    pub band: StressBand,
    pub dominant_domain: Option<Domain>,
    pub energy: Option<f64>,
    pub grievance: Option<f64>,
    pub traffic: Option<f64>,
    pub waste: Option<f64>,
}

impl From<&StressScore> for StressRow {
    fn from(s: &StressScore) -> Self {
        let component = |d: Domain| s.component_scores.get(&d).copied();
        StressRow {
            zone_id: s.zone_id.clone(),
            period: s.period.to_string(),
            composite_score: s.composite_score,
            band: s.band,
            dominant_domain: s.dominant_domain,
            energy: component(Domain::Energy),
            grievance: component(Domain::Grievance),
            traffic: component(Domain::Traffic),
            waste: component(Domain::Waste),
        }
    }
}

/// Logs the ranked recommendations using Rust's debug pretty-print format.
pub fn print_pretty(recommendations: &[Recommendation]) {
    debug!("{:#?}", recommendations);
}

/// Logs any serializable value as pretty-printed JSON.
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    info!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Writes the full report as pretty JSON, gzip-compressed when `gzip`.
pub fn write_report(path: &str, report: &Report, gzip: bool) -> Result<()> {
    let json = serde_json::to_vec_pretty(report)?;

    let body = if gzip {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json)?;
        encoder.finish()?
    } else {
        json
    };

    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, &body)?;

    info!(path, gzip, bytes = body.len(), "Report written");
    Ok(())
}

/// Appends one row per [`StressScore`] to a CSV file.
///
/// Creates the file with headers if it does not already exist.
pub fn append_stress_rows(path: &str, scores: &[StressScore]) -> Result<()> {
    let file_exists = Path::new(path).exists();
    debug!(path, file_exists, rows = scores.len(), "Appending stress rows");

    let file = OpenOptions::new().append(true).create(true).open(path)?;

    let mut writer = WriterBuilder::new()
        .has_headers(!file_exists) // IMPORTANT when appending
        .from_writer(file);

    for s in scores {
        writer.serialize(StressRow::from(s))?;
    }
    writer.flush()?;

    Ok(())
}
