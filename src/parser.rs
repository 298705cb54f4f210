//! CSV parser for the four municipal datasets.
//!
//! Tables are kept as untyped string cells; column validation and typing
//! happen in the normalizer.

use anyhow::{Context, Result};
use std::io::Read;
use std::path::Path;
use tracing::{debug, warn};

use crate::analyzers::types::Domain;

pub const GRIEVANCES_FILE: &str = "pune_citizen_grievances.csv";
pub const ENERGY_FILE: &str = "pune_energy_consumption.csv";
pub const TRAFFIC_FILE: &str = "pune_traffic_flow.csv";
pub const WASTE_FILE: &str = "pune_waste_management.csv";

/// A header row plus string cells, exactly as read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RawTable {
    pub fn new(columns: &[&str], rows: Vec<Vec<&str>>) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: rows
                .into_iter()
                .map(|r| r.into_iter().map(str::to_string).collect())
                .collect(),
        }
    }

    /// Position of `name` in the header, ignoring surrounding whitespace.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.trim() == name)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Reads a CSV document with a header row into a [`RawTable`].
///
/// # Errors
///
/// Returns an error if the input is not well-formed CSV.
pub fn parse_table<R: Read>(reader: R) -> Result<RawTable> {
    let mut rdr = csv::ReaderBuilder::new().flexible(true).from_reader(reader);

    let columns = rdr.headers()?.iter().map(str::to_string).collect();
    let mut rows = Vec::new();
    for record in rdr.records() {
        let record = record?;
        rows.push(record.iter().map(str::to_string).collect());
    }

    Ok(RawTable { columns, rows })
}

/// The four input tables. An absent table means that domain has no data.
#[derive(Debug, Clone, Default)]
pub struct RawTables {
    pub traffic: Option<RawTable>,
    pub energy: Option<RawTable>,
    pub waste: Option<RawTable>,
    pub grievance: Option<RawTable>,
}

impl RawTables {
    pub fn get(&self, domain: Domain) -> Option<&RawTable> {
        match domain {
            Domain::Traffic => self.traffic.as_ref(),
            Domain::Energy => self.energy.as_ref(),
            Domain::Waste => self.waste.as_ref(),
            Domain::Grievance => self.grievance.as_ref(),
        }
    }

    /// Loads the tables from `dir` using the default file names.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        Ok(Self {
            traffic: load_optional(&dir.join(TRAFFIC_FILE))?,
            energy: load_optional(&dir.join(ENERGY_FILE))?,
            waste: load_optional(&dir.join(WASTE_FILE))?,
            grievance: load_optional(&dir.join(GRIEVANCES_FILE))?,
        })
    }
}

/// Parses the CSV at `path`, or returns `None` if the file does not exist.
pub fn load_optional(path: &Path) -> Result<Option<RawTable>> {
    if !path.exists() {
        warn!(path = %path.display(), "Dataset file not found, domain will have no data");
        return Ok(None);
    }

    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open '{}'", path.display()))?;
    let table =
        parse_table(file).with_context(|| format!("failed to parse '{}'", path.display()))?;
    debug!(path = %path.display(), rows = table.len(), "Dataset loaded");

    Ok(Some(table))
}
