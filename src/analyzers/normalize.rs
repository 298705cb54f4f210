//! Dataset normalization: raw tables in, typed per-zone snapshots out.
//!
//! Each table is validated against the columns it must carry, rows are
//! typed into [`ZoneMetricRecord`]s and the records are outer-joined on
//! `(zone_id, period)` into [`ZoneSnapshot`]s. Row-level problems are
//! counted, never fatal.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

use crate::analyzers::types::{Domain, Period, RecordFlag, ZoneMetricRecord, ZoneSnapshot};
use crate::analyzers::utility::mean;
use crate::error::{ConfigError, SchemaError};
use crate::parser::{RawTable, RawTables};

const DATE: &str = "Date";
const HOUR: &str = "Hour";
const ZONE: &str = "Zone_Name";
const STATUS: &str = "Status";
const SLA_DAYS: &str = "SLA_Days";

/// Open tickets with at most this many SLA days left are critical.
pub const CRITICAL_SLA_DAYS: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Daily,
    Hourly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    /// Declared `[low, high]` domain of the congestion index.
    pub congestion_domain: [f64; 2],
    pub granularity: Granularity,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            congestion_domain: [0.0, 1.0],
            granularity: Granularity::Daily,
        }
    }
}

impl NormalizerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let [low, high] = self.congestion_domain;
        if !(low.is_finite() && high.is_finite() && low < high) {
            return Err(ConfigError::InvalidThreshold {
                name: "normalizer.congestion_domain".into(),
                reason: format!("expected low < high, got [{low}, {high}]"),
            });
        }
        Ok(())
    }
}

/// Row-level bookkeeping for one table.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TableDiagnostics {
    pub rows: usize,
    pub dropped_bad_timestamp: usize,
    pub dropped_missing_zone: usize,
    pub unparseable_values: usize,
    pub out_of_range: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NormalizeDiagnostics {
    pub tables: BTreeMap<Domain, TableDiagnostics>,
    pub missing_tables: Vec<Domain>,
    #[serde(serialize_with = "serialize_schema_errors")]
    pub schema_errors: Vec<SchemaError>,
}

fn serialize_schema_errors<S: serde::Serializer>(
    errors: &[SchemaError],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(errors.iter().map(ToString::to_string))
}

#[derive(Debug, Clone, Default)]
pub struct Normalized {
    pub snapshots: Vec<ZoneSnapshot>,
    pub diagnostics: NormalizeDiagnostics,
}

#[derive(Debug, Clone, Copy)]
enum ValueKind {
    Number,
    Flag,
}

/// A numeric input column and the metric it feeds.
struct MetricColumn {
    column: &'static str,
    metric: &'static str,
    unit: &'static str,
    bounds: (f64, f64),
    kind: ValueKind,
}

const fn number(column: &'static str, metric: &'static str, unit: &'static str, bounds: (f64, f64)) -> MetricColumn {
    MetricColumn {
        column,
        metric,
        unit,
        bounds,
        kind: ValueKind::Number,
    }
}

const NON_NEGATIVE: (f64, f64) = (0.0, f64::INFINITY);
const PERCENT: (f64, f64) = (0.0, 100.0);
/// Per-row event counts above this are treated as data errors.
const COUNT: (f64, f64) = (0.0, 10_000.0);

fn metric_columns(domain: Domain, config: &NormalizerConfig) -> Vec<MetricColumn> {
    let [c_low, c_high] = config.congestion_domain;
    match domain {
        Domain::Traffic => vec![
            number("Vehicle_Volume", "vehicle_volume", "vehicles", NON_NEGATIVE),
            number("Avg_Speed_Kmph", "avg_speed", "km/h", NON_NEGATIVE),
            number("Congestion_Index", "congestion_index", "index", (c_low, c_high)),
        ],
        Domain::Energy => vec![
            number("Energy_Consumption_kWh", "energy_kwh", "kWh", NON_NEGATIVE),
            number("Grid_Voltage", "grid_voltage", "V", NON_NEGATIVE),
            MetricColumn {
                column: "Power_Cut_Flag",
                metric: "power_cut_flag",
                unit: "flag",
                bounds: (0.0, 1.0),
                kind: ValueKind::Flag,
            },
        ],
        Domain::Waste => vec![
            number("Total_Waste_Collected_Kg", "waste_kg", "kg", NON_NEGATIVE),
            number("Avg_Bin_Fill_Level_Percent", "bin_fill_pct", "%", PERCENT),
            number("Segregation_Efficiency_Percent", "segregation_pct", "%", PERCENT),
            number("Missed_Pickups", "missed_pickups", "count", COUNT),
        ],
        Domain::Grievance => vec![number(SLA_DAYS, "sla_days", "days", NON_NEGATIVE)],
    }
}

fn has_hour(domain: Domain) -> bool {
    matches!(domain, Domain::Traffic | Domain::Energy)
}

/// Columns the normalizer reads. Identifier columns (`Ticket_ID`,
/// `Department`, `Issue_Type`, `Feeder_ID`, `Junction_ID`) are optional.
fn required_columns(domain: Domain, config: &NormalizerConfig) -> Vec<&'static str> {
    let mut columns = vec![DATE, ZONE];
    if config.granularity == Granularity::Hourly && has_hour(domain) {
        columns.push(HOUR);
    }
    if domain == Domain::Grievance {
        columns.push(STATUS);
    }
    columns.extend(metric_columns(domain, config).iter().map(|m| m.column));
    columns
}

/// Parses the calendar-date part of a date or datetime cell.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%d-%m-%Y", "%m/%d/%Y"];
    const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];

    DATE_FORMATS
        .iter()
        .find_map(|f| NaiveDate::parse_from_str(raw, f).ok())
        .or_else(|| {
            DATETIME_FORMATS
                .iter()
                .find_map(|f| NaiveDateTime::parse_from_str(raw, f).ok())
                .map(|dt| dt.date())
        })
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.date_naive()))
}

pub(crate) fn parse_hour(raw: &str) -> Option<u8> {
    let raw = raw.trim();
    let hour = raw
        .parse::<u8>()
        .ok()
        .or_else(|| raw.parse::<f64>().ok().filter(|h| h.fract() == 0.0 && *h >= 0.0).map(|h| h as u8))?;
    (hour < 24).then_some(hour)
}

fn parse_value(raw: &str, kind: ValueKind) -> Option<f64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let ValueKind::Flag = kind {
        match raw.to_ascii_lowercase().as_str() {
            "true" | "yes" | "y" => return Some(1.0),
            "false" | "no" | "n" => return Some(0.0),
            _ => {}
        }
    }
    raw.parse::<f64>().ok().filter(|v| v.is_finite())
}

pub(crate) fn parse_number(raw: &str) -> Option<f64> {
    parse_value(raw, ValueKind::Number)
}

fn range_flag(value: f64, bounds: (f64, f64)) -> Option<RecordFlag> {
    (value < bounds.0 || value > bounds.1).then_some(RecordFlag::OutOfRange)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TicketStatus {
    Open,
    Resolved,
    Other,
}

pub(crate) fn parse_status(raw: &str) -> TicketStatus {
    match raw.trim().to_ascii_lowercase().as_str() {
        "open" => TicketStatus::Open,
        "resolved" | "closed" => TicketStatus::Resolved,
        _ => TicketStatus::Other,
    }
}

pub(crate) fn cell<'a>(row: &'a [String], idx: usize) -> &'a str {
    row.get(idx).map(String::as_str).unwrap_or("")
}

/// Validates one table and types its rows into records.
///
/// # Errors
///
/// Returns [`SchemaError`] naming the first required column that is absent.
pub fn normalize_table(
    domain: Domain,
    table: &RawTable,
    config: &NormalizerConfig,
) -> Result<(Vec<ZoneMetricRecord>, TableDiagnostics), SchemaError> {
    for column in required_columns(domain, config) {
        if table.column_index(column).is_none() {
            return Err(SchemaError {
                domain,
                column: column.to_string(),
            });
        }
    }

    let column = |name: &str| table.column_index(name);
    let date_idx = column(DATE).unwrap_or_default();
    let zone_idx = column(ZONE).unwrap_or_default();
    let hour_idx = match config.granularity {
        Granularity::Hourly if has_hour(domain) => column(HOUR),
        _ => None,
    };
    let status_idx = match domain {
        Domain::Grievance => column(STATUS),
        _ => None,
    };
    let sla_idx = column(SLA_DAYS);
    let metrics: Vec<(usize, MetricColumn)> = metric_columns(domain, config)
        .into_iter()
        .filter_map(|m| column(m.column).map(|idx| (idx, m)))
        .collect();

    let mut diag = TableDiagnostics {
        rows: table.len(),
        ..Default::default()
    };
    let mut records = Vec::new();

    for row in &table.rows {
        let Some(date) = parse_date(cell(row, date_idx)) else {
            diag.dropped_bad_timestamp += 1;
            continue;
        };
        let period = match hour_idx {
            Some(idx) => match parse_hour(cell(row, idx)) {
                Some(hour) => Period::hourly(date, hour),
                None => {
                    diag.dropped_bad_timestamp += 1;
                    continue;
                }
            },
            None => Period::day(date),
        };

        let zone = cell(row, zone_idx).trim();
        if zone.is_empty() {
            diag.dropped_missing_zone += 1;
            continue;
        }

        let mut push = |metric: &'static str, value: f64, unit: &'static str, flag| {
            records.push(ZoneMetricRecord {
                zone_id: zone.to_string(),
                period,
                domain,
                metric_name: metric,
                value,
                unit,
                flag,
            });
        };

        if let Some(idx) = status_idx {
            let status = parse_status(cell(row, idx));
            push("ticket", 1.0, "ticket", None);
            push("ticket_open", f64::from(u8::from(status == TicketStatus::Open)), "ticket", None);
            push(
                "ticket_resolved",
                f64::from(u8::from(status == TicketStatus::Resolved)),
                "ticket",
                None,
            );
            let open_sla = sla_idx.and_then(|i| parse_number(cell(row, i)));
            if let (TicketStatus::Open, Some(sla)) = (status, open_sla) {
                push("open_sla_days", sla, "days", range_flag(sla, NON_NEGATIVE));
                if sla <= CRITICAL_SLA_DAYS {
                    push("ticket_critical", 1.0, "ticket", None);
                }
            }
        }

        for (idx, column_def) in &metrics {
            let Some(value) = parse_value(cell(row, *idx), column_def.kind) else {
                diag.unparseable_values += 1;
                continue;
            };
            let flag = range_flag(value, column_def.bounds);
            if flag.is_some() {
                diag.out_of_range += 1;
            }
            push(column_def.metric, value, column_def.unit, flag);
        }
    }

    debug!(
        domain = %domain,
        rows = diag.rows,
        records = records.len(),
        dropped_bad_timestamp = diag.dropped_bad_timestamp,
        dropped_missing_zone = diag.dropped_missing_zone,
        out_of_range = diag.out_of_range,
        "Table normalized"
    );

    Ok((records, diag))
}

#[derive(Default)]
struct Accumulator {
    congestion: Vec<f64>,
    speed: Vec<f64>,
    volume: Vec<f64>,
    energy: Vec<f64>,
    voltage: Vec<f64>,
    power_cut: Vec<f64>,
    waste: Vec<f64>,
    bin_fill: Vec<f64>,
    segregation: Vec<f64>,
    missed: Vec<f64>,
    tickets: Vec<f64>,
    open: Vec<f64>,
    resolved: Vec<f64>,
    critical: Vec<f64>,
    sla: Vec<f64>,
    open_sla: Vec<f64>,
    out_of_range: BTreeSet<String>,
}

fn bounded(value: f64, bounds: (f64, f64)) -> f64 {
    value.clamp(bounds.0, bounds.1)
}

fn avg(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| mean(values))
}

fn sum(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum())
}

fn count(values: &[f64]) -> Option<u32> {
    sum(values).map(|s| s.round().clamp(0.0, f64::from(u32::MAX)) as u32)
}

fn min(values: &[f64]) -> Option<f64> {
    values.iter().copied().reduce(f64::min)
}

fn max(values: &[f64]) -> Option<f64> {
    values.iter().copied().reduce(f64::max)
}

/// Snapshot metrics derived from a record metric.
fn derived_metrics(record_metric: &str) -> &'static [&'static str] {
    match record_metric {
        "congestion_index" => &["congestion_index", "peak_congestion_index"],
        "avg_speed" => &["avg_speed"],
        "vehicle_volume" => &["vehicle_volume"],
        "energy_kwh" => &["energy_kwh"],
        "grid_voltage" => &["grid_voltage", "min_grid_voltage"],
        "power_cut_flag" => &["power_cut_flag", "power_cut_hours"],
        "waste_kg" => &["waste_kg"],
        "bin_fill_pct" => &["bin_fill_pct"],
        "segregation_pct" => &["segregation_pct"],
        "missed_pickups" => &["missed_pickups"],
        "sla_days" => &["avg_sla_days"],
        "open_sla_days" => &["min_open_sla_days"],
        _ => &[],
    }
}

impl Accumulator {
    fn push(&mut self, record: &ZoneMetricRecord, config: &NormalizerConfig) {
        if record.flag == Some(RecordFlag::OutOfRange) {
            let derived = derived_metrics(record.metric_name);
            self.out_of_range.extend(derived.iter().map(|m| m.to_string()));
        }

        let [c_low, c_high] = config.congestion_domain;
        let v = record.value;
        match record.metric_name {
            "congestion_index" => self.congestion.push(bounded(v, (c_low, c_high))),
            "avg_speed" => self.speed.push(bounded(v, NON_NEGATIVE)),
            "vehicle_volume" => self.volume.push(bounded(v, NON_NEGATIVE)),
            "energy_kwh" => self.energy.push(bounded(v, NON_NEGATIVE)),
            "grid_voltage" => self.voltage.push(bounded(v, NON_NEGATIVE)),
            "power_cut_flag" => self.power_cut.push(if v > 0.5 { 1.0 } else { 0.0 }),
            "waste_kg" => self.waste.push(bounded(v, NON_NEGATIVE)),
            "bin_fill_pct" => self.bin_fill.push(bounded(v, PERCENT)),
            "segregation_pct" => self.segregation.push(bounded(v, PERCENT)),
            "missed_pickups" => self.missed.push(bounded(v, COUNT)),
            "ticket" => self.tickets.push(v),
            "ticket_open" => self.open.push(v),
            "ticket_resolved" => self.resolved.push(v),
            "ticket_critical" => self.critical.push(v),
            "sla_days" => self.sla.push(bounded(v, NON_NEGATIVE)),
            "open_sla_days" => self.open_sla.push(bounded(v, NON_NEGATIVE)),
            _ => {}
        }
    }

    fn finish(self, zone_id: String, period: Period) -> ZoneSnapshot {
        let has_power_data = !self.power_cut.is_empty();
        let has_tickets = !self.tickets.is_empty();

        ZoneSnapshot {
            zone_id,
            period,
            congestion_index: avg(&self.congestion),
            peak_congestion_index: max(&self.congestion),
            avg_speed: avg(&self.speed),
            vehicle_volume: sum(&self.volume),
            energy_kwh: sum(&self.energy),
            grid_voltage: avg(&self.voltage),
            min_grid_voltage: min(&self.voltage),
            power_cut_flag: has_power_data.then(|| self.power_cut.iter().any(|f| *f > 0.0)),
            power_cut_hours: count(&self.power_cut),
            waste_kg: sum(&self.waste),
            bin_fill_pct: avg(&self.bin_fill),
            segregation_pct: avg(&self.segregation),
            missed_pickups: count(&self.missed),
            open_grievance_count: has_tickets.then(|| count(&self.open).unwrap_or(0)),
            total_grievance_count: count(&self.tickets),
            resolved_grievance_count: has_tickets.then(|| count(&self.resolved).unwrap_or(0)),
            critical_grievance_count: has_tickets.then(|| count(&self.critical).unwrap_or(0)),
            avg_sla_days: avg(&self.sla),
            min_open_sla_days: min(&self.open_sla),
            out_of_range: self.out_of_range,
        }
    }
}

/// Outer-joins records on `(zone_id, period)`. Output is sorted by zone,
/// then period.
///
/// In hourly mode a day-level record (waste, grievances) is joined into
/// every hour of the same zone and date. It keeps its own day period only
/// when that zone has no hourly data on that date.
pub fn build_snapshots(records: &[ZoneMetricRecord], config: &NormalizerConfig) -> Vec<ZoneSnapshot> {
    let mut groups: BTreeMap<(String, Period), Accumulator> = BTreeMap::new();
    let mut day_level = Vec::new();

    for record in records {
        if config.granularity == Granularity::Hourly && record.period.hour.is_none() {
            day_level.push(record);
            continue;
        }
        groups
            .entry((record.zone_id.clone(), record.period))
            .or_default()
            .push(record, config);
    }

    let mut unjoined = 0;
    for record in day_level {
        let date = record.period.date;
        let first = (record.zone_id.clone(), Period::hourly(date, 0));
        let last = (record.zone_id.clone(), Period::hourly(date, 23));

        let mut joined = false;
        for (_, acc) in groups.range_mut(first..=last) {
            acc.push(record, config);
            joined = true;
        }
        if !joined {
            unjoined += 1;
            groups
                .entry((record.zone_id.clone(), record.period))
                .or_default()
                .push(record, config);
        }
    }
    if unjoined > 0 {
        debug!(records = unjoined, "Day-level records without hourly data kept as day periods");
    }

    groups
        .into_iter()
        .map(|((zone_id, period), acc)| acc.finish(zone_id, period))
        .collect()
}

/// Normalizes all four tables into snapshots.
///
/// A table with a missing column is reported in the diagnostics and
/// skipped; the remaining tables still contribute.
#[tracing::instrument(skip_all)]
pub fn normalize(tables: &RawTables, config: &NormalizerConfig) -> Normalized {
    let mut diagnostics = NormalizeDiagnostics::default();
    let mut records = Vec::new();

    for domain in Domain::ALL {
        let Some(table) = tables.get(domain) else {
            diagnostics.missing_tables.push(domain);
            continue;
        };

        match normalize_table(domain, table, config) {
            Ok((mut table_records, diag)) => {
                if diag.dropped_bad_timestamp + diag.dropped_missing_zone > 0 {
                    warn!(
                        domain = %domain,
                        dropped_bad_timestamp = diag.dropped_bad_timestamp,
                        dropped_missing_zone = diag.dropped_missing_zone,
                        "Rows dropped during normalization"
                    );
                }
                records.append(&mut table_records);
                diagnostics.tables.insert(domain, diag);
            }
            Err(e) => {
                warn!(error = %e, "Skipping table with invalid schema");
                diagnostics.schema_errors.push(e);
            }
        }
    }

    let snapshots = build_snapshots(&records, config);
    debug!(
        records = records.len(),
        snapshots = snapshots.len(),
        "Snapshots built"
    );

    Normalized {
        snapshots,
        diagnostics,
    }
}
