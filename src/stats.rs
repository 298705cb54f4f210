use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

use crate::analyzers::normalize::{TicketStatus, cell, parse_date, parse_number, parse_status};
use crate::analyzers::types::{Event, Severity, ZoneSnapshot};
use crate::analyzers::utility::mean;
use crate::parser::RawTable;

/// Grid voltage below which a period counts as a voltage issue.
pub const LOW_VOLTAGE: f64 = 220.0;

/// City-wide KPIs over a set of snapshots.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct CityStats {
    pub zones: usize,
    pub snapshots: usize,

    // energy
    pub avg_energy_kwh: Option<f64>,
    pub power_cut_hours: u64,
    pub power_cut_pct: f64,
    pub low_voltage_periods: usize,

    // traffic
    pub avg_congestion: Option<f64>,
    pub peak_congestion: Option<f64>,
    pub flow_efficiency: Option<f64>,

    // waste
    pub avg_bin_fill_pct: Option<f64>,
    pub missed_pickups: u64,
    pub avg_segregation_pct: Option<f64>,

    // grievances
    pub total_grievances: u64,
    pub open_grievances: u64,
    pub resolved_grievances: u64,
    pub resolution_rate_pct: f64,
    /// Open tickets with at most one SLA day left.
    pub critical_issues: u64,

    pub critical_events: usize,
}

fn average(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| mean(values))
}

impl CityStats {
    /// `congestion_max` is the upper bound of the declared congestion
    /// domain, used to express flow efficiency as `1 - avg / max`.
    pub fn from_snapshots(snapshots: &[ZoneSnapshot], events: &[Event], congestion_max: f64) -> Self {
        let mut s = CityStats {
            snapshots: snapshots.len(),
            ..Default::default()
        };

        let mut zones: Vec<&str> = snapshots.iter().map(|z| z.zone_id.as_str()).collect();
        zones.sort_unstable();
        zones.dedup();
        s.zones = zones.len();

        let collect = |f: fn(&ZoneSnapshot) -> Option<f64>| -> Vec<f64> {
            snapshots.iter().filter_map(f).collect()
        };

        let energy = collect(|z| z.energy_kwh);
        s.avg_energy_kwh = average(&energy);

        let mut energy_periods = 0;
        let mut cut_periods = 0;
        // Waste and grievance data is per day; hourly snapshots repeat it.
        let mut days_seen = HashSet::new();
        let mut bin_fill = Vec::new();
        let mut segregation = Vec::new();
        for z in snapshots {
            if let Some(hours) = z.power_cut_hours {
                energy_periods += 1;
                s.power_cut_hours = s.power_cut_hours.saturating_add(u64::from(hours));
                if hours > 0 {
                    cut_periods += 1;
                }
            }

            if z.min_grid_voltage.is_some_and(|v| v < LOW_VOLTAGE) {
                s.low_voltage_periods += 1;
            }

            if !days_seen.insert((z.zone_id.as_str(), z.period.date)) {
                continue;
            }

            let add = |total: &mut u64, n: Option<u32>| {
                *total = total.saturating_add(u64::from(n.unwrap_or(0)));
            };
            add(&mut s.missed_pickups, z.missed_pickups);
            add(&mut s.total_grievances, z.total_grievance_count);
            add(&mut s.open_grievances, z.open_grievance_count);
            add(&mut s.resolved_grievances, z.resolved_grievance_count);
            add(&mut s.critical_issues, z.critical_grievance_count);
            bin_fill.extend(z.bin_fill_pct);
            segregation.extend(z.segregation_pct);
        }
        s.power_cut_pct = Self::pct(cut_periods, energy_periods);

        let congestion = collect(|z| z.congestion_index);
        s.avg_congestion = average(&congestion);
        s.peak_congestion = collect(|z| z.peak_congestion_index.or(z.congestion_index))
            .into_iter()
            .reduce(f64::max);
        if congestion_max > 0.0 {
            s.flow_efficiency = s.avg_congestion.map(|c| 1.0 - c / congestion_max);
        }

        s.avg_bin_fill_pct = average(&bin_fill);
        s.avg_segregation_pct = average(&segregation);

        s.resolution_rate_pct = Self::ratio_pct(s.resolved_grievances, s.total_grievances);

        s.critical_events = events
            .iter()
            .filter(|e| e.severity == Severity::Critical)
            .count();

        s
    }

    pub fn pct(part: usize, total: usize) -> f64 {
        if total == 0 {
            0.0
        } else {
            (part as f64 / total as f64) * 100.0
        }
    }

    fn ratio_pct(part: u64, total: u64) -> f64 {
        if total == 0 {
            0.0
        } else {
            (part as f64 / total as f64) * 100.0
        }
    }
}

/// Ticket volume and turnaround for one department.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DepartmentStats {
    pub department: String,
    pub tickets: u64,
    pub resolved: u64,
    pub resolution_rate_pct: f64,
    /// Mean `SLA_Days` over tickets with a parseable value.
    pub avg_sla_days: Option<f64>,
}

/// Rolls the grievance table up per `Department`, sorted by name.
///
/// `keep` receives each row's zone and date. Rows with a bad date, no zone
/// or no department are skipped. Tables without `Department` or `Status`
/// yield nothing.
pub fn department_stats(table: &RawTable, keep: impl Fn(&str, NaiveDate) -> bool) -> Vec<DepartmentStats> {
    let (Some(dept_idx), Some(status_idx), Some(date_idx), Some(zone_idx)) = (
        table.column_index("Department"),
        table.column_index("Status"),
        table.column_index("Date"),
        table.column_index("Zone_Name"),
    ) else {
        return Vec::new();
    };
    let sla_idx = table.column_index("SLA_Days");

    let mut by_dept: BTreeMap<&str, (DepartmentStats, Vec<f64>)> = BTreeMap::new();
    for row in &table.rows {
        let zone = cell(row, zone_idx).trim();
        let department = cell(row, dept_idx).trim();
        let Some(date) = parse_date(cell(row, date_idx)) else {
            continue;
        };
        if zone.is_empty() || department.is_empty() || !keep(zone, date) {
            continue;
        }

        let (stats, sla) = by_dept.entry(department).or_default();
        stats.tickets += 1;
        if parse_status(cell(row, status_idx)) == TicketStatus::Resolved {
            stats.resolved += 1;
        }
        sla.extend(sla_idx.and_then(|i| parse_number(cell(row, i))));
    }

    by_dept
        .into_iter()
        .map(|(department, (stats, sla))| DepartmentStats {
            department: department.to_string(),
            resolution_rate_pct: CityStats::ratio_pct(stats.resolved, stats.tickets),
            avg_sla_days: average(&sla),
            ..stats
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzers::types::Period;
    use chrono::NaiveDate;

    #[test]
    fn test_pct_with_zero_total() {
        assert_eq!(CityStats::pct(10, 0), 0.0);
    }

    #[test]
    fn test_pct_normal_values() {
        assert_eq!(CityStats::pct(50, 100), 50.0);
        assert_eq!(CityStats::pct(1, 4), 25.0);
    }

    #[test]
    fn test_from_snapshots_empty() {
        let stats = CityStats::from_snapshots(&[], &[], 1.0);

        assert_eq!(stats.zones, 0);
        assert_eq!(stats.avg_congestion, None);
        assert_eq!(stats.flow_efficiency, None);
        assert_eq!(stats.resolution_rate_pct, 0.0);
    }

    #[test]
    fn test_missing_domains_stay_null() {
        let snapshots = vec![create_snapshot("A", 1, |z| z.congestion_index = Some(0.4))];
        let stats = CityStats::from_snapshots(&snapshots, &[], 1.0);

        assert_eq!(stats.avg_congestion, Some(0.4));
        assert_eq!(stats.avg_energy_kwh, None);
        assert_eq!(stats.avg_bin_fill_pct, None);
    }

    #[test]
    fn test_city_kpis() {
        let snapshots = vec![
            create_snapshot("A", 1, |z| {
                z.congestion_index = Some(0.6);
                z.peak_congestion_index = Some(0.9);
                z.power_cut_hours = Some(2);
                z.min_grid_voltage = Some(210.0);
                z.missed_pickups = Some(3);
                z.total_grievance_count = Some(4);
                z.open_grievance_count = Some(1);
                z.resolved_grievance_count = Some(3);
            }),
            create_snapshot("B", 1, |z| {
                z.congestion_index = Some(0.2);
                z.power_cut_hours = Some(0);
                z.min_grid_voltage = Some(228.0);
                z.missed_pickups = Some(1);
            }),
        ];
        let stats = CityStats::from_snapshots(&snapshots, &[], 1.0);

        assert_eq!(stats.zones, 2);
        assert!((stats.avg_congestion.unwrap() - 0.4).abs() < 1e-12);
        assert_eq!(stats.peak_congestion, Some(0.9));
        assert!((stats.flow_efficiency.unwrap() - 0.6).abs() < 1e-12);
        assert_eq!(stats.power_cut_hours, 2);
        assert_eq!(stats.power_cut_pct, 50.0);
        assert_eq!(stats.low_voltage_periods, 1);
        assert_eq!(stats.missed_pickups, 4);
        assert_eq!(stats.open_grievances, 1);
        assert_eq!(stats.resolution_rate_pct, 75.0);
        assert_eq!(stats.critical_issues, 0);
    }

    #[test]
    fn test_large_counts_do_not_overflow() {
        let snapshots = vec![
            create_snapshot("A", 1, |z| z.missed_pickups = Some(u32::MAX)),
            create_snapshot("B", 1, |z| z.missed_pickups = Some(u32::MAX)),
        ];
        let stats = CityStats::from_snapshots(&snapshots, &[], 1.0);

        assert_eq!(stats.missed_pickups, 2 * u64::from(u32::MAX));
    }

    #[test]
    fn test_hourly_snapshots_count_day_data_once() {
        let snapshots: Vec<ZoneSnapshot> = [(8, 0.4), (9, 0.6)]
            .into_iter()
            .map(|(hour, congestion)| {
                let mut z = create_snapshot("A", 1, |z| {
                    z.congestion_index = Some(congestion);
                    z.missed_pickups = Some(3);
                    z.total_grievance_count = Some(2);
                    z.critical_grievance_count = Some(1);
                });
                z.period = Period::hourly(z.period.date, hour);
                z
            })
            .collect();
        let stats = CityStats::from_snapshots(&snapshots, &[], 1.0);

        assert_eq!(stats.missed_pickups, 3);
        assert_eq!(stats.total_grievances, 2);
        assert_eq!(stats.critical_issues, 1);
        assert!((stats.avg_congestion.unwrap() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_department_stats() {
        let table = RawTable::new(
            &["Date", "Zone_Name", "Ticket_ID", "Department", "Issue_Type", "Status", "SLA_Days"],
            vec![
                vec!["2024-01-01", "A", "T1", "Roads", "Potholes", "Resolved", "2"],
                vec!["2024-01-01", "A", "T2", "Roads", "Potholes", "Open", "4"],
                vec!["2024-01-02", "B", "T3", "Water", "Leak", "Closed", ""],
                vec!["2024-01-02", "B", "T4", "Water", "Leak", "Open", "1"],
                vec!["2024-01-02", "B", "T5", "Water", "Leak", "Open", "3"],
                vec!["bad-date", "B", "T6", "Water", "Leak", "Open", "3"],
            ],
        );
        let stats = department_stats(&table, |_, _| true);

        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].department, "Roads");
        assert_eq!(stats[0].tickets, 2);
        assert_eq!(stats[0].resolution_rate_pct, 50.0);
        assert_eq!(stats[0].avg_sla_days, Some(3.0));

        assert_eq!(stats[1].department, "Water");
        assert_eq!(stats[1].tickets, 3);
        assert_eq!(stats[1].resolved, 1);
        assert_eq!(stats[1].avg_sla_days, Some(2.0));

        let only_a = department_stats(&table, |zone, _| zone == "A");
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].department, "Roads");
    }

    #[test]
    fn test_department_stats_without_department_column() {
        let table = RawTable::new(
            &["Date", "Zone_Name", "Status", "SLA_Days"],
            vec![vec!["2024-01-01", "A", "Open", "2"]],
        );
        assert!(department_stats(&table, |_, _| true).is_empty());
    }

    // Helper functions for tests
    fn create_snapshot(zone: &str, day: u32, f: impl FnOnce(&mut ZoneSnapshot)) -> ZoneSnapshot {
        let mut z = ZoneSnapshot {
            zone_id: zone.to_string(),
            period: Period::day(NaiveDate::from_ymd_opt(2024, 1, day).unwrap()),
            ..Default::default()
        };
        f(&mut z);
        z
    }
}
