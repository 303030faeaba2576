// Copyright (c) 2026 moldwatch maintainers
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/moldwatch/moldwatch-rs

//! Reliability metrics - OEE and its factors, MTBF, and MTTR
//!
//! Pure functions over ledger rows for a date window. Every factor maps a
//! zero denominator to 0 instead of dividing; external representation is
//! the rounded percentage.

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::ShiftConfig;
use crate::db::{Database, HourEntryRow, StoppageRow};
use crate::ledger::StoppageReason;

/// A resolved shift window; `end_hour <= start_hour` wraps past midnight
#[derive(Debug, Clone, Serialize)]
pub struct ShiftWindow {
    pub name: String,
    pub start_hour: u32,
    pub end_hour: u32,
    pub active: bool,
}

impl ShiftWindow {
    pub fn from_config(shifts: &[ShiftConfig]) -> Result<Vec<ShiftWindow>> {
        shifts
            .iter()
            .map(|s| {
                Ok(ShiftWindow {
                    name: s.name.clone(),
                    start_hour: s.start_hour()?,
                    end_hour: s.end_hour()?,
                    active: s.active,
                })
            })
            .collect()
    }

    /// Whether an hour-of-day falls in this window ([start, end), wrapping)
    pub fn contains(&self, hour: u32) -> bool {
        if self.start_hour < self.end_hour {
            (self.start_hour..self.end_hour).contains(&hour)
        } else if self.start_hour == self.end_hour {
            true
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

/// Named query periods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Last24h,
    Last7d,
    Last30d,
}

impl Period {
    pub fn parse(s: &str) -> Option<Period> {
        match s {
            "24h" | "last24h" => Some(Period::Last24h),
            "7d" | "last7d" => Some(Period::Last7d),
            "30d" | "last30d" => Some(Period::Last30d),
            _ => None,
        }
    }

    pub fn date_range(&self, today: NaiveDate) -> (NaiveDate, NaiveDate) {
        let days = match self {
            Period::Last24h => 1,
            Period::Last7d => 7,
            Period::Last30d => 30,
        };
        (today - chrono::Duration::days(days), today)
    }
}

/// Metrics query: machine, department, or facility-wide, over a named
/// period or an explicit date range
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsQuery {
    pub machine_id: Option<i64>,
    pub department_id: Option<i64>,
    pub period: Option<String>,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    #[serde(default)]
    pub per_shift: bool,
}

/// One computed metrics window
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsReport {
    pub units: i64,
    pub defects: i64,
    pub expected_units: f64,
    pub running_minutes: i64,
    pub stoppage_minutes: i64,
    pub availability: f64,
    pub quality: f64,
    pub performance: f64,
    pub oee: f64,
    pub oee_percent: u32,
    pub breakdown_count: i64,
    pub mtbf: f64,
    pub mttr: f64,
}

/// Per-machine result, optionally broken out by shift
#[derive(Debug, Clone, Serialize)]
pub struct MachineMetrics {
    pub machine_id: i64,
    pub from: NaiveDate,
    pub to: NaiveDate,
    #[serde(flatten)]
    pub report: MetricsReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shifts: Option<Vec<ShiftMetrics>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShiftMetrics {
    pub shift: String,
    #[serde(flatten)]
    pub report: MetricsReport,
}

/// Department or facility aggregate: the average of per-machine OEE
#[derive(Debug, Clone, Serialize)]
pub struct GroupMetrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub department_id: Option<i64>,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub machine_count: usize,
    pub oee: f64,
    pub oee_percent: u32,
    pub machines: Vec<MachineMetrics>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum MetricsResponse {
    Machine(MachineMetrics),
    Group(GroupMetrics),
}

fn ratio(num: f64, den: f64) -> f64 {
    if den > 0.0 {
        num / den
    } else {
        0.0
    }
}

fn expected_units(entry: &HourEntryRow) -> f64 {
    match entry.mold_capacity {
        Some(capacity) => capacity / 60.0 * entry.running_minutes as f64,
        None => 0.0,
    }
}

/// Compute a report from ledger rows
pub fn compute(entries: &[HourEntryRow], stoppages: &[StoppageRow]) -> MetricsReport {
    let units: i64 = entries.iter().map(|e| e.units).sum();
    let defects: i64 = entries.iter().map(|e| e.defects).sum();
    let running_minutes: i64 = entries.iter().map(|e| e.running_minutes).sum();
    let expected: f64 = entries.iter().map(expected_units).sum();

    let stoppage_minutes: i64 = stoppages.iter().map(|s| s.duration_minutes).sum();

    let breakdowns: Vec<&StoppageRow> = stoppages
        .iter()
        .filter(|s| s.reason == StoppageReason::Breakdown.as_str())
        .collect();
    let breakdown_count = breakdowns.len() as i64;
    let breakdown_minutes: i64 = breakdowns.iter().map(|s| s.duration_minutes).sum();

    let availability = ratio(
        running_minutes as f64,
        (running_minutes + stoppage_minutes) as f64,
    );
    let quality = ratio((units - defects) as f64, units as f64);
    let performance = ratio(units as f64, expected);
    let oee = availability * quality * performance;

    MetricsReport {
        units,
        defects,
        expected_units: expected,
        running_minutes,
        stoppage_minutes,
        availability,
        quality,
        performance,
        oee,
        oee_percent: (oee * 100.0).round() as u32,
        breakdown_count,
        mtbf: ratio(running_minutes as f64, breakdown_count as f64),
        mttr: ratio(breakdown_minutes as f64, breakdown_count as f64),
    }
}

/// Computes reliability metrics from the production ledger on demand
pub struct ReliabilityCalculator {
    db: Arc<Database>,
    shifts: Vec<ShiftWindow>,
}

impl ReliabilityCalculator {
    pub fn new(db: Arc<Database>, shifts: Vec<ShiftWindow>) -> Self {
        Self { db, shifts }
    }

    pub fn machine_report(
        &self,
        machine_id: i64,
        from: NaiveDate,
        to: NaiveDate,
        per_shift: bool,
    ) -> Result<MachineMetrics> {
        let entries = self.db.hour_entries_in_range(machine_id, from, to)?;
        let stoppages = self.db.stoppages_in_range(machine_id, from, to)?;

        let shifts = per_shift.then(|| {
            self.shifts
                .iter()
                .filter(|w| w.active)
                .map(|w| {
                    let shift_entries: Vec<HourEntryRow> = entries
                        .iter()
                        .filter(|e| w.contains(e.hour))
                        .cloned()
                        .collect();
                    let shift_stoppages: Vec<StoppageRow> = stoppages
                        .iter()
                        .filter(|s| w.contains(s.hour))
                        .cloned()
                        .collect();
                    ShiftMetrics {
                        shift: w.name.clone(),
                        report: compute(&shift_entries, &shift_stoppages),
                    }
                })
                .collect()
        });

        Ok(MachineMetrics {
            machine_id,
            from,
            to,
            report: compute(&entries, &stoppages),
            shifts,
        })
    }

    fn group_report(
        &self,
        department_id: Option<i64>,
        machine_ids: &[i64],
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<GroupMetrics> {
        let mut machines = Vec::with_capacity(machine_ids.len());
        for &id in machine_ids {
            machines.push(self.machine_report(id, from, to, false)?);
        }

        // Machines with no data contribute 0 to the average
        let oee = if machines.is_empty() {
            0.0
        } else {
            machines.iter().map(|m| m.report.oee).sum::<f64>() / machines.len() as f64
        };

        Ok(GroupMetrics {
            department_id,
            from,
            to,
            machine_count: machines.len(),
            oee,
            oee_percent: (oee * 100.0).round() as u32,
            machines,
        })
    }

    /// Resolve a query into a machine, department, or facility report
    pub fn query(&self, q: &MetricsQuery) -> Result<MetricsResponse> {
        let (from, to) = resolve_range(q)?;

        if let Some(machine_id) = q.machine_id {
            return Ok(MetricsResponse::Machine(self.machine_report(
                machine_id,
                from,
                to,
                q.per_shift,
            )?));
        }

        let machine_ids = match q.department_id {
            Some(dept) => self.db.machine_ids_for_department(dept)?,
            None => self.db.list_machines()?.into_iter().map(|m| m.id).collect(),
        };
        Ok(MetricsResponse::Group(self.group_report(
            q.department_id,
            &machine_ids,
            from,
            to,
        )?))
    }
}

fn resolve_range(q: &MetricsQuery) -> Result<(NaiveDate, NaiveDate)> {
    if let (Some(start), Some(end)) = (q.start, q.end) {
        if end < start {
            anyhow::bail!("end date {} precedes start date {}", end, start);
        }
        return Ok((start, end));
    }
    let period = match &q.period {
        Some(p) => Period::parse(p).ok_or_else(|| anyhow::anyhow!("unknown period '{}'", p))?,
        None => Period::Last24h,
    };
    Ok(period.date_range(Utc::now().date_naive()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn entry(hour: u32, units: i64, defects: i64, running: i64, capacity: Option<f64>) -> HourEntryRow {
        HourEntryRow {
            machine_id: 1,
            day: "2026-08-27".parse().unwrap(),
            hour,
            units,
            defects,
            running_minutes: running,
            status: "running".to_string(),
            operator: None,
            mold_id: capacity.map(|_| 1),
            mold_capacity: capacity,
        }
    }

    fn stoppage(hour: u32, reason: &str, minutes: i64) -> StoppageRow {
        StoppageRow {
            id: format!("s-{}", hour),
            machine_id: 1,
            day: "2026-08-27".parse().unwrap(),
            hour,
            reason: reason.to_string(),
            description: String::new(),
            started_at: Utc.with_ymd_and_hms(2026, 8, 27, hour, 0, 0).unwrap(),
            ended_at: None,
            duration_minutes: minutes,
            pending: false,
            classified: true,
            sap_notification: None,
        }
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-3
    }

    #[test]
    fn test_oee_worked_example() {
        // 50 running minutes, 10 stoppage minutes, 100 units, 5 defects,
        // 90 expected units (capacity 108/h over 50 minutes)
        let entries = [entry(9, 100, 5, 50, Some(108.0))];
        let stoppages = [stoppage(9, "setup", 10)];

        let report = compute(&entries, &stoppages);
        assert!(close(report.availability, 0.833));
        assert!(close(report.quality, 0.95));
        assert!(close(report.performance, 1.111));
        assert!(close(report.oee, 0.879));
        assert_eq!(report.oee_percent, 88);
    }

    #[test]
    fn test_zero_denominators_yield_zero_factors() {
        let report = compute(&[], &[]);
        assert_eq!(report.availability, 0.0);
        assert_eq!(report.quality, 0.0);
        assert_eq!(report.performance, 0.0);
        assert_eq!(report.oee, 0.0);
        assert_eq!(report.oee_percent, 0);

        // Units without an assigned mold: expected is 0, performance is 0
        let report = compute(&[entry(9, 10, 0, 30, None)], &[]);
        assert_eq!(report.performance, 0.0);
        assert_eq!(report.oee, 0.0);
    }

    #[test]
    fn test_mtbf_mttr_zero_without_breakdowns() {
        let entries = [entry(9, 40, 0, 55, Some(60.0))];
        let stoppages = [stoppage(9, "setup", 20)];

        let report = compute(&entries, &stoppages);
        assert_eq!(report.breakdown_count, 0);
        assert_eq!(report.mtbf, 0.0);
        assert_eq!(report.mttr, 0.0);
        assert_eq!(report.stoppage_minutes, 20);
    }

    #[test]
    fn test_mtbf_mttr_over_breakdowns() {
        let entries = [entry(9, 40, 0, 120, Some(60.0))];
        let stoppages = [stoppage(9, "breakdown", 10), stoppage(10, "breakdown", 30)];

        let report = compute(&entries, &stoppages);
        assert_eq!(report.breakdown_count, 2);
        assert!(close(report.mtbf, 60.0));
        assert!(close(report.mttr, 20.0));
    }

    #[test]
    fn test_overnight_shift_window() {
        let night = ShiftWindow {
            name: "night".to_string(),
            start_hour: 22,
            end_hour: 6,
            active: true,
        };
        assert!(night.contains(23));
        assert!(night.contains(3));
        assert!(!night.contains(12));
        assert!(night.contains(22));
        assert!(!night.contains(6));
    }

    #[test]
    fn test_shift_partitioning() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.upsert_machine(1, "press-1", None).unwrap();
        db.upsert_mold(1, "cap-60", 60.0).unwrap();

        let day: NaiveDate = "2026-08-27".parse().unwrap();
        // Activity at 23:00 (night) and 12:00 (afternoon-ish)
        for _ in 0..30 {
            db.increment_units(1, day, 23).unwrap();
            db.increment_units(1, day, 12).unwrap();
        }
        for _ in 0..30 {
            db.add_running_minute(1, day, 23).unwrap();
            db.add_running_minute(1, day, 12).unwrap();
        }
        db.assign_hour(1, day, 23, None, Some(1), None).unwrap();
        db.assign_hour(1, day, 12, None, Some(1), None).unwrap();

        let shifts = vec![ShiftWindow {
            name: "night".to_string(),
            start_hour: 22,
            end_hour: 6,
            active: true,
        }];
        let calc = ReliabilityCalculator::new(db, shifts);
        let result = calc.machine_report(1, day, day, true).unwrap();

        assert_eq!(result.report.units, 60);
        let night = &result.shifts.unwrap()[0];
        // Only the 23:00 hour lands in the night shift
        assert_eq!(night.report.units, 30);
        assert_eq!(night.report.running_minutes, 30);
    }

    #[test]
    fn test_group_average_includes_zero_machines() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.upsert_machine(1, "press-1", Some(7)).unwrap();
        db.upsert_machine(2, "press-2", Some(7)).unwrap();
        db.upsert_mold(1, "cap-60", 60.0).unwrap();

        let day: NaiveDate = "2026-08-27".parse().unwrap();
        for _ in 0..60 {
            db.increment_units(1, day, 9).unwrap();
            db.add_running_minute(1, day, 9).unwrap();
        }
        db.assign_hour(1, day, 9, None, Some(1), None).unwrap();

        let calc = ReliabilityCalculator::new(db, vec![]);
        let q = MetricsQuery {
            machine_id: None,
            department_id: Some(7),
            period: None,
            start: Some(day),
            end: Some(day),
            per_shift: false,
        };

        match calc.query(&q).unwrap() {
            MetricsResponse::Group(group) => {
                assert_eq!(group.machine_count, 2);
                // Machine 1 has OEE 1.0, machine 2 contributes 0
                assert!(close(group.oee, 0.5));
                assert_eq!(group.oee_percent, 50);
            }
            _ => panic!("expected group response"),
        }
    }

    #[test]
    fn test_named_periods() {
        let today: NaiveDate = "2026-08-27".parse().unwrap();
        assert_eq!(
            Period::Last24h.date_range(today),
            ("2026-08-26".parse().unwrap(), today)
        );
        assert_eq!(
            Period::Last7d.date_range(today),
            ("2026-08-20".parse().unwrap(), today)
        );
        assert!(Period::parse("90d").is_none());
    }
}
