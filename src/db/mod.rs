// Copyright (c) 2026 moldwatch maintainers
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/moldwatch/moldwatch-rs

//! Database module for persistent storage
//!
//! The production ledger is keyed (machine, UTC day, hour). Ingest and the
//! periodic tick both read-modify-write the same hour rows, so every counter
//! mutation is a single conditional upsert rather than a read-then-write.

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::config::DatabaseConfig;
use crate::signals::{MappingSource, SensorInfo, SensorKind, SignalRow, TimeoutOverrides};

/// Database manager
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

/// A machine as registered by the back office
#[derive(Debug, Clone)]
pub struct MachineRow {
    pub id: i64,
    pub name: String,
    pub department_id: Option<i64>,
}

/// One production-ledger hour slot
#[derive(Debug, Clone)]
pub struct HourEntryRow {
    pub machine_id: i64,
    pub day: NaiveDate,
    pub hour: u32,
    pub units: i64,
    pub defects: i64,
    pub running_minutes: i64,
    pub status: String,
    pub operator: Option<String>,
    pub mold_id: Option<i64>,
    /// Hourly capacity of the assigned mold, when one is assigned
    pub mold_capacity: Option<f64>,
}

/// A stoppage episode row
#[derive(Debug, Clone)]
pub struct StoppageRow {
    pub id: String,
    pub machine_id: i64,
    pub day: NaiveDate,
    pub hour: u32,
    pub reason: String,
    pub description: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_minutes: i64,
    pub pending: bool,
    pub classified: bool,
    pub sap_notification: Option<String>,
}

impl Database {
    /// Open or create database
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        // Create parent directories
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&config.path)?;

        // Configure SQLite for performance
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -64000;
            PRAGMA temp_store = MEMORY;
        "#,
        )?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.create_tables()?;

        info!("Database opened at {:?}", config.path);
        Ok(db)
    }

    /// In-memory database for tests and demo mode
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.create_tables()?;
        Ok(db)
    }

    /// Create database tables
    fn create_tables(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute_batch(
            r#"
            -- Organizational inventory, maintained by the back office.
            -- The core only reads these.
            CREATE TABLE IF NOT EXISTS machines (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                department_id INTEGER
            );

            CREATE TABLE IF NOT EXISTS sensors (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                machine_id INTEGER NOT NULL REFERENCES machines(id)
            );

            CREATE TABLE IF NOT EXISTS pin_mappings (
                pin_id TEXT PRIMARY KEY,
                sensor_id INTEGER NOT NULL UNIQUE REFERENCES sensors(id)
            );

            CREATE TABLE IF NOT EXISTS molds (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                capacity_per_hour REAL NOT NULL
            );

            -- Production ledger
            CREATE TABLE IF NOT EXISTS hour_entries (
                machine_id INTEGER NOT NULL,
                day TEXT NOT NULL,
                hour INTEGER NOT NULL,
                units INTEGER NOT NULL DEFAULT 0,
                defects INTEGER NOT NULL DEFAULT 0,
                running_minutes INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'inactive',
                operator TEXT,
                mold_id INTEGER,
                PRIMARY KEY (machine_id, day, hour)
            );

            -- Daily rollups, always recomputed from hour_entries
            CREATE TABLE IF NOT EXISTS production_days (
                machine_id INTEGER NOT NULL,
                day TEXT NOT NULL,
                total_units INTEGER NOT NULL DEFAULT 0,
                total_defects INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (machine_id, day)
            );

            CREATE TABLE IF NOT EXISTS stoppages (
                id TEXT PRIMARY KEY,
                machine_id INTEGER NOT NULL,
                day TEXT NOT NULL,
                hour INTEGER NOT NULL,
                reason TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                started_at TEXT NOT NULL,
                ended_at TEXT,
                duration_minutes INTEGER NOT NULL DEFAULT 0,
                pending INTEGER NOT NULL DEFAULT 0,
                classified INTEGER NOT NULL DEFAULT 0,
                sap_notification TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_stoppages_slot ON stoppages(machine_id, day, hour);

            -- Raw per-pin signal values, used for restart rehydration
            CREATE TABLE IF NOT EXISTS signal_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pin_id TEXT NOT NULL,
                sensor_id INTEGER NOT NULL,
                machine_id INTEGER NOT NULL,
                kind TEXT NOT NULL,
                value INTEGER NOT NULL,
                at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_signal_log_machine ON signal_log(machine_id, kind, at);

            CREATE TABLE IF NOT EXISTS machine_status (
                machine_id INTEGER PRIMARY KEY,
                status TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
        "#,
        )?;

        Ok(())
    }

    // ----- hour entries -----

    /// Add one produced unit to the (machine, day, hour) slot, creating it
    /// if needed, and mark the hour running. Returns the new unit count.
    pub fn increment_units(&self, machine_id: i64, day: NaiveDate, hour: u32) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let units = conn.query_row(
            r#"INSERT INTO hour_entries (machine_id, day, hour, units, status)
               VALUES (?1, ?2, ?3, 1, 'running')
               ON CONFLICT(machine_id, day, hour)
               DO UPDATE SET units = units + 1, status = 'running'
               RETURNING units"#,
            params![machine_id, day.to_string(), hour],
            |row| row.get(0),
        )?;
        Ok(units)
    }

    /// Add one running minute to the slot, capped at 60. Returns the new value.
    pub fn add_running_minute(&self, machine_id: i64, day: NaiveDate, hour: u32) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let minutes = conn.query_row(
            r#"INSERT INTO hour_entries (machine_id, day, hour, running_minutes, status)
               VALUES (?1, ?2, ?3, 1, 'running')
               ON CONFLICT(machine_id, day, hour)
               DO UPDATE SET running_minutes = MIN(60, running_minutes + 1), status = 'running'
               RETURNING running_minutes"#,
            params![machine_id, day.to_string(), hour],
            |row| row.get(0),
        )?;
        Ok(minutes)
    }

    /// Mark the slot's status, creating the row when opening a stoppage
    pub fn mark_hour_status(
        &self,
        machine_id: i64,
        day: NaiveDate,
        hour: u32,
        status: &str,
        create: bool,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        if create {
            conn.execute(
                r#"INSERT INTO hour_entries (machine_id, day, hour, status)
                   VALUES (?1, ?2, ?3, ?4)
                   ON CONFLICT(machine_id, day, hour) DO UPDATE SET status = ?4"#,
                params![machine_id, day.to_string(), hour, status],
            )?;
        } else {
            conn.execute(
                "UPDATE hour_entries SET status = ?4 WHERE machine_id = ?1 AND day = ?2 AND hour = ?3",
                params![machine_id, day.to_string(), hour, status],
            )?;
        }
        Ok(())
    }

    /// Operator/mold assignment and defect edit for one hour slot
    pub fn assign_hour(
        &self,
        machine_id: i64,
        day: NaiveDate,
        hour: u32,
        operator: Option<&str>,
        mold_id: Option<i64>,
        defects: Option<i64>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"INSERT INTO hour_entries (machine_id, day, hour, operator, mold_id, defects)
               VALUES (?1, ?2, ?3, ?4, ?5, COALESCE(?6, 0))
               ON CONFLICT(machine_id, day, hour) DO UPDATE SET
                   operator = COALESCE(?4, operator),
                   mold_id = COALESCE(?5, mold_id),
                   defects = COALESCE(?6, defects)"#,
            params![machine_id, day.to_string(), hour, operator, mold_id, defects],
        )?;
        Ok(())
    }

    /// Recompute the daily rollup as the sum over the day's hour entries.
    /// Rollups are never accumulated independently, so they cannot drift.
    pub fn recompute_day_rollup(&self, machine_id: i64, day: NaiveDate) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"INSERT INTO production_days (machine_id, day, total_units, total_defects)
               SELECT ?1, ?2,
                      COALESCE(SUM(units), 0),
                      COALESCE(SUM(defects), 0)
               FROM hour_entries WHERE machine_id = ?1 AND day = ?2
               ON CONFLICT(machine_id, day) DO UPDATE SET
                   total_units = excluded.total_units,
                   total_defects = excluded.total_defects"#,
            params![machine_id, day.to_string()],
        )?;
        Ok(())
    }

    /// Daily totals, if any activity was recorded
    pub fn day_rollup(&self, machine_id: i64, day: NaiveDate) -> Result<Option<(i64, i64)>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT total_units, total_defects FROM production_days WHERE machine_id = ?1 AND day = ?2",
                params![machine_id, day.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row)
    }

    /// Hour entries for a machine over an inclusive day range, with the
    /// assigned mold's hourly capacity joined in
    pub fn hour_entries_in_range(
        &self,
        machine_id: i64,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<HourEntryRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"SELECT h.machine_id, h.day, h.hour, h.units, h.defects, h.running_minutes,
                      h.status, h.operator, h.mold_id, m.capacity_per_hour
               FROM hour_entries h
               LEFT JOIN molds m ON m.id = h.mold_id
               WHERE h.machine_id = ?1 AND h.day >= ?2 AND h.day <= ?3
               ORDER BY h.day, h.hour"#,
        )?;

        let rows = stmt.query_map(
            params![machine_id, from.to_string(), to.to_string()],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, Option<i64>>(8)?,
                    row.get::<_, Option<f64>>(9)?,
                ))
            },
        )?;

        let mut results = Vec::new();
        for row in rows {
            let (machine_id, day, hour, units, defects, running_minutes, status, operator, mold_id, capacity) = row?;
            results.push(HourEntryRow {
                machine_id,
                day: parse_day(&day)?,
                hour,
                units,
                defects,
                running_minutes,
                status,
                operator,
                mold_id,
                mold_capacity: capacity,
            });
        }
        Ok(results)
    }

    // ----- stoppages -----

    pub fn insert_stoppage(&self, row: &StoppageRow) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"INSERT INTO stoppages
               (id, machine_id, day, hour, reason, description, started_at, ended_at,
                duration_minutes, pending, classified, sap_notification)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"#,
            params![
                row.id,
                row.machine_id,
                row.day.to_string(),
                row.hour,
                row.reason,
                row.description,
                row.started_at.to_rfc3339(),
                row.ended_at.map(|t| t.to_rfc3339()),
                row.duration_minutes,
                row.pending as i64,
                row.classified as i64,
                row.sap_notification,
            ],
        )?;
        Ok(())
    }

    pub fn get_stoppage(&self, id: &str) -> Result<Option<StoppageRow>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                &format!("{} WHERE id = ?1", SELECT_STOPPAGE),
                params![id],
                map_stoppage,
            )
            .optional()?;
        row.map(finish_stoppage).transpose()
    }

    /// Refresh an open episode's duration. Classified episodes are owned by
    /// the operator's write and are never touched here, even if a tick still
    /// holds a stale pending reference.
    pub fn update_stoppage_duration(&self, id: &str, minutes: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE stoppages SET duration_minutes = ?2 WHERE id = ?1 AND pending = 1",
            params![id, minutes],
        )?;
        Ok(())
    }

    /// Auto-resolution: the episode is removed outright, production resumed
    /// before anyone classified it
    pub fn delete_stoppage(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM stoppages WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    pub fn classify_stoppage(
        &self,
        id: &str,
        reason: &str,
        description: &str,
        duration_minutes: i64,
        sap_notification: Option<&str>,
        ended_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"UPDATE stoppages SET
                   reason = ?2, description = ?3, duration_minutes = ?4,
                   sap_notification = ?5, ended_at = ?6, pending = 0, classified = 1
               WHERE id = ?1"#,
            params![id, reason, description, duration_minutes, sap_notification, ended_at.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Pending unclassified episodes in one hour slot, oldest first
    pub fn pending_unclassified(
        &self,
        machine_id: i64,
        day: NaiveDate,
        hour: u32,
    ) -> Result<Vec<StoppageRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE machine_id = ?1 AND day = ?2 AND hour = ?3
                 AND pending = 1 AND reason = 'unclassified'
             ORDER BY started_at",
            SELECT_STOPPAGE
        ))?;
        let rows = stmt.query_map(params![machine_id, day.to_string(), hour], map_stoppage)?;
        collect_stoppages(rows)
    }

    /// Open pending episodes across all machines (restart rehydration)
    pub fn open_pending_stoppages(&self) -> Result<Vec<StoppageRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE pending = 1 AND ended_at IS NULL ORDER BY started_at",
            SELECT_STOPPAGE
        ))?;
        let rows = stmt.query_map([], map_stoppage)?;
        collect_stoppages(rows)
    }

    pub fn stoppages_in_range(
        &self,
        machine_id: i64,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<StoppageRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE machine_id = ?1 AND day >= ?2 AND day <= ?3 ORDER BY started_at",
            SELECT_STOPPAGE
        ))?;
        let rows = stmt.query_map(
            params![machine_id, from.to_string(), to.to_string()],
            map_stoppage,
        )?;
        collect_stoppages(rows)
    }

    // ----- signal log -----

    /// Persist a batch of per-pin signal values in one transaction.
    /// A failed row is logged and skipped; the batch is best-effort.
    pub fn log_signals(&self, rows: &[SignalRow]) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        let mut count = 0;

        for row in rows {
            let result = tx.execute(
                "INSERT INTO signal_log (pin_id, sensor_id, machine_id, kind, value, at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    row.pin_id,
                    row.sensor_id,
                    row.machine_id,
                    row.kind.as_str(),
                    row.value as i64,
                    row.at.to_rfc3339(),
                ],
            );
            match result {
                Ok(_) => count += 1,
                Err(e) => warn!("Failed to persist signal for {}: {}", row.pin_id, e),
            }
        }

        tx.commit()?;
        Ok(count)
    }

    /// Most recent active (value=1) signal per machine and sensor kind
    pub fn latest_active_signals(&self) -> Result<Vec<(i64, SensorKind, DateTime<Utc>)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT machine_id, kind, MAX(at) FROM signal_log
             WHERE value = 1 GROUP BY machine_id, kind",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut results = Vec::new();
        for row in rows {
            let (machine_id, kind, at) = row?;
            results.push((machine_id, SensorKind::parse(&kind), parse_ts(&at)?));
        }
        Ok(results)
    }

    /// Cleanup old signal rows
    pub fn cleanup(&self, retention_days: u32) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
        let deleted = conn.execute(
            "DELETE FROM signal_log WHERE at < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        info!("Cleaned up {} signal rows older than {} days", deleted, retention_days);
        Ok(deleted)
    }

    // ----- machine status -----

    pub fn set_machine_status(&self, machine_id: i64, status: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"INSERT INTO machine_status (machine_id, status, updated_at) VALUES (?1, ?2, ?3)
               ON CONFLICT(machine_id) DO UPDATE SET status = ?2, updated_at = ?3"#,
            params![machine_id, status, at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn machine_status(&self, machine_id: i64) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let status = conn
            .query_row(
                "SELECT status FROM machine_status WHERE machine_id = ?1",
                params![machine_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(status)
    }

    // ----- inventory reads -----

    pub fn list_machines(&self) -> Result<Vec<MachineRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id, name, department_id FROM machines ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(MachineRow {
                id: row.get(0)?,
                name: row.get(1)?,
                department_id: row.get(2)?,
            })
        })?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn machine_ids_for_department(&self, department_id: i64) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id FROM machines WHERE department_id = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![department_id], |row| row.get(0))?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    // ----- settings -----

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let result = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(result)
    }

    // ----- inventory seeding (back-office territory; used by demo and tests) -----

    pub fn upsert_machine(&self, id: i64, name: &str, department_id: Option<i64>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO machines (id, name, department_id) VALUES (?1, ?2, ?3)",
            params![id, name, department_id],
        )?;
        Ok(())
    }

    pub fn upsert_sensor(&self, id: i64, name: &str, kind: SensorKind, machine_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO sensors (id, name, kind, machine_id) VALUES (?1, ?2, ?3, ?4)",
            params![id, name, kind.as_str(), machine_id],
        )?;
        Ok(())
    }

    pub fn upsert_pin_mapping(&self, pin_id: &str, sensor_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO pin_mappings (pin_id, sensor_id) VALUES (?1, ?2)",
            params![pin_id, sensor_id],
        )?;
        Ok(())
    }

    pub fn upsert_mold(&self, id: i64, name: &str, capacity_per_hour: f64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO molds (id, name, capacity_per_hour) VALUES (?1, ?2, ?3)",
            params![id, name, capacity_per_hour],
        )?;
        Ok(())
    }
}

impl MappingSource for Database {
    fn load_mappings(&self) -> Result<HashMap<String, SensorInfo>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT p.pin_id, s.id, s.kind, s.machine_id
             FROM pin_mappings p JOIN sensors s ON s.id = p.sensor_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut mappings = HashMap::new();
        for row in rows {
            let (pin_id, sensor_id, kind, machine_id) = row?;
            mappings.insert(
                pin_id,
                SensorInfo {
                    sensor_id,
                    kind: SensorKind::parse(&kind),
                    machine_id,
                },
            );
        }
        Ok(mappings)
    }

    fn load_machine_ids(&self) -> Result<Vec<i64>> {
        Ok(self.list_machines()?.into_iter().map(|m| m.id).collect())
    }

    fn load_timeout_overrides(&self) -> Result<TimeoutOverrides> {
        let power_minutes = self
            .get_setting("power_timeout_minutes")?
            .and_then(|v| v.parse().ok());
        let cycle_minutes = self
            .get_setting("cycle_timeout_minutes")?
            .and_then(|v| v.parse().ok());
        Ok(TimeoutOverrides {
            power_minutes,
            cycle_minutes,
        })
    }
}

const SELECT_STOPPAGE: &str =
    "SELECT id, machine_id, day, hour, reason, description, started_at, ended_at,
            duration_minutes, pending, classified, sap_notification
     FROM stoppages";

type RawStoppage = (
    String,
    i64,
    String,
    u32,
    String,
    String,
    String,
    Option<String>,
    i64,
    i64,
    i64,
    Option<String>,
);

fn map_stoppage(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawStoppage> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
    ))
}

fn finish_stoppage(raw: RawStoppage) -> Result<StoppageRow> {
    let (id, machine_id, day, hour, reason, description, started_at, ended_at, duration, pending, classified, sap) = raw;
    Ok(StoppageRow {
        id,
        machine_id,
        day: parse_day(&day)?,
        hour,
        reason,
        description,
        started_at: parse_ts(&started_at)?,
        ended_at: ended_at.as_deref().map(parse_ts).transpose()?,
        duration_minutes: duration,
        pending: pending != 0,
        classified: classified != 0,
        sap_notification: sap,
    })
}

fn collect_stoppages(
    rows: impl Iterator<Item = rusqlite::Result<RawStoppage>>,
) -> Result<Vec<StoppageRow>> {
    let mut results = Vec::new();
    for row in rows {
        results.push(finish_stoppage(row?)?);
    }
    Ok(results)
}

fn parse_day(s: &str) -> Result<NaiveDate> {
    Ok(s.parse::<NaiveDate>()?)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_upsert_creates_then_increments() {
        let db = Database::open_in_memory().unwrap();
        let day = "2026-08-27".parse().unwrap();

        assert_eq!(db.increment_units(1, day, 9).unwrap(), 1);
        assert_eq!(db.increment_units(1, day, 9).unwrap(), 2);

        let entries = db.hour_entries_in_range(1, day, day).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].units, 2);
        assert_eq!(entries[0].status, "running");
    }

    #[test]
    fn test_running_minutes_capped_at_60() {
        let db = Database::open_in_memory().unwrap();
        let day = "2026-08-27".parse().unwrap();

        for _ in 0..70 {
            db.add_running_minute(1, day, 10).unwrap();
        }
        let entries = db.hour_entries_in_range(1, day, day).unwrap();
        assert_eq!(entries[0].running_minutes, 60);
    }

    #[test]
    fn test_day_rollup_recomputed_from_hours() {
        let db = Database::open_in_memory().unwrap();
        let day = "2026-08-27".parse().unwrap();

        db.increment_units(1, day, 8).unwrap();
        db.increment_units(1, day, 9).unwrap();
        db.assign_hour(1, day, 9, None, None, Some(1)).unwrap();
        db.recompute_day_rollup(1, day).unwrap();

        assert_eq!(db.day_rollup(1, day).unwrap(), Some((2, 1)));
    }

    #[test]
    fn test_assignment_preserves_unset_fields() {
        let db = Database::open_in_memory().unwrap();
        let day = "2026-08-27".parse().unwrap();

        db.assign_hour(1, day, 9, Some("lee"), Some(5), None).unwrap();
        db.assign_hour(1, day, 9, None, None, Some(3)).unwrap();

        let entries = db.hour_entries_in_range(1, day, day).unwrap();
        assert_eq!(entries[0].operator.as_deref(), Some("lee"));
        assert_eq!(entries[0].mold_id, Some(5));
        assert_eq!(entries[0].defects, 3);
    }
}
