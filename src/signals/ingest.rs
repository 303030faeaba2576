// Copyright (c) 2026 moldwatch maintainers
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/moldwatch/moldwatch-rs

//! Signal ingest - turns a polled PLC output byte into routed sensor signals
//!
//! Each bit of the byte is one digital-output pin. Unmapped pins are skipped
//! silently; pins may be intentionally unused. Per-pin signal rows are
//! persisted as one bulk write after the routing loop, purely to bound
//! database round-trips.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{pin_id_for_bit, SensorKind, SignalCache, SignalRow};
use crate::db::Database;
use crate::machines::MachineMonitor;

/// Acknowledgment returned to the polling daemon
#[derive(Debug, Clone, Serialize)]
pub struct IngestAck {
    /// Machines touched by this batch
    pub machines: Vec<i64>,
    /// Mapped pins decoded from the byte
    pub pins_decoded: usize,
    pub at: DateTime<Utc>,
}

/// Parse the daemon's hex-encoded output byte ("A5", "0xA5", "a5")
pub fn decode_signal_byte(s: &str) -> Result<u8> {
    let trimmed = s.trim();
    let hex = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if hex.is_empty() || hex.len() > 2 {
        return Err(anyhow!("invalid signal byte '{}'", s));
    }
    u8::from_str_radix(hex, 16).map_err(|_| anyhow!("invalid signal byte '{}'", s))
}

/// Decodes signal batches and routes them to machines
pub struct SignalIngest {
    cache: Arc<SignalCache>,
    monitor: Arc<MachineMonitor>,
    db: Arc<Database>,
}

impl SignalIngest {
    pub fn new(cache: Arc<SignalCache>, monitor: Arc<MachineMonitor>, db: Arc<Database>) -> Self {
        Self { cache, monitor, db }
    }

    /// Process one polled byte. `at` defaults to arrival time.
    pub async fn ingest(&self, byte: u8, at: Option<DateTime<Utc>>) -> Result<IngestAck> {
        let at = at.unwrap_or_else(Utc::now);
        let mut rows: Vec<SignalRow> = Vec::with_capacity(8);
        let mut machines: Vec<i64> = Vec::new();

        for bit in 0..8u8 {
            let pin_id = pin_id_for_bit(bit);
            let Some(info) = self.cache.resolve(&pin_id) else {
                // Expected: not every output pin is wired
                debug!("Skipping unmapped pin {}", pin_id);
                continue;
            };

            let value = byte & (1 << bit) != 0;
            rows.push(SignalRow {
                pin_id,
                sensor_id: info.sensor_id,
                machine_id: info.machine_id,
                kind: info.kind,
                value,
                at,
            });

            if value {
                match info.kind {
                    SensorKind::Power => self.monitor.note_power(info.machine_id, at).await,
                    SensorKind::UnitCycle => self.monitor.note_cycle(info.machine_id, at).await,
                    SensorKind::Other => self.monitor.note_activity(info.machine_id, at).await,
                }
                if !machines.contains(&info.machine_id) {
                    machines.push(info.machine_id);
                }
            }
        }

        // Bulk persistence is best-effort; in-memory evaluation proceeds on
        // the timestamps it already holds
        if !rows.is_empty() {
            if let Err(e) = self.db.log_signals(&rows) {
                warn!("Signal batch persistence failed: {}", e);
            }
        }

        let pins_decoded = rows.len();
        self.monitor.evaluate_all(at).await;

        machines.sort_unstable();
        Ok(IngestAck {
            machines,
            pins_decoded,
            at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::EventBus;
    use crate::ledger::ProductionLedger;
    use crate::signals::SignalTimeouts;
    use chrono::TimeZone;
    use std::time::Duration;

    #[test]
    fn test_decode_signal_byte() {
        assert_eq!(decode_signal_byte("A5").unwrap(), 0xA5);
        assert_eq!(decode_signal_byte("0xa5").unwrap(), 0xA5);
        assert_eq!(decode_signal_byte(" 03 ").unwrap(), 3);
        assert!(decode_signal_byte("").is_err());
        assert!(decode_signal_byte("123").is_err());
        assert!(decode_signal_byte("zz").is_err());
    }

    fn fixture() -> (Arc<Database>, SignalIngest) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.upsert_machine(1, "press-1", None).unwrap();
        db.upsert_machine(2, "press-2", None).unwrap();
        db.upsert_sensor(1, "power-1", SensorKind::Power, 1).unwrap();
        db.upsert_sensor(2, "cycle-1", SensorKind::UnitCycle, 1).unwrap();
        db.upsert_sensor(3, "power-2", SensorKind::Power, 2).unwrap();
        db.upsert_pin_mapping("DO0", 1).unwrap();
        db.upsert_pin_mapping("DO1", 2).unwrap();
        db.upsert_pin_mapping("DO3", 3).unwrap();

        let bus = Arc::new(EventBus::new(64));
        let cache = Arc::new(SignalCache::new(
            db.clone(),
            SignalTimeouts::from_minutes(2, 3),
            Duration::from_secs(300),
        ));
        let ledger = Arc::new(ProductionLedger::new(db.clone(), bus.clone()));
        let monitor = Arc::new(MachineMonitor::new(ledger, cache.clone(), bus));
        let ingest = SignalIngest::new(cache, monitor, db.clone());
        (db, ingest)
    }

    #[tokio::test]
    async fn test_batch_routes_and_acks_machines() {
        let (db, ingest) = fixture();
        let at = Utc.with_ymd_and_hms(2026, 8, 27, 9, 0, 0).unwrap();

        // DO0 (power m1) + DO1 (cycle m1) + DO3 (power m2); DO2 unmapped and set
        let ack = ingest.ingest(0b0000_1111, Some(at)).await.unwrap();
        assert_eq!(ack.machines, vec![1, 2]);
        assert_eq!(ack.pins_decoded, 3);

        let day = at.date_naive();
        let entries = db.hour_entries_in_range(1, day, day).unwrap();
        assert_eq!(entries[0].units, 1);
        assert_eq!(db.machine_status(1).unwrap().as_deref(), Some("running"));
        // Machine 2 has power but no cycle signal yet
        assert_eq!(db.machine_status(2).unwrap().as_deref(), Some("stoppage"));
    }

    #[tokio::test]
    async fn test_inactive_bits_touch_no_machines() {
        let (db, ingest) = fixture();
        let at = Utc.with_ymd_and_hms(2026, 8, 27, 9, 0, 0).unwrap();

        let ack = ingest.ingest(0x00, Some(at)).await.unwrap();
        assert!(ack.machines.is_empty());
        // Mapped pins are still persisted with value 0
        assert_eq!(ack.pins_decoded, 3);

        let day = at.date_naive();
        assert!(db.hour_entries_in_range(1, day, day).unwrap().is_empty());
    }
}
