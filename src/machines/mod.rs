// Copyright (c) 2026 moldwatch maintainers
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/moldwatch/moldwatch-rs

//! Machine state machine
//!
//! Operational state is a pure function of two last-seen timestamps and the
//! configured timeouts; the only carried side effect is the pending-stoppage
//! reference. Runtime state is process-local and rebuildable from the
//! persisted signal log, so it is never authoritative.
//!
//! Ingest-driven and tick-driven updates both go through one mutex over the
//! state table, so they cannot interleave destructively on the same machine.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::core::{EventBus, FloorEvent};
use crate::db::Database;
use crate::ledger::ProductionLedger;
use crate::signals::{SensorKind, SignalCache, SignalTimeouts};

/// Computed operational state of a machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineStatus {
    Running,
    Stoppage,
    StoppedYetProducing,
    #[default]
    Inactive,
}

impl MachineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MachineStatus::Running => "running",
            MachineStatus::Stoppage => "stoppage",
            MachineStatus::StoppedYetProducing => "stopped_yet_producing",
            MachineStatus::Inactive => "inactive",
        }
    }
}

/// The four-state table over the two derived booleans
pub fn status_for(has_power: bool, has_cycle: bool) -> MachineStatus {
    match (has_power, has_cycle) {
        (true, true) => MachineStatus::Running,
        (true, false) => MachineStatus::Stoppage,
        (false, true) => MachineStatus::StoppedYetProducing,
        (false, false) => MachineStatus::Inactive,
    }
}

/// Reference to the machine's open unclassified episode
#[derive(Debug, Clone)]
pub struct PendingStoppage {
    pub id: String,
    pub started_at: DateTime<Utc>,
}

/// Per-machine runtime state; created lazily on first signal
#[derive(Debug, Clone, Default)]
pub struct RuntimeState {
    pub last_power: Option<DateTime<Utc>>,
    pub last_cycle: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    /// Calendar-minute bucket of the last counted running minute
    pub last_run_minute: Option<i64>,
    pub status: MachineStatus,
    pub pending: Option<PendingStoppage>,
}

impl RuntimeState {
    fn has_signal_within(signal: Option<DateTime<Utc>>, now: DateTime<Utc>, timeout: Duration) -> bool {
        match signal {
            Some(at) => {
                let elapsed = now.signed_duration_since(at);
                elapsed <= chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::minutes(60))
            }
            None => false,
        }
    }

    pub fn evaluate(&self, now: DateTime<Utc>, timeouts: SignalTimeouts) -> MachineStatus {
        let has_power = Self::has_signal_within(self.last_power, now, timeouts.power);
        let has_cycle = Self::has_signal_within(self.last_cycle, now, timeouts.cycle);
        status_for(has_power, has_cycle)
    }
}

fn minute_bucket(at: DateTime<Utc>) -> i64 {
    at.timestamp().div_euclid(60)
}

/// Coordinates per-machine runtime state, the state table, and the ledger
/// side effects of transitions
pub struct MachineMonitor {
    states: Mutex<HashMap<i64, RuntimeState>>,
    ledger: Arc<ProductionLedger>,
    cache: Arc<SignalCache>,
    bus: Arc<EventBus>,
}

impl MachineMonitor {
    pub fn new(ledger: Arc<ProductionLedger>, cache: Arc<SignalCache>, bus: Arc<EventBus>) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            ledger,
            cache,
            bus,
        }
    }

    /// Rebuild last-seen timestamps and pending references from persisted
    /// data after a restart
    pub async fn rehydrate(&self, db: &Database) -> Result<()> {
        let mut states = self.states.lock().await;

        for (machine_id, kind, at) in db.latest_active_signals()? {
            let state = states.entry(machine_id).or_default();
            match kind {
                SensorKind::Power => state.last_power = Some(at),
                SensorKind::UnitCycle => state.last_cycle = Some(at),
                SensorKind::Other => {}
            }
            state.last_activity = Some(state.last_activity.map_or(at, |t| t.max(at)));
        }

        // The minute holding the last persisted signal may already be
        // credited; the dedup bucket starts there, not at zero
        for state in states.values_mut() {
            state.last_run_minute = state.last_activity.map(minute_bucket);
        }

        for row in db.open_pending_stoppages()? {
            let state = states.entry(row.machine_id).or_default();
            state.pending = Some(PendingStoppage {
                id: row.id,
                started_at: row.started_at,
            });
        }

        info!("Rehydrated runtime state for {} machines", states.len());
        Ok(())
    }

    /// A power-present signal was decoded for this machine
    pub async fn note_power(&self, machine_id: i64, at: DateTime<Utc>) {
        let mut states = self.states.lock().await;
        let state = states.entry(machine_id).or_default();
        state.last_power = Some(at);
        state.last_activity = Some(at);

        self.bus.publish(FloorEvent::PowerSignalSeen { machine_id, at });
    }

    /// A completed-cycle signal: count the unit and resolve any pending
    /// stoppage for the machine
    pub async fn note_cycle(&self, machine_id: i64, at: DateTime<Utc>) {
        let mut states = self.states.lock().await;
        let state = states.entry(machine_id).or_default();
        state.last_cycle = Some(at);
        state.last_activity = Some(at);

        if let Err(e) = self.ledger.record_unit(machine_id, at) {
            warn!("Failed to record unit for machine {}: {}", machine_id, e);
        }

        if let Some(pending) = state.pending.take() {
            if let Err(e) = self.ledger.resolve_stoppage(machine_id, &pending.id, at) {
                warn!("Failed to resolve stoppage {}: {}", pending.id, e);
                state.pending = Some(pending);
            }
        }
    }

    /// A mapped pin of another sensor kind fired
    pub async fn note_activity(&self, machine_id: i64, at: DateTime<Utc>) {
        let mut states = self.states.lock().await;
        states.entry(machine_id).or_default().last_activity = Some(at);
    }

    /// Forget the pending reference once an operator classified the episode
    pub async fn clear_pending(&self, machine_id: i64, stoppage_id: &str) {
        let mut states = self.states.lock().await;
        if let Some(state) = states.get_mut(&machine_id) {
            if state.pending.as_ref().is_some_and(|p| p.id == stoppage_id) {
                state.pending = None;
            }
        }
    }

    /// Re-evaluate every known machine. Runs after each ingest batch and on
    /// the periodic tick.
    pub async fn evaluate_all(&self, now: DateTime<Utc>) {
        let timeouts = self.cache.timeouts();
        let machine_ids = self.cache.machine_ids();

        let mut states = self.states.lock().await;
        // Machines seen via signals but not (yet) registered still evaluate
        let mut ids: Vec<i64> = machine_ids;
        for id in states.keys() {
            if !ids.contains(id) {
                ids.push(*id);
            }
        }

        for machine_id in ids {
            let state = states.entry(machine_id).or_default();
            let status = state.evaluate(now, timeouts);

            if status == MachineStatus::Running {
                let bucket = minute_bucket(now);
                if state.last_run_minute.map_or(true, |m| bucket > m) {
                    match self.ledger.add_running_minute(machine_id, now) {
                        Ok(_) => state.last_run_minute = Some(bucket),
                        Err(e) => warn!("Failed to count running minute for machine {}: {}", machine_id, e),
                    }
                }
            }

            if status == MachineStatus::Stoppage && state.pending.is_none() {
                match self.ledger.open_stoppage(machine_id, now) {
                    Ok(row) => {
                        state.pending = Some(PendingStoppage {
                            id: row.id,
                            started_at: row.started_at,
                        });
                    }
                    Err(e) => warn!("Failed to open stoppage for machine {}: {}", machine_id, e),
                }
            }

            // Ongoing stoppage duration grows in real time until classified
            if let Some(pending) = &state.pending {
                let minutes = now
                    .signed_duration_since(pending.started_at)
                    .num_minutes()
                    .clamp(0, 60);
                if let Err(e) = self.ledger.refresh_stoppage(&pending.id, minutes) {
                    warn!("Failed to refresh stoppage {}: {}", pending.id, e);
                }
            }

            if let Err(e) = self.ledger.set_machine_status(machine_id, status.as_str(), now) {
                warn!("Failed to persist status for machine {}: {}", machine_id, e);
            }

            if status != state.status {
                debug!("Machine {} {} -> {}", machine_id, state.status.as_str(), status.as_str());
                if status == MachineStatus::Inactive {
                    if let Err(e) = self.ledger.mark_hour_inactive(machine_id, now) {
                        warn!("Failed to mark hour inactive for machine {}: {}", machine_id, e);
                    }
                }
                state.status = status;
                self.bus.publish(FloorEvent::MachineStateChanged {
                    machine_id,
                    status,
                    at: now,
                });
            }
        }
    }

    /// Current computed statuses
    pub async fn statuses(&self) -> HashMap<i64, MachineStatus> {
        let states = self.states.lock().await;
        states.iter().map(|(id, s)| (*id, s.status)).collect()
    }

    /// Number of machines with runtime state
    pub async fn tracked_count(&self) -> usize {
        self.states.lock().await.len()
    }

    /// Periodic evaluation loop, independent of ingest traffic
    pub async fn run(&self, tick: Duration, mut shutdown: broadcast::Receiver<()>) {
        info!("Starting machine monitor tick every {:?}", tick);
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.evaluate_all(Utc::now()).await;
                }
                _ = shutdown.recv() => {
                    info!("Machine monitor shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_state_table() {
        assert_eq!(status_for(true, true), MachineStatus::Running);
        assert_eq!(status_for(true, false), MachineStatus::Stoppage);
        assert_eq!(status_for(false, true), MachineStatus::StoppedYetProducing);
        assert_eq!(status_for(false, false), MachineStatus::Inactive);
    }

    #[test]
    fn test_signals_expire_after_timeout() {
        let timeouts = SignalTimeouts::from_minutes(2, 3);
        let t0 = Utc.with_ymd_and_hms(2026, 8, 27, 9, 0, 0).unwrap();

        let state = RuntimeState {
            last_power: Some(t0),
            last_cycle: Some(t0),
            ..Default::default()
        };

        assert_eq!(state.evaluate(t0 + chrono::Duration::minutes(1), timeouts), MachineStatus::Running);
        // Power expired (2 min), cycle still fresh (3 min)
        assert_eq!(
            state.evaluate(t0 + chrono::Duration::seconds(150), timeouts),
            MachineStatus::StoppedYetProducing
        );
        assert_eq!(
            state.evaluate(t0 + chrono::Duration::minutes(10), timeouts),
            MachineStatus::Inactive
        );
    }

    fn test_fixture() -> (Arc<Database>, MachineMonitor) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.upsert_machine(1, "press-1", Some(1)).unwrap();
        db.upsert_sensor(1, "power-1", SensorKind::Power, 1).unwrap();
        db.upsert_sensor(2, "cycle-1", SensorKind::UnitCycle, 1).unwrap();
        db.upsert_pin_mapping("DO0", 1).unwrap();
        db.upsert_pin_mapping("DO1", 2).unwrap();

        let bus = Arc::new(EventBus::new(64));
        let cache = Arc::new(SignalCache::new(
            db.clone(),
            SignalTimeouts::from_minutes(2, 3),
            Duration::from_secs(300),
        ));
        let ledger = Arc::new(ProductionLedger::new(db.clone(), bus.clone()));
        (db, MachineMonitor::new(ledger, cache, bus))
    }

    fn at(minute: u32, second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 27, 9, minute, second).unwrap()
    }

    #[tokio::test]
    async fn test_silent_machine_stays_inactive_without_stoppage() {
        let (db, monitor) = test_fixture();

        monitor.evaluate_all(at(0, 0)).await;
        monitor.evaluate_all(at(1, 0)).await;

        let day = at(0, 0).date_naive();
        assert!(db.stoppages_in_range(1, day, day).unwrap().is_empty());
        assert_eq!(db.machine_status(1).unwrap().as_deref(), Some("inactive"));
    }

    #[tokio::test]
    async fn test_sustained_power_without_cycle_opens_one_stoppage() {
        let (db, monitor) = test_fixture();

        monitor.note_power(1, at(0, 0)).await;
        monitor.evaluate_all(at(0, 30)).await;
        monitor.note_power(1, at(1, 0)).await;
        monitor.evaluate_all(at(1, 30)).await;

        let day = at(0, 0).date_naive();
        let stoppages = db.stoppages_in_range(1, day, day).unwrap();
        assert_eq!(stoppages.len(), 1);
        assert!(stoppages[0].pending);
        assert_eq!(stoppages[0].reason, "unclassified");
        assert_eq!(db.machine_status(1).unwrap().as_deref(), Some("stoppage"));
    }

    #[tokio::test]
    async fn test_cycle_signal_resolves_pending_stoppage() {
        let (db, monitor) = test_fixture();

        monitor.note_power(1, at(0, 0)).await;
        monitor.evaluate_all(at(0, 30)).await;

        let day = at(0, 0).date_naive();
        assert_eq!(db.stoppages_in_range(1, day, day).unwrap().len(), 1);

        monitor.note_power(1, at(1, 0)).await;
        monitor.note_cycle(1, at(1, 0)).await;
        monitor.evaluate_all(at(1, 5)).await;

        assert!(db.stoppages_in_range(1, day, day).unwrap().is_empty());
        let entries = db.hour_entries_in_range(1, day, day).unwrap();
        assert_eq!(entries[0].status, "running");
        assert_eq!(entries[0].units, 1);
        assert_eq!(db.machine_status(1).unwrap().as_deref(), Some("running"));
    }

    #[tokio::test]
    async fn test_running_minute_counted_once_per_minute() {
        let (db, monitor) = test_fixture();

        monitor.note_power(1, at(0, 0)).await;
        monitor.note_cycle(1, at(0, 0)).await;

        // Two batches within the same calendar minute
        monitor.evaluate_all(at(0, 10)).await;
        monitor.evaluate_all(at(0, 40)).await;

        let day = at(0, 0).date_naive();
        let entries = db.hour_entries_in_range(1, day, day).unwrap();
        assert_eq!(entries[0].running_minutes, 1);

        // Next minute counts again
        monitor.evaluate_all(at(1, 10)).await;
        let entries = db.hour_entries_in_range(1, day, day).unwrap();
        assert_eq!(entries[0].running_minutes, 2);
    }

    #[tokio::test]
    async fn test_rehydration_does_not_recount_credited_minute() {
        use crate::signals::SignalRow;

        let (db, monitor) = test_fixture();
        let day = at(0, 0).date_naive();

        // Signals persisted before a restart; that minute was already credited
        db.log_signals(&[
            SignalRow {
                pin_id: "DO0".to_string(),
                sensor_id: 1,
                machine_id: 1,
                kind: SensorKind::Power,
                value: true,
                at: at(0, 0),
            },
            SignalRow {
                pin_id: "DO1".to_string(),
                sensor_id: 2,
                machine_id: 1,
                kind: SensorKind::UnitCycle,
                value: true,
                at: at(0, 0),
            },
        ])
        .unwrap();
        db.add_running_minute(1, day, 9).unwrap();

        monitor.rehydrate(&db).await.unwrap();

        // Same calendar minute as the rehydrated signals: no double count
        monitor.evaluate_all(at(0, 30)).await;
        let entries = db.hour_entries_in_range(1, day, day).unwrap();
        assert_eq!(entries[0].running_minutes, 1);

        // The next minute counts normally
        monitor.evaluate_all(at(1, 10)).await;
        let entries = db.hour_entries_in_range(1, day, day).unwrap();
        assert_eq!(entries[0].running_minutes, 2);
    }

    #[tokio::test]
    async fn test_open_stoppage_duration_refreshes_on_tick() {
        let (db, monitor) = test_fixture();

        monitor.note_power(1, at(0, 0)).await;
        monitor.evaluate_all(at(0, 30)).await;
        monitor.note_power(1, at(5, 0)).await;
        monitor.evaluate_all(at(5, 30)).await;

        let day = at(0, 0).date_naive();
        let stoppages = db.stoppages_in_range(1, day, day).unwrap();
        assert_eq!(stoppages.len(), 1);
        assert_eq!(stoppages[0].duration_minutes, 5);
    }
}
