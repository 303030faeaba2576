// Copyright (c) 2026 moldwatch maintainers
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/moldwatch/moldwatch-rs

//! Pin-mapping and timeout cache
//!
//! Pin mappings and signal timeouts live in persistent storage (maintained
//! by the back-office CRUD surfaces) and are served to the ingest path from
//! a TTL cache. A refresh failure keeps the last good snapshot; it never
//! fails an ingest call.

use anyhow::Result;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::SensorInfo;

/// Minimum spacing between miss-triggered reloads
const MISS_RELOAD_FLOOR: Duration = Duration::from_secs(5);

/// Injectable time source so cache staleness is testable
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall-clock implementation
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// The two state-machine timeouts, already validated to 1-60 minutes
#[derive(Debug, Clone, Copy)]
pub struct SignalTimeouts {
    pub power: Duration,
    pub cycle: Duration,
}

impl SignalTimeouts {
    pub fn from_minutes(power: u32, cycle: u32) -> Self {
        Self {
            power: Duration::from_secs(u64::from(power) * 60),
            cycle: Duration::from_secs(u64::from(cycle) * 60),
        }
    }
}

/// Runtime timeout overrides read from storage; `None` keeps the configured default
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeoutOverrides {
    pub power_minutes: Option<u32>,
    pub cycle_minutes: Option<u32>,
}

/// Backing store for pin mappings, machine inventory, and timeout overrides
pub trait MappingSource: Send + Sync {
    fn load_mappings(&self) -> Result<HashMap<String, SensorInfo>>;
    fn load_machine_ids(&self) -> Result<Vec<i64>>;
    fn load_timeout_overrides(&self) -> Result<TimeoutOverrides>;
}

struct CacheState {
    mappings: HashMap<String, SensorInfo>,
    machine_ids: Vec<i64>,
    timeouts: SignalTimeouts,
    refreshed_at: Option<Instant>,
}

/// TTL cache over a [`MappingSource`]
pub struct SignalCache {
    source: Arc<dyn MappingSource>,
    defaults: SignalTimeouts,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    state: RwLock<CacheState>,
}

impl SignalCache {
    pub fn new(source: Arc<dyn MappingSource>, defaults: SignalTimeouts, ttl: Duration) -> Self {
        Self::with_clock(source, defaults, ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(
        source: Arc<dyn MappingSource>,
        defaults: SignalTimeouts,
        ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            source,
            defaults,
            ttl,
            clock,
            state: RwLock::new(CacheState {
                mappings: HashMap::new(),
                machine_ids: Vec::new(),
                timeouts: defaults,
                refreshed_at: None,
            }),
        }
    }

    /// Resolve a pin to its sensor. A miss on a fresh-enough cache is an
    /// unmapped pin (expected); a miss on a stale cache triggers a reload.
    pub fn resolve(&self, pin_id: &str) -> Option<SensorInfo> {
        self.ensure_fresh(self.ttl);

        if let Some(info) = self.state.read().mappings.get(pin_id) {
            return Some(info.clone());
        }

        // Miss: the mapping may have been added since the last refresh
        self.ensure_fresh(MISS_RELOAD_FLOOR);
        self.state.read().mappings.get(pin_id).cloned()
    }

    /// All machines known to the pin mappings (state machine iterates these)
    pub fn machine_ids(&self) -> Vec<i64> {
        self.ensure_fresh(self.ttl);
        self.state.read().machine_ids.clone()
    }

    /// Current power/cycle timeouts
    pub fn timeouts(&self) -> SignalTimeouts {
        self.ensure_fresh(self.ttl);
        self.state.read().timeouts
    }

    /// Drop the snapshot so the next read reloads
    pub fn invalidate(&self) {
        self.state.write().refreshed_at = None;
    }

    fn ensure_fresh(&self, max_age: Duration) {
        let now = self.clock.now();
        {
            let state = self.state.read();
            if let Some(at) = state.refreshed_at {
                if now.duration_since(at) < max_age {
                    return;
                }
            }
        }
        self.refresh(now);
    }

    fn refresh(&self, now: Instant) {
        let loaded = self.source.load_mappings().and_then(|mappings| {
            let machine_ids = self.source.load_machine_ids()?;
            let overrides = self.source.load_timeout_overrides()?;
            Ok((mappings, machine_ids, overrides))
        });

        let mut state = self.state.write();
        match loaded {
            Ok((mappings, machine_ids, overrides)) => {
                debug!(
                    "Refreshed signal cache: {} mappings, {} machines",
                    mappings.len(),
                    machine_ids.len()
                );
                state.mappings = mappings;
                state.machine_ids = machine_ids;
                state.timeouts = apply_overrides(self.defaults, overrides);
                state.refreshed_at = Some(now);
            }
            Err(e) => {
                // Serve the last good snapshot; never fail the caller
                warn!("Signal cache refresh failed, serving stale data: {}", e);
                state.refreshed_at = Some(now);
            }
        }
    }
}

fn apply_overrides(defaults: SignalTimeouts, overrides: TimeoutOverrides) -> SignalTimeouts {
    let mut timeouts = defaults;
    if let Some(minutes) = overrides.power_minutes {
        if (1..=60).contains(&minutes) {
            timeouts.power = Duration::from_secs(u64::from(minutes) * 60);
        } else {
            warn!("Ignoring out-of-range power timeout override: {}", minutes);
        }
    }
    if let Some(minutes) = overrides.cycle_minutes {
        if (1..=60).contains(&minutes) {
            timeouts.cycle = Duration::from_secs(u64::from(minutes) * 60);
        } else {
            warn!("Ignoring out-of-range cycle timeout override: {}", minutes);
        }
    }
    timeouts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::SensorKind;
    use parking_lot::Mutex;

    struct ManualClock {
        now: Mutex<Instant>,
    }

    impl ManualClock {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                now: Mutex::new(Instant::now()),
            })
        }

        fn advance(&self, d: Duration) {
            *self.now.lock() += d;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            *self.now.lock()
        }
    }

    struct FakeSource {
        mappings: Mutex<HashMap<String, SensorInfo>>,
        fail: Mutex<bool>,
        loads: Mutex<u32>,
    }

    impl FakeSource {
        fn new() -> Arc<Self> {
            let mut mappings = HashMap::new();
            mappings.insert(
                "DO0".to_string(),
                SensorInfo {
                    sensor_id: 1,
                    kind: SensorKind::Power,
                    machine_id: 10,
                },
            );
            Arc::new(Self {
                mappings: Mutex::new(mappings),
                fail: Mutex::new(false),
                loads: Mutex::new(0),
            })
        }
    }

    impl MappingSource for FakeSource {
        fn load_mappings(&self) -> Result<HashMap<String, SensorInfo>> {
            *self.loads.lock() += 1;
            if *self.fail.lock() {
                anyhow::bail!("storage unavailable");
            }
            Ok(self.mappings.lock().clone())
        }

        fn load_machine_ids(&self) -> Result<Vec<i64>> {
            Ok(vec![10])
        }

        fn load_timeout_overrides(&self) -> Result<TimeoutOverrides> {
            Ok(TimeoutOverrides::default())
        }
    }

    fn cache(source: Arc<FakeSource>, clock: Arc<ManualClock>) -> SignalCache {
        SignalCache::with_clock(
            source,
            SignalTimeouts::from_minutes(2, 3),
            Duration::from_secs(300),
            clock,
        )
    }

    #[test]
    fn test_resolve_and_ttl_refresh() {
        let source = FakeSource::new();
        let clock = ManualClock::new();
        let cache = cache(source.clone(), clock.clone());

        assert_eq!(cache.resolve("DO0").unwrap().machine_id, 10);
        let first_loads = *source.loads.lock();

        // Within TTL: no reload
        cache.resolve("DO0");
        assert_eq!(*source.loads.lock(), first_loads);

        // Past TTL: reload
        clock.advance(Duration::from_secs(301));
        cache.resolve("DO0");
        assert!(*source.loads.lock() > first_loads);
    }

    #[test]
    fn test_refresh_failure_serves_last_good() {
        let source = FakeSource::new();
        let clock = ManualClock::new();
        let cache = cache(source.clone(), clock.clone());

        assert!(cache.resolve("DO0").is_some());

        *source.fail.lock() = true;
        clock.advance(Duration::from_secs(301));

        // Stale but still served
        assert!(cache.resolve("DO0").is_some());
        assert_eq!(cache.machine_ids(), vec![10]);
    }

    #[test]
    fn test_unmapped_pin_is_none_not_error() {
        let source = FakeSource::new();
        let clock = ManualClock::new();
        let cache = cache(source, clock);

        assert!(cache.resolve("DO7").is_none());
    }

    #[test]
    fn test_miss_triggers_bounded_reload() {
        let source = FakeSource::new();
        let clock = ManualClock::new();
        let cache = cache(source.clone(), clock.clone());

        cache.resolve("DO0");
        let loads = *source.loads.lock();

        // New mapping appears in storage; cache is fresh so a plain lookup
        // would miss, but the miss path reloads once the floor has passed.
        source.mappings.lock().insert(
            "DO1".to_string(),
            SensorInfo {
                sensor_id: 2,
                kind: SensorKind::UnitCycle,
                machine_id: 10,
            },
        );
        clock.advance(Duration::from_secs(6));

        assert!(cache.resolve("DO1").is_some());
        assert!(*source.loads.lock() > loads);
    }
}
