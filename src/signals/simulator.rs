// Copyright (c) 2026 moldwatch maintainers
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/moldwatch/moldwatch-rs

//! Demo-mode PLC simulator
//!
//! Feeds synthetic output bytes through the real ingest path so dashboards
//! can be developed without a wired PLC.

use anyhow::Result;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::{ingest::SignalIngest, SensorKind};
use crate::db::Database;

/// Generates plausible power/cycle bit patterns for two demo presses
pub struct PlcSimulator {
    ingest: Arc<SignalIngest>,
    interval: Duration,
}

impl PlcSimulator {
    pub fn new(ingest: Arc<SignalIngest>, interval: Duration) -> Self {
        Self { ingest, interval }
    }

    /// Register demo machines, sensors, pins, and molds if absent
    pub fn seed_inventory(db: &Database) -> Result<()> {
        db.upsert_machine(1, "demo-press-1", Some(1))?;
        db.upsert_machine(2, "demo-press-2", Some(1))?;
        db.upsert_sensor(1, "demo-press-1 power", SensorKind::Power, 1)?;
        db.upsert_sensor(2, "demo-press-1 cycle", SensorKind::UnitCycle, 1)?;
        db.upsert_sensor(3, "demo-press-2 power", SensorKind::Power, 2)?;
        db.upsert_sensor(4, "demo-press-2 cycle", SensorKind::UnitCycle, 2)?;
        db.upsert_pin_mapping("DO0", 1)?;
        db.upsert_pin_mapping("DO1", 2)?;
        db.upsert_pin_mapping("DO2", 3)?;
        db.upsert_pin_mapping("DO3", 4)?;
        db.upsert_mold(1, "demo-mold-120", 120.0)?;
        db.upsert_mold(2, "demo-mold-90", 90.0)?;
        info!("Seeded demo inventory: 2 machines, 4 pins");
        Ok(())
    }

    fn next_byte() -> u8 {
        let mut rng = rand::thread_rng();
        let mut byte = 0u8;
        // Power contacts are almost always closed; cycles pulse irregularly
        for (power_bit, cycle_bit) in [(0, 1), (2, 3)] {
            if rng.gen_bool(0.95) {
                byte |= 1 << power_bit;
                if rng.gen_bool(0.7) {
                    byte |= 1 << cycle_bit;
                }
            }
        }
        byte
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!("PLC simulator feeding a byte every {:?}", self.interval);
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let byte = Self::next_byte();
                    if let Err(e) = self.ingest.ingest(byte, None).await {
                        warn!("Simulated ingest failed: {}", e);
                    }
                }
                _ = shutdown.recv() => {
                    info!("PLC simulator shutting down");
                    break;
                }
            }
        }
    }
}
