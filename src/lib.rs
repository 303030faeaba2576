// Copyright (c) 2026 moldwatch maintainers
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/moldwatch/moldwatch-rs

//! moldwatch - Injection-Molding Floor Monitor
//!
//! Turns the raw digital-output byte of a floor PLC into:
//! - a live operational state per machine (running / stoppage /
//!   stopped-yet-producing / inactive)
//! - an hourly production and stoppage ledger
//! - derived reliability metrics (OEE, availability, quality, performance,
//!   MTBF, MTTR), per machine, department, facility, or shift
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                      moldwatch Engine                      │
//! ├────────────────────────────────────────────────────────────┤
//! │  ┌─────────┐   ┌──────────┐   ┌─────────┐   ┌──────────┐  │
//! │  │ Signal  │ → │ Machine  │ → │ Ledger  │ → │ Metrics  │  │
//! │  │ Ingest  │   │ Monitor  │   │         │   │          │  │
//! │  └─────────┘   └──────────┘   └─────────┘   └──────────┘  │
//! │       ↓             ↓              ↓             ↓        │
//! │  ┌──────────────────────────────────────────────────────┐ │
//! │  │                      Event Bus                       │ │
//! │  └──────────────────────────────────────────────────────┘ │
//! │       ↓             ↓              ↓             ↓        │
//! │  ┌─────────┐   ┌──────────┐   ┌──────────────────────┐   │
//! │  │ SQLite  │   │ WebSocket│   │        MQTT          │   │
//! │  │ Ledger  │   │ API      │   │      Publisher       │   │
//! │  └─────────┘   └──────────┘   └──────────────────────┘   │
//! └────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![allow(dead_code)]

pub mod config;
pub mod core;
pub mod db;
pub mod ledger;
pub mod machines;
pub mod metrics;
pub mod signals;
pub mod streaming;

// Re-exports for convenience
pub use config::Config;
pub use core::{Engine, EventBus, FloorEvent};
pub use db::Database;
pub use ledger::{ProductionLedger, StoppageReason};
pub use machines::{MachineMonitor, MachineStatus};
pub use metrics::ReliabilityCalculator;
pub use signals::SignalIngest;
pub use streaming::StreamingManager;

/// moldwatch version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// moldwatch name
pub const NAME: &str = "moldwatch";
