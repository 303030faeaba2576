// Copyright (c) 2026 moldwatch maintainers
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/moldwatch/moldwatch-rs

//! Event bus for inter-component communication
//!
//! Publishing is fire-and-forget: a send with no subscribers is not an
//! error, and a slow subscriber never blocks the ledger write that
//! produced the event.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::machines::MachineStatus;

/// Events the core publishes to the presentation layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum FloorEvent {
    /// A power-present signal was seen for a machine
    PowerSignalSeen {
        machine_id: i64,
        at: DateTime<Utc>,
    },
    /// A completed molding cycle incremented the hour's unit counter
    #[serde(rename = "production-unit-incremented")]
    UnitProduced {
        machine_id: i64,
        day: NaiveDate,
        hour: u32,
        units: i64,
    },
    /// A machine's computed operational state changed
    MachineStateChanged {
        machine_id: i64,
        status: MachineStatus,
        at: DateTime<Utc>,
    },
    /// An unclassified stoppage was detected and opened
    StoppageOpened {
        machine_id: i64,
        stoppage_id: String,
        day: NaiveDate,
        hour: u32,
        at: DateTime<Utc>,
    },
    /// A pending stoppage resolved itself (production resumed)
    StoppageResolved {
        machine_id: i64,
        stoppage_id: String,
        at: DateTime<Utc>,
    },
    /// A stoppage was classified by an operator
    StoppageRecorded {
        machine_id: i64,
        stoppage_id: String,
        reason: String,
        at: DateTime<Utc>,
    },
    /// Operator/mold assignment or defect counts were edited
    AssignmentUpdated {
        machine_id: i64,
        day: NaiveDate,
        hours: Vec<u32>,
    },
}

impl FloorEvent {
    /// Short event-kind label, used for MQTT topics and WS filtering
    pub fn kind(&self) -> &'static str {
        match self {
            FloorEvent::PowerSignalSeen { .. } => "power-signal-seen",
            FloorEvent::UnitProduced { .. } => "production-unit-incremented",
            FloorEvent::MachineStateChanged { .. } => "machine-state-changed",
            FloorEvent::StoppageOpened { .. } => "stoppage-opened",
            FloorEvent::StoppageResolved { .. } => "stoppage-resolved",
            FloorEvent::StoppageRecorded { .. } => "stoppage-recorded",
            FloorEvent::AssignmentUpdated { .. } => "assignment-updated",
        }
    }
}

/// Generic event wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: FloorEvent,
}

/// Central event bus for pub/sub communication
pub struct EventBus {
    event_tx: broadcast::Sender<Event>,
    event_counter: std::sync::atomic::AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity);

        Self {
            event_tx,
            event_counter: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn publish(&self, payload: FloorEvent) {
        let id = self
            .event_counter
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let event = Event {
            id,
            timestamp: Utc::now(),
            payload,
        };
        let _ = self.event_tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Events published since startup
    pub fn published_count(&self) -> u64 {
        self.event_counter
            .load(std::sync::atomic::Ordering::Relaxed)
    }
}
