//! Core module - engine wiring and the event bus

mod engine;
mod event_bus;

pub use engine::Engine;
pub use event_bus::{Event, EventBus, FloorEvent};

use serde::{Deserialize, Serialize};

use crate::machines::MachineStatus;

/// System-wide state snapshot, served over the `status` command
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemState {
    pub running: bool,
    pub machines_tracked: usize,
    pub batches_ingested: u64,
    pub events_published: u64,
    pub uptime_seconds: u64,
    pub machines: Vec<MachineState>,
}

/// One machine's current computed status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineState {
    pub machine_id: i64,
    pub status: MachineStatus,
}
