//! Signal module - PLC byte decoding, pin mapping, and ingest

mod ingest;
mod mapping;
mod simulator;

pub use ingest::{decode_signal_byte, IngestAck, SignalIngest};
pub use mapping::{Clock, MappingSource, SignalCache, SignalTimeouts, SystemClock, TimeoutOverrides};
pub use simulator::PlcSimulator;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a physical sensor measures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SensorKind {
    /// Machine main-power-present contact
    Power,
    /// One pulse per completed molding cycle
    UnitCycle,
    /// Wired but not interpreted by the state machine
    Other,
}

impl SensorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorKind::Power => "power",
            SensorKind::UnitCycle => "unit-cycle",
            SensorKind::Other => "other",
        }
    }

    pub fn parse(s: &str) -> SensorKind {
        match s {
            "power" => SensorKind::Power,
            "unit-cycle" | "unit_cycle" => SensorKind::UnitCycle,
            _ => SensorKind::Other,
        }
    }
}

/// A sensor as resolved from a pin mapping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorInfo {
    pub sensor_id: i64,
    pub kind: SensorKind,
    pub machine_id: i64,
}

/// One decoded per-pin signal value, ready for the signal log
#[derive(Debug, Clone)]
pub struct SignalRow {
    pub pin_id: String,
    pub sensor_id: i64,
    pub machine_id: i64,
    pub kind: SensorKind,
    pub value: bool,
    pub at: DateTime<Utc>,
}

/// Pin identifier for a digital-output bit index
pub fn pin_id_for_bit(bit: u8) -> String {
    format!("DO{}", bit)
}
