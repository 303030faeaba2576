// Copyright (c) 2026 moldwatch maintainers
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/moldwatch/moldwatch-rs

//! Production ledger - per-machine, per-day, per-hour counters and the
//! stoppage episode lifecycle
//!
//! Hour slots are located-or-created on first activity (upsert semantics);
//! classification never creates rows. The state machine is the sole writer
//! of unit counts, running minutes, hour status, and the open/close
//! lifecycle of unclassified episodes; operators only classify.

use chrono::{DateTime, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::core::{EventBus, FloorEvent};
use crate::db::{Database, StoppageRow};

/// Caller-visible ledger failures, mapped to client errors by the API layer
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("no pending unclassified stoppage matches the request")]
    NoPendingStoppage,

    #[error("breakdown classification requires a numeric SAP notification id")]
    InvalidSapId,

    #[error("unknown stoppage reason '{0}'")]
    UnknownReason(String),

    #[error("unknown shift '{0}'")]
    UnknownShift(String),

    #[error("assignment requires an hour or a shift")]
    MissingHours,

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Fixed enumeration of stoppage reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoppageReason {
    Unclassified,
    Breakdown,
    MoldChange,
    MaterialShortage,
    Setup,
    Maintenance,
    NoOperator,
    Other,
}

impl StoppageReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoppageReason::Unclassified => "unclassified",
            StoppageReason::Breakdown => "breakdown",
            StoppageReason::MoldChange => "mold-change",
            StoppageReason::MaterialShortage => "material-shortage",
            StoppageReason::Setup => "setup",
            StoppageReason::Maintenance => "maintenance",
            StoppageReason::NoOperator => "no-operator",
            StoppageReason::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<StoppageReason> {
        match s {
            "unclassified" => Some(StoppageReason::Unclassified),
            "breakdown" => Some(StoppageReason::Breakdown),
            "mold-change" => Some(StoppageReason::MoldChange),
            "material-shortage" => Some(StoppageReason::MaterialShortage),
            "setup" => Some(StoppageReason::Setup),
            "maintenance" => Some(StoppageReason::Maintenance),
            "no-operator" => Some(StoppageReason::NoOperator),
            "other" => Some(StoppageReason::Other),
            _ => None,
        }
    }
}

/// Operator classification of a pending stoppage
#[derive(Debug, Clone, Deserialize)]
pub struct ClassifyRequest {
    pub machine_id: i64,
    pub day: NaiveDate,
    pub hour: u32,
    pub reason: String,
    #[serde(default)]
    pub description: String,
    pub duration_minutes: i64,
    /// Target episode; falls back to the hour's first pending episode
    pub stoppage_id: Option<String>,
    /// Required, numeric-only, when reason is breakdown
    pub sap_notification: Option<String>,
}

/// Operator/mold assignment and defect edit
#[derive(Debug, Clone, Deserialize)]
pub struct AssignRequest {
    pub machine_id: i64,
    pub day: NaiveDate,
    /// Single hour; mutually exclusive with `shift`
    pub hour: Option<u32>,
    /// Named shift to fan the edit out across
    pub shift: Option<String>,
    pub operator: Option<String>,
    pub mold_id: Option<i64>,
    pub defects: Option<i64>,
}

/// Append/upsert time-series of production counters and stoppage episodes
pub struct ProductionLedger {
    db: Arc<Database>,
    bus: Arc<EventBus>,
}

impl ProductionLedger {
    pub fn new(db: Arc<Database>, bus: Arc<EventBus>) -> Self {
        Self { db, bus }
    }

    /// One completed molding cycle: bump the hour's unit counter and mark it
    /// running. Returns the hour's new unit count.
    pub fn record_unit(&self, machine_id: i64, at: DateTime<Utc>) -> Result<i64, LedgerError> {
        let day = at.date_naive();
        let hour = at.hour();

        let units = self.db.increment_units(machine_id, day, hour)?;
        self.db.recompute_day_rollup(machine_id, day)?;

        self.bus.publish(FloorEvent::UnitProduced {
            machine_id,
            day,
            hour,
            units,
        });
        Ok(units)
    }

    /// One running minute for the hour containing `at`, capped at 60
    pub fn add_running_minute(&self, machine_id: i64, at: DateTime<Utc>) -> Result<i64, LedgerError> {
        let minutes = self
            .db
            .add_running_minute(machine_id, at.date_naive(), at.hour())?;
        Ok(minutes)
    }

    /// Open a new unclassified episode for the hour containing `at`
    pub fn open_stoppage(&self, machine_id: i64, at: DateTime<Utc>) -> Result<StoppageRow, LedgerError> {
        let day = at.date_naive();
        let hour = at.hour();

        let row = StoppageRow {
            id: Uuid::new_v4().to_string(),
            machine_id,
            day,
            hour,
            reason: StoppageReason::Unclassified.as_str().to_string(),
            description: String::new(),
            started_at: at,
            ended_at: None,
            duration_minutes: 0,
            pending: true,
            classified: false,
            sap_notification: None,
        };
        self.db.insert_stoppage(&row)?;
        self.db.mark_hour_status(machine_id, day, hour, "stoppage", true)?;

        debug!("Opened unclassified stoppage {} for machine {}", row.id, machine_id);
        self.bus.publish(FloorEvent::StoppageOpened {
            machine_id,
            stoppage_id: row.id.clone(),
            day,
            hour,
            at,
        });
        Ok(row)
    }

    /// Refresh an open episode's duration while it awaits classification
    pub fn refresh_stoppage(&self, stoppage_id: &str, minutes: i64) -> Result<(), LedgerError> {
        self.db
            .update_stoppage_duration(stoppage_id, minutes.clamp(0, 60))?;
        Ok(())
    }

    /// Automatic resolution: production resumed, the pending episode is
    /// removed and the hour goes back to running
    pub fn resolve_stoppage(
        &self,
        machine_id: i64,
        stoppage_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        if self.db.delete_stoppage(stoppage_id)? {
            self.db
                .mark_hour_status(machine_id, at.date_naive(), at.hour(), "running", true)?;
            self.bus.publish(FloorEvent::StoppageResolved {
                machine_id,
                stoppage_id: stoppage_id.to_string(),
                at,
            });
        }
        Ok(())
    }

    /// Mark the hour slot inactive, without creating it
    pub fn mark_hour_inactive(&self, machine_id: i64, at: DateTime<Utc>) -> Result<(), LedgerError> {
        self.db
            .mark_hour_status(machine_id, at.date_naive(), at.hour(), "inactive", false)?;
        Ok(())
    }

    /// Persist a machine's computed status
    pub fn set_machine_status(
        &self,
        machine_id: i64,
        status: &str,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        self.db.set_machine_status(machine_id, status, at)?;
        Ok(())
    }

    /// Classify a pending episode. Matches by id first, then falls back to
    /// the hour's first remaining pending unclassified episode; there is no
    /// create-on-miss here.
    pub fn classify(&self, req: &ClassifyRequest, at: DateTime<Utc>) -> Result<StoppageRow, LedgerError> {
        let reason = StoppageReason::parse(&req.reason)
            .ok_or_else(|| LedgerError::UnknownReason(req.reason.clone()))?;

        if reason == StoppageReason::Breakdown {
            validate_sap_id(req.sap_notification.as_deref())?;
        }

        let target = self.find_target(req)?.ok_or(LedgerError::NoPendingStoppage)?;

        let sap = if reason == StoppageReason::Breakdown {
            req.sap_notification.as_deref()
        } else {
            None
        };
        self.db.classify_stoppage(
            &target.id,
            reason.as_str(),
            &req.description,
            req.duration_minutes.clamp(0, 60),
            sap,
            at,
        )?;

        let row = self
            .db
            .get_stoppage(&target.id)?
            .ok_or(LedgerError::NoPendingStoppage)?;

        self.bus.publish(FloorEvent::StoppageRecorded {
            machine_id: req.machine_id,
            stoppage_id: row.id.clone(),
            reason: row.reason.clone(),
            at,
        });
        Ok(row)
    }

    fn find_target(&self, req: &ClassifyRequest) -> Result<Option<StoppageRow>, LedgerError> {
        if let Some(id) = &req.stoppage_id {
            if let Some(row) = self.db.get_stoppage(id)? {
                if row.machine_id == req.machine_id && row.pending && !row.classified {
                    return Ok(Some(row));
                }
            }
        }
        let mut pending = self
            .db
            .pending_unclassified(req.machine_id, req.day, req.hour)?;
        if pending.is_empty() {
            Ok(None)
        } else {
            Ok(Some(pending.remove(0)))
        }
    }

    /// Apply an assignment/defect edit to one hour or a whole shift window
    pub fn assign(&self, req: &AssignRequest, hours: &[u32]) -> Result<(), LedgerError> {
        for &hour in hours {
            self.db.assign_hour(
                req.machine_id,
                req.day,
                hour,
                req.operator.as_deref(),
                req.mold_id,
                req.defects,
            )?;
        }
        if req.defects.is_some() {
            self.db.recompute_day_rollup(req.machine_id, req.day)?;
        }

        self.bus.publish(FloorEvent::AssignmentUpdated {
            machine_id: req.machine_id,
            day: req.day,
            hours: hours.to_vec(),
        });
        Ok(())
    }
}

/// Breakdown episodes carry a SAP notification id, digits only
fn validate_sap_id(sap: Option<&str>) -> Result<(), LedgerError> {
    match sap {
        Some(id) if !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()) => Ok(()),
        _ => Err(LedgerError::InvalidSapId),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn setup() -> (ProductionLedger, Arc<Database>) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let bus = Arc::new(EventBus::new(64));
        (ProductionLedger::new(db.clone(), bus), db)
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 27, hour, minute, 0).unwrap()
    }

    fn classify_req(ledger_day: NaiveDate, hour: u32, reason: &str) -> ClassifyRequest {
        ClassifyRequest {
            machine_id: 1,
            day: ledger_day,
            hour,
            reason: reason.to_string(),
            description: "jam at ejector".to_string(),
            duration_minutes: 12,
            stoppage_id: None,
            sap_notification: None,
        }
    }

    #[test]
    fn test_classify_matches_by_id() {
        let (ledger, _db) = setup();
        let open = ledger.open_stoppage(1, at(9, 5)).unwrap();

        let mut req = classify_req(at(9, 5).date_naive(), 9, "setup");
        req.stoppage_id = Some(open.id.clone());

        let row = ledger.classify(&req, at(9, 20)).unwrap();
        assert_eq!(row.id, open.id);
        assert_eq!(row.reason, "setup");
        assert!(row.classified);
        assert!(!row.pending);
    }

    #[test]
    fn test_classify_falls_back_to_first_pending() {
        let (ledger, _db) = setup();
        let first = ledger.open_stoppage(1, at(9, 5)).unwrap();

        let mut req = classify_req(at(9, 5).date_naive(), 9, "maintenance");
        req.stoppage_id = Some("no-such-id".to_string());

        let row = ledger.classify(&req, at(9, 30)).unwrap();
        assert_eq!(row.id, first.id);
    }

    #[test]
    fn test_classify_without_pending_is_not_found() {
        let (ledger, _db) = setup();
        let req = classify_req(at(9, 5).date_naive(), 9, "setup");

        match ledger.classify(&req, at(9, 30)) {
            Err(LedgerError::NoPendingStoppage) => {}
            other => panic!("expected NoPendingStoppage, got {:?}", other.map(|r| r.id)),
        }
    }

    #[test]
    fn test_breakdown_requires_numeric_sap_id() {
        let (ledger, _db) = setup();
        ledger.open_stoppage(1, at(9, 5)).unwrap();

        let mut req = classify_req(at(9, 5).date_naive(), 9, "breakdown");
        req.sap_notification = Some("12A".to_string());
        assert!(matches!(
            ledger.classify(&req, at(9, 30)),
            Err(LedgerError::InvalidSapId)
        ));

        req.sap_notification = None;
        assert!(matches!(
            ledger.classify(&req, at(9, 30)),
            Err(LedgerError::InvalidSapId)
        ));

        req.sap_notification = Some("12345".to_string());
        let row = ledger.classify(&req, at(9, 30)).unwrap();
        assert_eq!(row.sap_notification.as_deref(), Some("12345"));
    }

    #[test]
    fn test_rejected_sap_id_writes_nothing() {
        let (ledger, db) = setup();
        let open = ledger.open_stoppage(1, at(9, 5)).unwrap();

        let mut req = classify_req(at(9, 5).date_naive(), 9, "breakdown");
        req.sap_notification = Some("not-numeric".to_string());
        let _ = ledger.classify(&req, at(9, 30));

        let row = db.get_stoppage(&open.id).unwrap().unwrap();
        assert_eq!(row.reason, "unclassified");
        assert!(row.pending);
    }

    #[test]
    fn test_refresh_never_touches_classified_episode() {
        let (ledger, db) = setup();
        let open = ledger.open_stoppage(1, at(9, 5)).unwrap();

        let mut req = classify_req(at(9, 5).date_naive(), 9, "setup");
        req.stoppage_id = Some(open.id.clone());
        ledger.classify(&req, at(9, 20)).unwrap();

        // A tick that raced the classification still holds the pending
        // reference; its refresh must not overwrite the operator's duration
        ledger.refresh_stoppage(&open.id, 40).unwrap();

        let row = db.get_stoppage(&open.id).unwrap().unwrap();
        assert_eq!(row.duration_minutes, 12);
        assert!(row.classified);
    }

    #[test]
    fn test_resolve_removes_episode_and_marks_hour_running() {
        let (ledger, db) = setup();
        let open = ledger.open_stoppage(1, at(9, 5)).unwrap();

        ledger.resolve_stoppage(1, &open.id, at(9, 12)).unwrap();

        assert!(db.get_stoppage(&open.id).unwrap().is_none());
        let day = at(9, 12).date_naive();
        let entries = db.hour_entries_in_range(1, day, day).unwrap();
        assert_eq!(entries[0].status, "running");
    }

    #[test]
    fn test_unknown_reason_rejected() {
        let (ledger, _db) = setup();
        ledger.open_stoppage(1, at(9, 5)).unwrap();

        let req = classify_req(at(9, 5).date_naive(), 9, "gremlins");
        assert!(matches!(
            ledger.classify(&req, at(9, 30)),
            Err(LedgerError::UnknownReason(_))
        ));
    }
}
