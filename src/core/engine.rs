//! Main engine - wires ingest, the state machine, the ledger, and metrics

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::{EventBus, MachineState, SystemState};
use crate::config::Config;
use crate::db::{Database, StoppageRow};
use crate::ledger::{AssignRequest, ClassifyRequest, LedgerError, ProductionLedger};
use crate::machines::MachineMonitor;
use crate::metrics::{MetricsQuery, MetricsResponse, ReliabilityCalculator, ShiftWindow};
use crate::signals::{decode_signal_byte, IngestAck, SignalCache, SignalIngest, SignalTimeouts};

/// Main moldwatch engine
pub struct Engine {
    pub config: Arc<Config>,
    db: Arc<Database>,
    bus: Arc<EventBus>,
    monitor: Arc<MachineMonitor>,
    ledger: Arc<ProductionLedger>,
    ingest: Arc<SignalIngest>,
    calculator: ReliabilityCalculator,
    shifts: Vec<ShiftWindow>,
    batches: AtomicU64,
    start_time: Instant,
}

impl Engine {
    pub fn new(config: Config, db: Arc<Database>) -> Result<Arc<Self>> {
        config.signals.validate()?;
        let shifts = ShiftWindow::from_config(&config.shifts)?;
        let config = Arc::new(config);

        let bus = Arc::new(EventBus::new(1024));
        let cache = Arc::new(SignalCache::new(
            db.clone(),
            SignalTimeouts::from_minutes(
                config.signals.power_timeout_minutes,
                config.signals.cycle_timeout_minutes,
            ),
            Duration::from_secs(config.signals.cache_ttl_secs),
        ));
        let ledger = Arc::new(ProductionLedger::new(db.clone(), bus.clone()));
        let monitor = Arc::new(MachineMonitor::new(ledger.clone(), cache.clone(), bus.clone()));
        let ingest = Arc::new(SignalIngest::new(cache, monitor.clone(), db.clone()));
        let calculator = ReliabilityCalculator::new(db.clone(), shifts.clone());

        Ok(Arc::new(Self {
            config,
            db,
            bus,
            monitor,
            ledger,
            ingest,
            calculator,
            shifts,
            batches: AtomicU64::new(0),
            start_time: Instant::now(),
        }))
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    /// Raw ingest pipeline, used by the demo simulator
    pub fn signal_ingest(&self) -> Arc<SignalIngest> {
        self.ingest.clone()
    }

    /// Rebuild runtime state and spawn the periodic tick and retention tasks
    pub async fn start(&self, shutdown: &broadcast::Sender<()>) -> Result<()> {
        info!("Starting moldwatch engine...");

        self.monitor.rehydrate(&self.db).await?;

        let monitor = self.monitor.clone();
        let tick = Duration::from_secs(self.config.signals.tick_interval_secs);
        let rx = shutdown.subscribe();
        tokio::spawn(async move {
            monitor.run(tick, rx).await;
        });

        let db = self.db.clone();
        let retention_days = self.config.database.retention_days;
        let mut rx = shutdown.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(24 * 3600));
            interval.tick().await; // first cleanup after a full period
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = db.cleanup(retention_days) {
                            warn!("Signal-log cleanup failed: {}", e);
                        }
                    }
                    _ = rx.recv() => break,
                }
            }
        });

        info!("moldwatch engine started");
        Ok(())
    }

    /// Ingest endpoint: hex byte plus optional timestamp
    pub async fn ingest_hex(&self, byte: &str, at: Option<DateTime<Utc>>) -> Result<IngestAck> {
        let byte = decode_signal_byte(byte)?;
        let ack = self.ingest.ingest(byte, at).await?;
        self.batches.fetch_add(1, Ordering::Relaxed);
        Ok(ack)
    }

    /// Classification endpoint
    pub async fn classify(&self, req: &ClassifyRequest) -> Result<StoppageRow, LedgerError> {
        let row = self.ledger.classify(req, Utc::now())?;
        self.monitor.clear_pending(req.machine_id, &row.id).await;
        Ok(row)
    }

    /// Assignment endpoint; `shift` fans the edit across the shift's hours
    pub fn assign(&self, req: &AssignRequest) -> Result<Vec<u32>, LedgerError> {
        let hours: Vec<u32> = match (&req.hour, &req.shift) {
            (Some(hour), _) => vec![*hour],
            (None, Some(name)) => {
                let window = self
                    .shifts
                    .iter()
                    .find(|w| w.name == *name)
                    .ok_or_else(|| LedgerError::UnknownShift(name.clone()))?;
                (0..24).filter(|h| window.contains(*h)).collect()
            }
            (None, None) => return Err(LedgerError::MissingHours),
        };

        self.ledger.assign(req, &hours)?;
        Ok(hours)
    }

    /// Metrics query endpoint
    pub fn metrics(&self, query: &MetricsQuery) -> Result<MetricsResponse> {
        self.calculator.query(query)
    }

    pub async fn state(&self) -> SystemState {
        let statuses = self.monitor.statuses().await;
        let mut machines: Vec<MachineState> = statuses
            .into_iter()
            .map(|(machine_id, status)| MachineState { machine_id, status })
            .collect();
        machines.sort_by_key(|m| m.machine_id);

        SystemState {
            running: true,
            machines_tracked: machines.len(),
            batches_ingested: self.batches.load(Ordering::Relaxed),
            events_published: self.bus.published_count(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            machines,
        }
    }
}
