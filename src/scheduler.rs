use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use parking_lot::Mutex;
use tracing::{error, info};

use crate::{
    backfill::BackfillEngine,
    config::Config,
    error::{Result, SyncError},
    live::LiveSyncProcessor,
    monitor::{EntityPhase, StatusRegistry},
};

/// Cooperative shutdown flag shared by every lane. Lanes poll it between
/// windows and ticks; nothing is interrupted mid-write.
#[derive(Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleep up to `duration`, waking early when the signal fires.
    pub fn sleep(&self, duration: Duration) {
        let slice = Duration::from_millis(50);
        let mut remaining = duration;
        while !self.is_set() && !remaining.is_zero() {
            let nap = remaining.min(slice);
            thread::sleep(nap);
            remaining = remaining.saturating_sub(nap);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Drain history up to the live boundary, then exit.
    Backfill,
    /// Poll the live edge only.
    Live,
    /// Backfill and live sync side by side; the boundary keeps their ranges
    /// disjoint.
    Concurrent,
}

impl RunMode {
    fn backfills(self) -> bool {
        matches!(self, Self::Backfill | Self::Concurrent)
    }

    fn polls_live(self) -> bool {
        matches!(self, Self::Live | Self::Concurrent)
    }
}

/// Fans the configured entities out over a bounded set of worker lanes.
/// Backfill lanes pull entities from a shared queue; live sync gets one
/// thread per entity since each spends most of its time sleeping.
pub struct WorkerScheduler {
    entities: Vec<String>,
    lanes: usize,
    report_interval: Duration,
    engine: Arc<BackfillEngine>,
    live: Arc<LiveSyncProcessor>,
    status: StatusRegistry,
    stop: StopSignal,
}

impl WorkerScheduler {
    pub fn new(
        config: &Config,
        engine: Arc<BackfillEngine>,
        live: Arc<LiveSyncProcessor>,
        status: StatusRegistry,
        stop: StopSignal,
    ) -> Self {
        Self {
            entities: config.entities.clone(),
            lanes: config.lane_count(),
            report_interval: Duration::from_secs(60),
            engine,
            live,
            status,
            stop,
        }
    }

    pub fn run(&self, mode: RunMode) -> Result<()> {
        if self.entities.is_empty() {
            return Err(SyncError::Config("no entities configured".into()));
        }

        // Seed every live mark before any lane starts. The seed is the
        // durable boundary between backfill and live ranges; both modes
        // depend on it existing first.
        for entity in &self.entities {
            self.status.set_phase(entity, EntityPhase::Pending);
            self.live.seed(entity)?;
        }

        let queue: Mutex<VecDeque<String>> =
            Mutex::new(self.entities.iter().cloned().collect());
        let errors: Mutex<Vec<(String, SyncError)>> = Mutex::new(Vec::new());

        info!(
            entities = self.entities.len(),
            lanes = self.lanes,
            ?mode,
            "scheduler starting"
        );

        thread::scope(|scope| {
            let mut backfill_lanes = Vec::new();
            if mode.backfills() {
                for lane in 0..self.lanes {
                    let queue = &queue;
                    let errors = &errors;
                    backfill_lanes.push(scope.spawn(move || {
                        self.backfill_lane(lane, queue, errors);
                    }));
                }
            }

            let mut live_lanes = Vec::new();
            if mode.polls_live() {
                for entity in &self.entities {
                    let errors = &errors;
                    live_lanes.push(scope.spawn(move || {
                        if let Err(err) = self.live.run_entity(entity) {
                            error!(entity = %entity, error = %err, "live sync lane failed");
                            errors.lock().push((entity.clone(), err));
                        }
                    }));
                }
            }

            // The main thread doubles as the progress reporter.
            let mut since_report = Duration::ZERO;
            loop {
                let all_done = backfill_lanes.iter().all(|lane| lane.is_finished())
                    && live_lanes.iter().all(|lane| lane.is_finished());
                if all_done {
                    break;
                }
                let nap = Duration::from_millis(200);
                self.stop.sleep(nap);
                since_report += nap;
                if since_report >= self.report_interval {
                    self.status.log_summary();
                    since_report = Duration::ZERO;
                }
            }

            for lane in backfill_lanes.into_iter().chain(live_lanes) {
                if lane.join().is_err() {
                    error!("worker lane panicked");
                }
            }
        });

        if mode == RunMode::Backfill {
            for entity in &self.entities {
                self.status.set_phase(entity, EntityPhase::Done);
            }
        }
        self.status.log_summary();

        let first = errors.lock().drain(..).next();
        match first {
            Some((entity, err)) => {
                error!(entity, error = %err, "scheduler finished with errors");
                Err(err)
            }
            None => {
                info!("scheduler finished");
                Ok(())
            }
        }
    }

    fn backfill_lane(
        &self,
        lane: usize,
        queue: &Mutex<VecDeque<String>>,
        errors: &Mutex<Vec<(String, SyncError)>>,
    ) {
        loop {
            if self.stop.is_set() {
                return;
            }
            let Some(entity) = queue.lock().pop_front() else {
                return;
            };
            info!(lane, entity = %entity, "backfill lane picked up entity");
            if let Err(err) = self.engine.run_entity(&entity) {
                error!(lane, entity = %entity, error = %err, "backfill failed");
                errors.lock().push((entity, err));
            }
        }
    }
}
