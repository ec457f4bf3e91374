use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use uuid::Uuid;

use crate::events::{DashboardEvent, EventBus};
use crate::serial::state::ConnectionState;

use super::registers::RegisterBank;
use super::state::{ReadingRecord, RecordLayout, RecorderSnapshot, RecorderState, StopReason};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info};

/// Owns the session timeline: the elapsed clock, the sampler, and both buffers.
///
/// The sampler is the only producer of [`ReadingRecord`]s. It copies whatever
/// the registers hold at each tick and only records while the link is
/// `ConnectedReading`.
#[derive(Clone)]
pub struct SessionRecorder {
    state: Arc<Mutex<RecorderState>>,
    registers: RegisterBank,
    connection: watch::Receiver<ConnectionState>,
    events: EventBus,
    sampler: Arc<Mutex<Option<JoinHandle<()>>>>,
    tick_interval: Duration,
}

impl SessionRecorder {
    pub fn new(
        layout: RecordLayout,
        tick_interval: Duration,
        registers: RegisterBank,
        connection: watch::Receiver<ConnectionState>,
        events: EventBus,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(RecorderState::new(layout))),
            registers,
            connection,
            events,
            sampler: Arc::new(Mutex::new(None)),
            tick_interval: tick_interval.max(Duration::from_millis(1)),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    pub async fn is_recording(&self) -> bool {
        self.state.lock().await.is_recording()
    }

    pub async fn snapshot(&self) -> RecorderSnapshot {
        self.state.lock().await.snapshot(Instant::now())
    }

    /// Starts a session. Calling it while already recording changes nothing:
    /// the epoch, buffers and baseline of the running session are kept.
    pub async fn start(&self) -> RecorderSnapshot {
        let session_id = {
            let mut state = self.state.lock().await;
            if state.is_recording() {
                log_debug!("start ignored: session already recording");
                return state.snapshot(Instant::now());
            }

            let session_id = Uuid::new_v4().to_string();
            let baseline = self.registers.snapshot();
            state.begin_session(session_id.clone(), Utc::now(), Instant::now(), baseline);
            session_id
        };

        self.spawn_sampler().await;
        log_info!("=== Starting recording session {} ===", session_id);
        self.events
            .emit(DashboardEvent::RecordingStarted { session_id });
        self.snapshot().await
    }

    /// Ends the session on operator request. No-op when idle.
    pub async fn stop(&self) -> RecorderSnapshot {
        self.finish(StopReason::User).await;
        self.snapshot().await
    }

    /// Ends the session because the link went away.
    pub async fn force_stop(&self) -> bool {
        self.finish(StopReason::ConnectionLost).await
    }

    /// Start when idle, stop when recording.
    pub async fn toggle(&self) -> RecorderSnapshot {
        if self.is_recording().await {
            self.stop().await
        } else {
            self.start().await
        }
    }

    async fn finish(&self, reason: StopReason) -> bool {
        let stopped = {
            let mut state = self.state.lock().await;
            if state.stop(Utc::now(), reason) {
                Some((
                    state.session_id.clone().unwrap_or_default(),
                    state.recorded().len(),
                ))
            } else {
                None
            }
        };

        let Some((session_id, samples)) = stopped else {
            return false;
        };

        self.cancel_sampler().await;
        log_info!(
            "=== Recording session {} ended ({:?}): collected {} data points ===",
            session_id,
            reason,
            samples
        );
        self.events.emit(DashboardEvent::RecordingStopped {
            session_id,
            samples,
            forced: reason == StopReason::ConnectionLost,
        });
        true
    }

    /// Takes one sample now. Returns the record appended, if any.
    pub async fn tick(&self) -> Option<ReadingRecord> {
        if !self.connection.borrow().is_reading() {
            return None;
        }
        let regs = self.registers.snapshot();
        let record = self.state.lock().await.sample(Instant::now(), &regs)?;
        self.events.emit(DashboardEvent::Sampled {
            record: record.clone(),
        });
        Some(record)
    }

    /// Copy of the unbounded session buffer, for export.
    pub async fn recorded(&self) -> Vec<ReadingRecord> {
        self.state.lock().await.recorded().to_vec()
    }

    /// Copy of the most recent records, oldest first, for charting.
    pub async fn live_window(&self) -> Vec<ReadingRecord> {
        self.state.lock().await.live().cloned().collect()
    }

    async fn spawn_sampler(&self) {
        let mut sampler_guard = self.sampler.lock().await;
        if let Some(handle) = sampler_guard.take() {
            handle.abort();
        }

        let recorder = self.clone();
        let period = self.tick_interval;
        // First sample lands one period after start, never at t = 0.
        let first_tick = Instant::now() + period;

        let handle = tokio::spawn(async move {
            let mut interval = time::interval_at(first_tick, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if !recorder.is_recording().await {
                    break;
                }
                recorder.tick().await;
            }
            log_debug!("sampler exited");
        });

        *sampler_guard = Some(handle);
    }

    async fn cancel_sampler(&self) {
        if let Some(handle) = self.sampler.lock().await.take() {
            handle.abort();
        }
    }
}
