//! Port lifecycle: acquire, read loop, bounded retry, teardown, reconnect.
//!
//! A single worker task owns the inbound half of the link. It feeds the line
//! reassembler and extractor, and is the only writer of the registers. The
//! outbound half sits behind a lock so commands can be sent from anywhere.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
    time,
};
use tokio_util::sync::CancellationToken;

use super::link::{ChunkSource, CommandSink, PortLink, PortProvider, ReadOutcome};
use super::state::ConnectionState;
use crate::commands::DeviceCommand;
use crate::error::{DashError, Result};
use crate::events::{DashboardEvent, EventBus};
use crate::parsing::{ExtractorConfig, LineGrammar, LineReassembler, ReadingExtractor};
use crate::recording::{RegisterBank, SessionRecorder};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Consecutive transient errors tolerated before the link is declared dead.
    pub max_read_retries: u32,
    pub retry_backoff: Duration,
    pub reconnect_delay: Duration,
    pub auto_reconnect: bool,
    /// `None` keeps trying until cancelled.
    pub max_reconnect_attempts: Option<u32>,
    pub extractor: ExtractorConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_read_retries: 3,
            retry_backoff: Duration::from_millis(500),
            reconnect_delay: Duration::from_secs(3),
            auto_reconnect: true,
            max_reconnect_attempts: None,
            extractor: ExtractorConfig::default(),
        }
    }
}

/// How a read loop ended.
enum LinkEnd {
    Cancelled,
    Lost(DashError),
}

struct Worker {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct ConnectionSupervisor {
    provider: Arc<dyn PortProvider>,
    grammar: LineGrammar,
    config: SupervisorConfig,
    registers: RegisterBank,
    recorder: SessionRecorder,
    events: EventBus,
    state: Arc<watch::Sender<ConnectionState>>,
    writer: Arc<Mutex<Option<Box<dyn CommandSink>>>>,
    link_description: Arc<Mutex<Option<String>>>,
    worker: Arc<Mutex<Option<Worker>>>,
}

impl ConnectionSupervisor {
    pub fn new(
        provider: Arc<dyn PortProvider>,
        grammar: LineGrammar,
        config: SupervisorConfig,
        registers: RegisterBank,
        recorder: SessionRecorder,
        events: EventBus,
        state: watch::Sender<ConnectionState>,
    ) -> Self {
        Self {
            provider,
            grammar,
            config,
            registers,
            recorder,
            events,
            state: Arc::new(state),
            writer: Arc::new(Mutex::new(None)),
            link_description: Arc::new(Mutex::new(None)),
            worker: Arc::new(Mutex::new(None)),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub async fn link_description(&self) -> Option<String> {
        self.link_description.lock().await.clone()
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            log_debug!("connection state -> {:?}", next);
            self.events
                .emit(DashboardEvent::ConnectionChanged { state: next });
        }
    }

    /// Acquires a port and starts the read loop. A failure here is returned to
    /// the caller and not retried. Connecting while a link is live is a no-op.
    pub async fn connect(&self) -> Result<()> {
        let mut worker_guard = self.worker.lock().await;
        if let Some(worker) = worker_guard.as_ref() {
            if !worker.handle.is_finished() {
                log_debug!("connect ignored: supervisor already running");
                return Ok(());
            }
        }

        self.set_state(ConnectionState::Connecting);
        let link = match self.provider.acquire().await {
            Ok(link) => link,
            Err(err) => {
                self.set_state(ConnectionState::Disconnected);
                log_warn!("connect failed: {}", err);
                return Err(err);
            }
        };

        let cancel = CancellationToken::new();
        let supervisor = self.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { supervisor.supervise(link, token).await });

        *worker_guard = Some(Worker { handle, cancel });
        Ok(())
    }

    /// Writes one command byte. Nothing is awaited from the device.
    pub async fn send_command(&self, command: DeviceCommand) -> Result<()> {
        if !self.state().is_connected() {
            return Err(DashError::NotConnected);
        }
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(DashError::NotConnected)?;
        writer
            .write(&[command.byte()])
            .await
            .map_err(|err| match err {
                kept @ (DashError::NotConnected | DashError::Command(_)) => kept,
                other => DashError::Command(other.to_string()),
            })?;
        log_info!("sent {:?} command", command);
        Ok(())
    }

    /// Stops the worker, releasing both halves of the link. Teardown problems
    /// are logged and swallowed.
    pub async fn shutdown(&self) {
        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            worker.cancel.cancel();
            if let Err(err) = worker.handle.await {
                log_warn!("read loop task failed to join: {}", err);
            }
        }
        if self.recorder.force_stop().await {
            log_info!("recording stopped by disconnect");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    async fn supervise(self, first: PortLink, cancel: CancellationToken) {
        let mut next = Some(first);

        while let Some(link) = next.take() {
            match self.run_link(link, &cancel).await {
                LinkEnd::Cancelled => break,
                LinkEnd::Lost(err) => {
                    if !self.config.auto_reconnect || cancel.is_cancelled() {
                        break;
                    }
                    log_warn!("link lost ({}); reconnecting", err);
                    next = self.reacquire(&cancel).await;
                }
            }
        }

        if next.is_none() && !cancel.is_cancelled() {
            self.set_state(ConnectionState::Disconnected);
        }
        log_info!("supervisor stopped");
    }

    async fn run_link(&self, link: PortLink, cancel: &CancellationToken) -> LinkEnd {
        let PortLink {
            description,
            mut reader,
            writer,
        } = link;

        *self.writer.lock().await = Some(writer);
        *self.link_description.lock().await = Some(description.clone());
        self.registers.reset();
        let mut extractor = ReadingExtractor::new(self.grammar.clone(), self.config.extractor);
        let mut reassembler = LineReassembler::new();

        self.set_state(ConnectionState::ConnectedIdle);
        log_info!("read loop started on {}", description);
        self.set_state(ConnectionState::ConnectedReading);

        let mut transient_failures: u32 = 0;
        let end = loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => break LinkEnd::Cancelled,
                outcome = reader.next_chunk() => outcome,
            };

            match outcome {
                ReadOutcome::Data(bytes) => {
                    transient_failures = 0;
                    for line in reassembler.push(&bytes) {
                        self.ingest(&mut extractor, &line);
                    }
                }
                ReadOutcome::Transient(msg) => {
                    let err = DashError::TransientRead(msg);
                    transient_failures += 1;
                    if transient_failures > self.config.max_read_retries {
                        break LinkEnd::Lost(DashError::FatalRead(format!(
                            "giving up after {} retries: {}",
                            self.config.max_read_retries, err
                        )));
                    }
                    log_warn!(
                        "{} ({}/{})",
                        err,
                        transient_failures,
                        self.config.max_read_retries
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break LinkEnd::Cancelled,
                        _ = time::sleep(self.config.retry_backoff) => {}
                    }
                }
                ReadOutcome::Closed => {
                    break LinkEnd::Lost(DashError::FatalRead("stream closed".into()))
                }
                ReadOutcome::Failed(msg) => break LinkEnd::Lost(DashError::FatalRead(msg)),
            }
        };

        let lost = reassembler.discard();
        if lost > 0 {
            log_debug!("discarded {} bytes of unterminated input", lost);
        }

        if let LinkEnd::Lost(err) = &end {
            log_error!("{} on {}", err, description);
            self.set_state(ConnectionState::Disconnected);
            self.events.report_error(err);
            if self.recorder.force_stop().await {
                log_warn!("recording force-stopped by connection loss");
            }
        }

        self.release(reader).await;
        end
    }

    fn ingest(&self, extractor: &mut ReadingExtractor, line: &str) {
        let changes = self
            .registers
            .update(|regs| extractor.process_line(line, regs));
        for change in changes {
            self.events.emit(DashboardEvent::ReadingChanged { change });
        }
    }

    async fn release(&self, mut reader: Box<dyn ChunkSource>) {
        if let Err(err) = reader.release().await {
            log_warn!("failed to release reader: {:#}", err);
        }
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(err) = writer.release().await {
                log_warn!("failed to release writer: {:#}", err);
            }
        }
        *self.link_description.lock().await = None;
    }

    async fn reacquire(&self, cancel: &CancellationToken) -> Option<PortLink> {
        let mut attempts: u32 = 0;
        loop {
            if let Some(max) = self.config.max_reconnect_attempts {
                if attempts >= max {
                    log_warn!("giving up after {} reconnect attempts", attempts);
                    return None;
                }
            }
            attempts += 1;

            self.set_state(ConnectionState::Reconnecting);
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = time::sleep(self.config.reconnect_delay) => {}
            }

            self.set_state(ConnectionState::Connecting);
            match self.provider.acquire().await {
                Ok(link) => {
                    log_info!("reconnected after {} attempt(s)", attempts);
                    return Some(link);
                }
                Err(err) => {
                    log_warn!("reconnect attempt {} failed: {}", attempts, err);
                    self.events.report_error(&err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::RecordLayout;
    use crate::serial::mock::{ScriptStep, ScriptedProvider};

    const WAIT: Duration = Duration::from_secs(60);

    struct Rig {
        supervisor: ConnectionSupervisor,
        recorder: SessionRecorder,
        registers: RegisterBank,
        events: EventBus,
        provider: ScriptedProvider,
    }

    fn rig(config: SupervisorConfig) -> Rig {
        let provider = ScriptedProvider::new();
        let registers = RegisterBank::new();
        let events = EventBus::new();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let recorder = SessionRecorder::new(
            RecordLayout::default(),
            Duration::from_millis(100),
            registers.clone(),
            state_rx,
            events.clone(),
        );
        let supervisor = ConnectionSupervisor::new(
            Arc::new(provider.clone()),
            LineGrammar::compile().unwrap(),
            config,
            registers.clone(),
            recorder.clone(),
            events.clone(),
            state_tx,
        );
        Rig {
            supervisor,
            recorder,
            registers,
            events,
            provider,
        }
    }

    async fn wait_for_state(supervisor: &ConnectionSupervisor, target: ConnectionState) {
        let mut rx = supervisor.subscribe_state();
        time::timeout(WAIT, rx.wait_for(|s| *s == target))
            .await
            .expect("timed out waiting for state")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_is_surfaced_not_retried() {
        let rig = rig(SupervisorConfig::default());
        rig.provider.push_refusal("user cancelled port selection");

        let err = rig.supervisor.connect().await.unwrap_err();
        assert!(matches!(err, DashError::Connection(_)));
        assert_eq!(rig.supervisor.state(), ConnectionState::Disconnected);

        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(rig.provider.acquisitions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lines_split_mid_line_reach_registers() {
        let rig = rig(SupervisorConfig::default());
        rig.provider.push_link(vec![
            ScriptStep::data(b"Current: 10.0\nPsi: 2"),
            ScriptStep::data(b"5.0\n"),
        ]);
        let mut regs_rx = rig.registers.subscribe();

        rig.supervisor.connect().await.unwrap();
        time::timeout(WAIT, regs_rx.wait_for(|r| r.secondary == 25.0))
            .await
            .unwrap()
            .unwrap();

        let regs = rig.registers.snapshot();
        assert_eq!(regs.primary, 10.0);
        assert_eq!(rig.supervisor.state(), ConnectionState::ConnectedReading);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_within_budget_keep_link() {
        let rig = rig(SupervisorConfig::default());
        rig.provider.push_link(vec![
            ScriptStep::transient("framing error"),
            ScriptStep::transient("framing error"),
            ScriptStep::transient("framing error"),
            ScriptStep::data(b"Psi: 4.0\n"),
        ]);
        let mut regs_rx = rig.registers.subscribe();

        rig.supervisor.connect().await.unwrap();
        time::timeout(WAIT, regs_rx.wait_for(|r| r.secondary == 4.0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rig.supervisor.state(), ConnectionState::ConnectedReading);
        assert_eq!(rig.provider.acquisitions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhaustion_is_fatal() {
        let rig = rig(SupervisorConfig {
            auto_reconnect: false,
            ..SupervisorConfig::default()
        });
        rig.provider.push_link(vec![ScriptStep::transient("framing error"); 4]);

        let started = time::Instant::now();
        rig.supervisor.connect().await.unwrap();
        wait_for_state(&rig.supervisor, ConnectionState::ConnectedReading).await;
        wait_for_state(&rig.supervisor, ConnectionState::Disconnected).await;

        assert!(started.elapsed() >= Duration::from_millis(1500));
        let error = rig.events.latest_error().unwrap();
        assert_eq!(
            error.message,
            "Read error: giving up after 3 retries: Transient read error: framing error"
        );
        assert_eq!(rig.provider.releases(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_loss_stops_recording_and_reconnects() {
        let rig = rig(SupervisorConfig::default());
        rig.provider
            .push_link(vec![
                ScriptStep::data(b"Psi: 9.0\n"),
                ScriptStep::Delay(Duration::from_millis(250)),
                ScriptStep::closed(),
            ])
            .push_link(vec![]);

        rig.supervisor.connect().await.unwrap();
        wait_for_state(&rig.supervisor, ConnectionState::ConnectedReading).await;
        rig.recorder.start().await;

        wait_for_state(&rig.supervisor, ConnectionState::Reconnecting).await;
        assert!(!rig.recorder.is_recording().await);
        assert_eq!(rig.registers.snapshot().secondary, 9.0);
        assert_eq!(
            rig.events.latest_error().unwrap().message,
            "Read error: stream closed"
        );

        let lost_at = time::Instant::now();
        wait_for_state(&rig.supervisor, ConnectionState::ConnectedReading).await;
        assert!(lost_at.elapsed() >= Duration::from_secs(3));
        assert_eq!(rig.provider.acquisitions(), 2);
        assert_eq!(rig.registers.snapshot().secondary, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_gives_up_after_attempt_cap() {
        let rig = rig(SupervisorConfig {
            max_reconnect_attempts: Some(2),
            ..SupervisorConfig::default()
        });
        rig.provider
            .push_link(vec![ScriptStep::failed("device unplugged")])
            .push_refusal("device not found")
            .push_refusal("device not found");

        rig.supervisor.connect().await.unwrap();
        time::sleep(Duration::from_secs(30)).await;

        assert_eq!(rig.supervisor.state(), ConnectionState::Disconnected);
        assert_eq!(rig.provider.acquisitions(), 3);
        assert_eq!(
            rig.events.latest_error().unwrap().message,
            "Failed to connect: device not found"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_command_writes_single_byte() {
        let rig = rig(SupervisorConfig::default());
        assert!(matches!(
            rig.supervisor.send_command(DeviceCommand::Tare).await,
            Err(DashError::NotConnected)
        ));

        rig.provider.push_link(vec![]);
        rig.supervisor.connect().await.unwrap();
        wait_for_state(&rig.supervisor, ConnectionState::ConnectedReading).await;

        rig.supervisor.send_command(DeviceCommand::Tare).await.unwrap();
        rig.supervisor
            .send_command(DeviceCommand::Calibrate)
            .await
            .unwrap();
        assert_eq!(rig.provider.written(), b"tc".to_vec());

        rig.provider.set_fail_writes(true);
        assert!(matches!(
            rig.supervisor.send_command(DeviceCommand::Tare).await,
            Err(DashError::Command(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_both_halves() {
        let rig = rig(SupervisorConfig::default());
        rig.provider.push_link(vec![]);
        rig.supervisor.connect().await.unwrap();
        wait_for_state(&rig.supervisor, ConnectionState::ConnectedReading).await;

        rig.supervisor.shutdown().await;
        assert_eq!(rig.provider.releases(), 2);
        assert_eq!(rig.supervisor.state(), ConnectionState::Disconnected);
        assert!(rig.supervisor.link_description().await.is_none());
    }
}
