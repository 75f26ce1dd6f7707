use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

use super::{Connection, ConnectionState, Input, StopReason};
use crate::backend::{ExecutionBackend, RetryPolicy};
use crate::flows::events::BackendEvent;
use crate::flows::graph::extract_reachable;
use crate::flows::request::{self, RunConfig, RunRequest, ValidationError};
use crate::flows::Flow;
use crate::state::store::{FlowState, FlowStateStore, UpdateKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Started { run_id: Uuid },
    AlreadyActive,
}

/// What [`ConnectionManager::restore`] did with a recovered state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Restore {
    /// A local run took the flow over since it was inspected; nothing written.
    Superseded,
    Restored,
    Attached { run_id: Uuid },
}

/// Read-only view of a flow's connection, with the flags the UI binds to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub run_id: Option<Uuid>,
    pub error: Option<String>,
    pub reconnect_suggested: bool,
    pub stop_reason: Option<StopReason>,
    pub validation_error: Option<String>,
    pub is_connecting: bool,
    pub is_connected: bool,
    pub is_processing: bool,
    pub can_run: bool,
}

#[derive(Default)]
struct FlowSlot {
    conn: Connection,
    validation_error: Option<ValidationError>,
    pump: Option<JoinHandle<()>>,
}

impl FlowSlot {
    fn status(&self) -> ConnectionStatus {
        let state = self.conn.state;
        ConnectionStatus {
            state,
            run_id: self.conn.run_id,
            error: self.conn.error.clone(),
            reconnect_suggested: self.conn.reconnect_suggested,
            stop_reason: self.conn.stop_reason,
            validation_error: self.validation_error.as_ref().map(|e| e.to_string()),
            is_connecting: self.conn.is_connecting(),
            is_connected: self.conn.is_connected(),
            is_processing: self.conn.is_processing(),
            can_run: !state.is_active() && self.validation_error.is_none(),
        }
    }
}

/// Owns the connection lifecycle of every flow.
///
/// Each flow id gets a slot behind its own mutex. `run`/`stop`/`attach` and
/// the background event pump all take that lock before touching the
/// connection or the flow's store entry, so writes for one flow are applied
/// one at a time and in receipt order. Flows never block each other.
pub struct ConnectionManager {
    backend: Arc<dyn ExecutionBackend>,
    store: Arc<FlowStateStore>,
    retry: RetryPolicy,
    flows: Mutex<HashMap<String, Arc<Mutex<FlowSlot>>>>,
}

impl ConnectionManager {
    pub fn new(backend: Arc<dyn ExecutionBackend>, store: Arc<FlowStateStore>, retry: RetryPolicy) -> Self {
        Self {
            backend,
            store,
            retry,
            flows: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<FlowStateStore> {
        &self.store
    }

    async fn existing_slot(&self, flow_id: &str) -> Option<Arc<Mutex<FlowSlot>>> {
        self.flows.lock().await.get(flow_id).cloned()
    }

    async fn slot(&self, flow_id: &str) -> Arc<Mutex<FlowSlot>> {
        self.flows
            .lock()
            .await
            .entry(flow_id.to_string())
            .or_default()
            .clone()
    }

    /// Extract the subgraph reachable from `start_id`, build the request and
    /// start it. A validation failure is kept on the flow (blocking
    /// `can_run`) until the next successful build.
    pub async fn run_flow(
        &self,
        flow_id: &str,
        flow: &Flow,
        start_id: &str,
        config: &RunConfig,
    ) -> Result<RunOutcome, ValidationError> {
        let subgraph = extract_reachable(&flow.nodes, &flow.edges, start_id);
        let slot = self.slot(flow_id).await;

        match request::build(subgraph, config) {
            Ok(request) => {
                slot.lock().await.validation_error = None;
                Ok(self.run(flow_id, request).await)
            }
            Err(e) => {
                tracing::warn!(flow_id = %flow_id, error = %e, "run rejected");
                slot.lock().await.validation_error = Some(e.clone());
                Err(e)
            }
        }
    }

    /// Start a run unless one is already active for the flow. The flow's
    /// store entry is cleared and the state is `connecting` by the time this
    /// returns; the stream is opened in the background.
    pub async fn run(&self, flow_id: &str, request: RunRequest) -> RunOutcome {
        let slot = self.slot(flow_id).await;
        let mut guard = slot.lock().await;

        if guard.conn.state.is_active() {
            tracing::info!(flow_id = %flow_id, state = %guard.conn.state, "run already active, ignoring");
            return RunOutcome::AlreadyActive;
        }

        let run_id = Uuid::new_v4();
        guard.validation_error = None;
        self.store.reset(flow_id).await;
        self.transition(flow_id, &mut guard, Input::Run { run_id });

        let pump = self.pump(flow_id, run_id, slot.clone());
        guard.pump = Some(tokio::spawn(pump.run(Source::Start(request))));

        RunOutcome::Started { run_id }
    }

    /// Write a recovered state into the store and, when `attach` is set and
    /// the flow is idle, join the run still executing on the backend.
    ///
    /// `seen_run` is the run id observed before the backend was queried. If a
    /// local run has started since, or one is active now, its data wins and
    /// nothing is written.
    pub async fn restore(
        &self,
        flow_id: &str,
        seen_run: Option<Uuid>,
        state: FlowState,
        attach: bool,
    ) -> Restore {
        let slot = self.slot(flow_id).await;
        let mut guard = slot.lock().await;

        if guard.conn.run_id != seen_run || guard.conn.state.is_active() {
            tracing::debug!(flow_id = %flow_id, state = %guard.conn.state, "local run owns the flow, dropping recovered state");
            return Restore::Superseded;
        }
        self.store.replace(flow_id, state).await;
        if !attach {
            return Restore::Restored;
        }

        let run_id = Uuid::new_v4();
        if self.transition(flow_id, &mut guard, Input::Attach { run_id }).is_none() {
            return Restore::Restored;
        }
        let pump = self.pump(flow_id, run_id, slot.clone());
        guard.pump = Some(tokio::spawn(pump.run(Source::Attach)));
        Restore::Attached { run_id }
    }

    /// Stop locally right away, then tell the backend without waiting.
    pub async fn stop(&self, flow_id: &str) -> ConnectionStatus {
        let slot = self.slot(flow_id).await;
        let mut guard = slot.lock().await;

        let was_active = guard.conn.state.is_active();
        if let Some(pump) = guard.pump.take() {
            pump.abort();
        }
        self.transition(flow_id, &mut guard, Input::Stop);
        let status = guard.status();
        drop(guard);

        if was_active {
            tracing::info!(flow_id = %flow_id, "■ Stopped");
            let backend = self.backend.clone();
            let flow_id = flow_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = backend.stop(&flow_id).await {
                    tracing::warn!(flow_id = %flow_id, error = %e, "backend stop failed");
                }
            });
        }
        status
    }

    /// Unknown flows report as idle without being registered.
    pub async fn status(&self, flow_id: &str) -> ConnectionStatus {
        match self.existing_slot(flow_id).await {
            Some(slot) => {
                let status = slot.lock().await.status();
                status
            }
            None => FlowSlot::default().status(),
        }
    }

    fn transition(&self, flow_id: &str, slot: &mut FlowSlot, input: Input) -> Option<ConnectionState> {
        apply_and_publish(&self.store, flow_id, &mut slot.conn, input)
    }

    fn pump(&self, flow_id: &str, run_id: Uuid, slot: Arc<Mutex<FlowSlot>>) -> Pump {
        Pump {
            flow_id: flow_id.to_string(),
            run_id,
            slot,
            backend: self.backend.clone(),
            store: self.store.clone(),
            retry: self.retry,
        }
    }
}

fn apply_and_publish(
    store: &FlowStateStore,
    flow_id: &str,
    conn: &mut Connection,
    input: Input,
) -> Option<ConnectionState> {
    let before = conn.state;
    let after = conn.apply(input)?;
    if after != before {
        tracing::debug!(flow_id = %flow_id, from = %before, to = %after, "connection state changed");
        store.publish(
            flow_id,
            UpdateKind::Connection {
                state: after,
                error: conn.error.clone(),
            },
        );
    }
    Some(after)
}

enum Source {
    Start(RunRequest),
    Attach,
}

impl Source {
    fn label(&self) -> &'static str {
        match self {
            Source::Start(_) => "start",
            Source::Attach => "attach",
        }
    }
}

enum Step {
    Continue,
    Completed,
    Failed(String),
    Stale,
}

/// Background task feeding one run's backend events into the connection and
/// the store.
struct Pump {
    flow_id: String,
    run_id: Uuid,
    slot: Arc<Mutex<FlowSlot>>,
    backend: Arc<dyn ExecutionBackend>,
    store: Arc<FlowStateStore>,
    retry: RetryPolicy,
}

impl Pump {
    async fn run(self, source: Source) {
        let run_id = self.run_id.simple().to_string();
        let short_id = &run_id[..8];
        let span = tracing::info_span!("flow_run", flow = %self.flow_id, run = %short_id);
        tracing::info!(parent: &span, source = source.label(), "▶ Started");

        let start = std::time::Instant::now();
        let end = self.drive(source).instrument(span.clone()).await;
        let elapsed = format!("{:.1}s", start.elapsed().as_secs_f64());

        match end {
            Step::Completed => tracing::info!(parent: &span, elapsed = %elapsed, "✓ Completed"),
            Step::Failed(error) => tracing::error!(parent: &span, elapsed = %elapsed, error = %error, "✗ Failed"),
            Step::Stale | Step::Continue => {
                tracing::debug!(parent: &span, "run superseded, pump exiting")
            }
        }
    }

    async fn drive(&self, source: Source) -> Step {
        let opened = match &source {
            Source::Start(request) => {
                self.retry
                    .run_unsent("start run", || self.backend.start(&self.flow_id, request))
                    .await
            }
            Source::Attach => {
                self.retry
                    .run("attach to run", || self.backend.attach(&self.flow_id))
                    .await
            }
        };

        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => return self.fail(Input::TransportFailed(e.to_string())).await,
        };

        if let Step::Stale = self.apply(Input::Opened).await {
            return Step::Stale;
        }

        while let Some(item) = stream.next().await {
            let step = match item {
                Ok(event) => self.handle_event(event).await,
                Err(e) => self.fail(Input::TransportFailed(e.to_string())).await,
            };
            if !matches!(step, Step::Continue) {
                return step;
            }
        }

        self.fail(Input::TransportFailed(
            "event stream ended before the run completed".to_string(),
        ))
        .await
    }

    fn is_current(&self, slot: &FlowSlot) -> bool {
        slot.conn.run_id == Some(self.run_id) && slot.conn.state.is_active()
    }

    async fn apply(&self, input: Input) -> Step {
        let mut slot = self.slot.lock().await;
        if !self.is_current(&slot) {
            return Step::Stale;
        }
        apply_and_publish(&self.store, &self.flow_id, &mut slot.conn, input);
        Step::Continue
    }

    async fn fail(&self, input: Input) -> Step {
        let message = match &input {
            Input::BackendError(m) | Input::TransportFailed(m) => m.clone(),
            _ => String::new(),
        };
        match self.apply(input).await {
            Step::Stale => Step::Stale,
            _ => Step::Failed(message),
        }
    }

    async fn handle_event(&self, event: BackendEvent) -> Step {
        let mut slot = self.slot.lock().await;
        if !self.is_current(&slot) {
            tracing::debug!(event = event.event_type().as_sse_event(), "discarding event for superseded run");
            return Step::Stale;
        }

        match event {
            BackendEvent::Start => {
                apply_and_publish(&self.store, &self.flow_id, &mut slot.conn, Input::Event);
                Step::Continue
            }
            BackendEvent::Progress(progress) => {
                apply_and_publish(&self.store, &self.flow_id, &mut slot.conn, Input::Event);
                tracing::debug!(agent = %progress.agent_id, status = ?progress.status, "agent progress");
                self.store.apply_progress(&self.flow_id, progress).await;
                Step::Continue
            }
            BackendEvent::Complete(output) => {
                apply_and_publish(&self.store, &self.flow_id, &mut slot.conn, Input::Event);
                self.store.set_output(&self.flow_id, output).await;
                apply_and_publish(&self.store, &self.flow_id, &mut slot.conn, Input::Completed);
                Step::Completed
            }
            BackendEvent::Error(message) => {
                apply_and_publish(&self.store, &self.flow_id, &mut slot.conn, Input::BackendError(message.clone()));
                Step::Failed(message)
            }
        }
    }
}
