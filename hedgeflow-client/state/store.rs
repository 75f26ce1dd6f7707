use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};

use crate::connection::ConnectionState;
use crate::flows::events::{AgentProgress, AgentStatus, OutputData, PeriodResult};

const UPDATES_CAPACITY: usize = 256;

/// Latest known state of one agent within the current run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AgentNodeData {
    pub status: AgentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticker: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    pub backtest_results: Vec<PeriodResult>,
}

impl From<AgentProgress> for AgentNodeData {
    fn from(p: AgentProgress) -> Self {
        AgentNodeData {
            status: p.status,
            message: p.message,
            ticker: p.ticker,
            timestamp: p.timestamp,
            backtest_results: p.backtest_results,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FlowState {
    pub agent_data: BTreeMap<String, AgentNodeData>,
    pub output_data: Option<OutputData>,
}

/// Change notification fanned out to live subscribers (the API's SSE feed).
#[derive(Debug, Clone, Serialize)]
pub struct FlowUpdate {
    pub flow_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: UpdateKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpdateKind {
    Reset,
    AgentUpdated {
        agent_id: String,
        data: AgentNodeData,
    },
    OutputReady,
    Recovered,
    Connection {
        state: ConnectionState,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl UpdateKind {
    pub fn as_sse_event(&self) -> &'static str {
        match self {
            UpdateKind::Reset => "reset",
            UpdateKind::AgentUpdated { .. } => "agent_updated",
            UpdateKind::OutputReady => "output_ready",
            UpdateKind::Recovered => "recovered",
            UpdateKind::Connection { .. } => "connection",
        }
    }
}

/// Process-wide cache of per-flow run state.
///
/// Created once at startup and shared by `Arc`. Entries appear on first
/// reference to a flow id and live until the process exits. Only the
/// connection manager's pump (and recovery) for a flow writes its entry.
pub struct FlowStateStore {
    flows: RwLock<HashMap<String, FlowState>>,
    updates_tx: broadcast::Sender<FlowUpdate>,
}

impl Default for FlowStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowStateStore {
    pub fn new() -> Self {
        let (updates_tx, _) = broadcast::channel(UPDATES_CAPACITY);
        Self {
            flows: RwLock::new(HashMap::new()),
            updates_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlowUpdate> {
        self.updates_tx.subscribe()
    }

    pub fn publish(&self, flow_id: &str, kind: UpdateKind) {
        // No subscribers is fine.
        let _ = self.updates_tx.send(FlowUpdate {
            flow_id: flow_id.to_string(),
            timestamp: Utc::now(),
            kind,
        });
    }

    /// Current state of a flow. Reading never creates an entry; unknown flows
    /// read as empty.
    pub async fn snapshot(&self, flow_id: &str) -> FlowState {
        self.flows
            .read()
            .await
            .get(flow_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop everything recorded for a flow; a new run starts from scratch.
    pub async fn reset(&self, flow_id: &str) {
        self.flows
            .write()
            .await
            .insert(flow_id.to_string(), FlowState::default());
        self.publish(flow_id, UpdateKind::Reset);
    }

    /// Overwrite the agent's entry with the event, except that backtest
    /// results accumulate across events.
    pub async fn apply_progress(&self, flow_id: &str, progress: AgentProgress) {
        let agent_id = progress.agent_id.clone();
        let data = {
            let mut flows = self.flows.write().await;
            let entry = flows
                .entry(flow_id.to_string())
                .or_default()
                .agent_data
                .entry(agent_id.clone())
                .or_default();

            let mut backtest_results = std::mem::take(&mut entry.backtest_results);
            backtest_results.extend(progress.backtest_results);

            *entry = AgentNodeData {
                status: progress.status,
                message: progress.message,
                ticker: progress.ticker,
                timestamp: progress.timestamp,
                backtest_results,
            };
            entry.clone()
        };
        self.publish(flow_id, UpdateKind::AgentUpdated { agent_id, data });
    }

    pub async fn set_output(&self, flow_id: &str, output: OutputData) {
        self.flows
            .write()
            .await
            .entry(flow_id.to_string())
            .or_default()
            .output_data = Some(output);
        self.publish(flow_id, UpdateKind::OutputReady);
    }

    /// Swap in a whole state (recovery).
    pub async fn replace(&self, flow_id: &str, state: FlowState) {
        self.flows.write().await.insert(flow_id.to_string(), state);
        self.publish(flow_id, UpdateKind::Recovered);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(agent: &str, status: AgentStatus, message: Option<&str>) -> AgentProgress {
        AgentProgress {
            agent_id: agent.to_string(),
            status,
            message: message.map(String::from),
            ticker: Some("AAPL".into()),
            timestamp: None,
            backtest_results: vec![],
        }
    }

    fn period(date: &str) -> PeriodResult {
        PeriodResult {
            date: date.to_string(),
            portfolio_value: 100_000.0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_snapshot_of_unknown_flow_does_not_create_entry() {
        let store = FlowStateStore::new();

        let state = store.snapshot("f1").await;
        assert_eq!(state, FlowState::default());
        assert!(store.flows.read().await.is_empty());

        store.reset("f1").await;
        assert!(store.flows.read().await.contains_key("f1"));
    }

    #[tokio::test]
    async fn test_progress_overwrites_last_write_wins() {
        let store = FlowStateStore::new();
        store
            .apply_progress("f1", progress("warren_buffett_agent", AgentStatus::InProgress, None))
            .await;
        store
            .apply_progress(
                "f1",
                progress("warren_buffett_agent", AgentStatus::Complete, Some("Done")),
            )
            .await;

        let state = store.snapshot("f1").await;
        assert_eq!(state.agent_data.len(), 1);
        let agent = &state.agent_data["warren_buffett_agent"];
        assert_eq!(agent.status, AgentStatus::Complete);
        assert_eq!(agent.message.as_deref(), Some("Done"));
    }

    #[tokio::test]
    async fn test_progress_overwrite_clears_stale_fields() {
        let store = FlowStateStore::new();
        store
            .apply_progress("f1", progress("a", AgentStatus::InProgress, Some("Fetching")))
            .await;
        let mut next = progress("a", AgentStatus::Complete, None);
        next.ticker = None;
        store.apply_progress("f1", next).await;

        let agent = &store.snapshot("f1").await.agent_data["a"];
        assert!(agent.message.is_none());
        assert!(agent.ticker.is_none());
    }

    #[tokio::test]
    async fn test_backtest_results_append() {
        let store = FlowStateStore::new();
        let mut first = progress("backtester", AgentStatus::InProgress, None);
        first.backtest_results = vec![period("2024-01-02")];
        let mut second = progress("backtester", AgentStatus::InProgress, None);
        second.backtest_results = vec![period("2024-01-03"), period("2024-01-04")];

        store.apply_progress("f1", first).await;
        store.apply_progress("f1", second).await;
        store
            .apply_progress("f1", progress("backtester", AgentStatus::Complete, None))
            .await;

        let agent = &store.snapshot("f1").await.agent_data["backtester"];
        let dates: Vec<&str> = agent.backtest_results.iter().map(|p| p.date.as_str()).collect();
        assert_eq!(dates, vec!["2024-01-02", "2024-01-03", "2024-01-04"]);
        assert_eq!(agent.status, AgentStatus::Complete);
    }

    #[tokio::test]
    async fn test_reset_clears_agents_and_output() {
        let store = FlowStateStore::new();
        store
            .apply_progress("f1", progress("a", AgentStatus::Complete, None))
            .await;
        store.set_output("f1", OutputData::default()).await;
        store
            .apply_progress("f2", progress("b", AgentStatus::Complete, None))
            .await;

        store.reset("f1").await;

        assert_eq!(store.snapshot("f1").await, FlowState::default());
        // Other flows are untouched
        assert_eq!(store.snapshot("f2").await.agent_data.len(), 1);
    }

    #[tokio::test]
    async fn test_updates_are_published_in_order() {
        let store = FlowStateStore::new();
        let mut rx = store.subscribe();

        store.reset("f1").await;
        store
            .apply_progress("f1", progress("a", AgentStatus::InProgress, None))
            .await;
        store.set_output("f1", OutputData::default()).await;

        let names: Vec<&str> = [
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
        ]
        .iter()
        .map(|u| u.kind.as_sse_event())
        .collect();
        assert_eq!(names, vec!["reset", "agent_updated", "output_ready"]);
    }

    #[test]
    fn test_update_serializes_flat_with_type_tag() {
        let update = FlowUpdate {
            flow_id: "f1".into(),
            timestamp: Utc::now(),
            kind: UpdateKind::Connection {
                state: ConnectionState::Processing,
                error: None,
            },
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["type"], "connection");
        assert_eq!(json["state"], "processing");
        assert_eq!(json["flow_id"], "f1");
    }
}
