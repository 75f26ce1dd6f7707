use serde::Serialize;
use uuid::Uuid;

use super::store::{AgentNodeData, FlowState};
use crate::backend::{BackendError, ExecutionBackend, RetryPolicy};
use crate::connection::manager::{ConnectionManager, Restore};
use crate::flows::history::{LastState, RunStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecoveryOutcome {
    /// The backend has no run for this flow, or it never started.
    NothingToRecover,
    /// A local run owns the flow; its stream is authoritative.
    LocalRunActive,
    /// A local run started while the backend was being queried; its data
    /// was kept.
    Superseded,
    /// Historical data was copied into the store.
    Restored {
        status: RunStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Data restored and the live stream of the running execution joined.
    Attached { run_id: Uuid },
}

/// Reconcile the store with what the backend knows about the flow's last run,
/// without starting a new execution. Safe to call repeatedly.
pub async fn recover(
    manager: &ConnectionManager,
    backend: &dyn ExecutionBackend,
    retry: RetryPolicy,
    flow_id: &str,
) -> Result<RecoveryOutcome, BackendError> {
    let seen = manager.status(flow_id).await;
    if seen.state.is_active() {
        tracing::debug!(flow_id = %flow_id, "local run active, skipping recovery");
        return Ok(RecoveryOutcome::LocalRunActive);
    }

    let last = match retry
        .run("fetch last run state", || backend.last_state(flow_id))
        .await
    {
        Ok(Some(last)) => last,
        Ok(None) | Err(BackendError::NotFound(_)) => {
            tracing::debug!(flow_id = %flow_id, "nothing to recover");
            return Ok(RecoveryOutcome::NothingToRecover);
        }
        Err(e) => return Err(e),
    };

    let status = last.status;
    if status == RunStatus::Idle {
        return Ok(RecoveryOutcome::NothingToRecover);
    }

    let agents = last.agent_data.len();
    let error = last.error.clone();
    let attach = status == RunStatus::InProgress;
    match manager
        .restore(flow_id, seen.run_id, into_flow_state(last), attach)
        .await
    {
        Restore::Superseded => {
            tracing::debug!(flow_id = %flow_id, "run started during recovery, keeping its data");
            Ok(RecoveryOutcome::Superseded)
        }
        Restore::Restored => {
            tracing::info!(flow_id = %flow_id, status = ?status, agents, "recovered run state");
            Ok(RecoveryOutcome::Restored { status, error })
        }
        Restore::Attached { run_id } => {
            tracing::info!(flow_id = %flow_id, agents, "recovered run state, attached to live run");
            Ok(RecoveryOutcome::Attached { run_id })
        }
    }
}

fn into_flow_state(last: LastState) -> FlowState {
    FlowState {
        agent_data: last
            .agent_data
            .into_iter()
            .map(|(agent_id, progress)| (agent_id, AgentNodeData::from(progress)))
            .collect(),
        output_data: last.output_data,
    }
}
