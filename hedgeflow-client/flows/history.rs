use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::events::{AgentProgress, OutputData};

/// Status of the most recent backend-side run of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    #[serde(alias = "idle")]
    Idle,
    #[serde(alias = "in_progress", alias = "running")]
    InProgress,
    #[serde(alias = "complete", alias = "completed")]
    Complete,
    #[serde(alias = "error", alias = "failed")]
    Error,
}

/// What the backend remembers about a flow's last run.
#[derive(Debug, Clone, PartialEq)]
pub struct LastState {
    pub status: RunStatus,
    pub agent_data: BTreeMap<String, AgentProgress>,
    pub output_data: Option<OutputData>,
    pub error: Option<String>,
}

impl LastState {
    /// Decode a recovery response. `None` when the status is missing or not
    /// one we know; partial agent/output data is kept.
    pub fn from_value(json: &Value) -> Option<Self> {
        let status: RunStatus = json
            .get("status")
            .and_then(|s| serde_json::from_value(s.clone()).ok())?;

        let agent_data = json
            .get("agent_data")
            .or_else(|| json.get("agentData"))
            .and_then(|v| v.as_object())
            .map(|agents| {
                agents
                    .iter()
                    .filter_map(|(agent_id, entry)| {
                        // The key is authoritative for the agent id.
                        let mut entry = entry.clone();
                        if let Some(obj) = entry.as_object_mut() {
                            obj.insert("agent_id".into(), Value::String(agent_id.clone()));
                        }
                        AgentProgress::from_value(&entry).map(|p| (agent_id.clone(), p))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let output_data = json
            .get("output_data")
            .or_else(|| json.get("outputData"))
            .or_else(|| json.get("results"))
            .filter(|v| v.is_object())
            .map(OutputData::from_value);

        Some(LastState {
            status,
            agent_data,
            output_data,
            error: json
                .get("error_message")
                .or_else(|| json.get("error"))
                .and_then(|v| v.as_str())
                .map(String::from),
        })
    }
}
