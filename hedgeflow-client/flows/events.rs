use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// One decoded message from the execution backend's event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    Start,
    Progress(AgentProgress),
    Complete(OutputData),
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendEventType {
    Start,
    Progress,
    Complete,
    Error,
}

impl BackendEventType {
    pub fn from_sse_event(name: &str) -> Option<Self> {
        match name {
            "start" => Some(BackendEventType::Start),
            "progress" => Some(BackendEventType::Progress),
            "complete" => Some(BackendEventType::Complete),
            "error" => Some(BackendEventType::Error),
            _ => None,
        }
    }

    pub fn as_sse_event(self) -> &'static str {
        match self {
            BackendEventType::Start => "start",
            BackendEventType::Progress => "progress",
            BackendEventType::Complete => "complete",
            BackendEventType::Error => "error",
        }
    }
}

impl BackendEvent {
    pub fn event_type(&self) -> BackendEventType {
        match self {
            BackendEvent::Start => BackendEventType::Start,
            BackendEvent::Progress(_) => BackendEventType::Progress,
            BackendEvent::Complete(_) => BackendEventType::Complete,
            BackendEvent::Error(_) => BackendEventType::Error,
        }
    }

    /// Decode one frame. The SSE event name wins; without one the JSON
    /// `type` field is used. Returns `Ok(None)` for frames that carry
    /// nothing actionable (unknown type, progress without an agent id).
    pub fn decode(event_name: Option<&str>, data: &str) -> Result<Option<Self>, serde_json::Error> {
        let json: Value = if data.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(data)?
        };

        let type_name = event_name
            .filter(|n| !n.is_empty() && *n != "message")
            .or_else(|| json.get("type").and_then(|v| v.as_str()));

        let Some(event_type) = type_name.and_then(BackendEventType::from_sse_event) else {
            return Ok(None);
        };

        let event = match event_type {
            BackendEventType::Start => Some(BackendEvent::Start),
            BackendEventType::Progress => AgentProgress::from_value(&json).map(BackendEvent::Progress),
            BackendEventType::Complete => {
                // Older backends wrap the result in `data`.
                let payload = json.get("data").filter(|d| d.is_object()).unwrap_or(&json);
                Some(BackendEvent::Complete(OutputData::from_value(payload)))
            }
            BackendEventType::Error => {
                let message = json
                    .get("message")
                    .and_then(|v| v.as_str())
                    .or_else(|| json.as_str())
                    .unwrap_or("backend reported an error")
                    .to_string();
                Some(BackendEvent::Error(message))
            }
        };
        Ok(event)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Idle,
    InProgress,
    Complete,
    Error,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::InProgress => "in_progress",
            AgentStatus::Complete => "complete",
            AgentStatus::Error => "error",
        }
    }

    pub fn from_wire(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "idle" | "pending" => Some(AgentStatus::Idle),
            "in_progress" | "in-progress" | "running" => Some(AgentStatus::InProgress),
            "complete" | "completed" | "done" => Some(AgentStatus::Complete),
            "error" | "failed" => Some(AgentStatus::Error),
            _ => None,
        }
    }
}

/// A per-agent progress update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProgress {
    pub agent_id: String,
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backtest_results: Vec<PeriodResult>,
}

impl AgentProgress {
    pub fn from_value(json: &Value) -> Option<Self> {
        let agent_id = str_field(json, &["agent_id", "agent"]).filter(|s| !s.is_empty())?;

        let raw_status = str_field(json, &["status"]);
        let mut message = str_field(json, &["message", "analysis"]);

        // Free-form status text ("Fetching financial metrics") means the
        // agent is still working; keep the text when nothing better exists.
        let status = match raw_status.as_deref() {
            None => AgentStatus::InProgress,
            Some(raw) => AgentStatus::from_wire(raw).unwrap_or_else(|| {
                if message.is_none() {
                    message = Some(raw.to_string());
                }
                AgentStatus::InProgress
            }),
        };

        let backtest_results = json
            .get("backtest_results")
            .or_else(|| json.get("backtestResults"))
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| serde_json::from_value::<PeriodResult>(item.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();

        Some(AgentProgress {
            agent_id,
            status,
            message,
            ticker: str_field(json, &["ticker"]).filter(|s| !s.is_empty()),
            timestamp: json.get("timestamp").and_then(parse_timestamp),
            backtest_results,
        })
    }
}

/// One period of a backtest as reported by the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeriodResult {
    #[serde(default)]
    pub date: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub portfolio_value: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub cash: f64,
    #[serde(default, deserialize_with = "lenient_entries")]
    pub decisions: BTreeMap<String, Decision>,
    #[serde(default, deserialize_with = "lenient_number_map")]
    pub executed_trades: BTreeMap<String, f64>,
    #[serde(default, deserialize_with = "lenient_number_map")]
    pub current_prices: BTreeMap<String, f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub long_exposure: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub short_exposure: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub gross_exposure: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub net_exposure: f64,
    #[serde(default, deserialize_with = "lenient_opt_f64")]
    pub long_short_ratio: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    #[serde(default = "default_action")]
    pub action: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub quantity: f64,
    #[serde(default, deserialize_with = "lenient_opt_f64", skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<Value>,
}

fn default_action() -> String {
    "hold".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    #[serde(default)]
    pub signal: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    #[serde(default, deserialize_with = "lenient_opt_f64")]
    pub sharpe_ratio: Option<f64>,
    #[serde(default, deserialize_with = "lenient_opt_f64")]
    pub sortino_ratio: Option<f64>,
    #[serde(default, deserialize_with = "lenient_opt_f64")]
    pub max_drawdown: Option<f64>,
    #[serde(default)]
    pub max_drawdown_date: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt_f64")]
    pub long_short_ratio: Option<f64>,
    #[serde(default, deserialize_with = "lenient_opt_f64")]
    pub gross_exposure: Option<f64>,
    #[serde(default, deserialize_with = "lenient_opt_f64")]
    pub net_exposure: Option<f64>,
}

/// The terminal result of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputData {
    #[serde(default)]
    pub decisions: BTreeMap<String, Decision>,
    #[serde(default)]
    pub analyst_signals: BTreeMap<String, BTreeMap<String, Signal>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub current_prices: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance_metrics: Option<PerformanceMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_portfolio: Option<Value>,
}

impl OutputData {
    /// Decode field by field; entries that do not decode are skipped rather
    /// than failing the whole payload.
    pub fn from_value(json: &Value) -> Self {
        let analyst_signals: BTreeMap<String, BTreeMap<String, Signal>> = json
            .get("analyst_signals")
            .and_then(|v| v.as_object())
            .map(|agents| {
                agents
                    .iter()
                    .map(|(agent, tickers)| (agent.clone(), decode_entries::<Signal>(tickers)))
                    .collect()
            })
            .unwrap_or_default();

        OutputData {
            decisions: json
                .get("decisions")
                .map(decode_entries::<Decision>)
                .unwrap_or_default(),
            analyst_signals,
            current_prices: json
                .get("current_prices")
                .map(number_map)
                .unwrap_or_default(),
            performance_metrics: json
                .get("performance_metrics")
                .filter(|v| v.is_object())
                .and_then(|v| serde_json::from_value(v.clone()).ok()),
            final_portfolio: json.get("final_portfolio").filter(|v| !v.is_null()).cloned(),
        }
    }
}

fn str_field(json: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| json.get(*k).and_then(|v| v.as_str()))
        .map(String::from)
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let raw = value.as_str()?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    // Naive ISO timestamps are taken as UTC.
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    }
}

fn decode_entries<T: DeserializeOwned>(value: &Value) -> BTreeMap<String, T> {
    value
        .as_object()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|(k, v)| serde_json::from_value::<T>(v.clone()).ok().map(|t| (k.clone(), t)))
                .collect()
        })
        .unwrap_or_default()
}

fn number_map(value: &Value) -> BTreeMap<String, f64> {
    value
        .as_object()
        .map(|entries| {
            entries
                .iter()
                .map(|(k, v)| (k.clone(), as_number(v).unwrap_or(0.0)))
                .collect()
        })
        .unwrap_or_default()
}

fn lenient_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(as_number(&value).unwrap_or(0.0))
}

fn lenient_opt_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(as_number(&value))
}

fn lenient_number_map<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<BTreeMap<String, f64>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(number_map(&value))
}

fn lenient_entries<'de, D, T>(deserializer: D) -> Result<BTreeMap<String, T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(decode_entries(&value))
}
