use std::collections::HashMap;

use chrono::{Months, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::graph::ReachableSubgraph;
use super::{Edge, Node};

pub const DEFAULT_INITIAL_CASH: f64 = 100_000.0;
pub const DEFAULT_MARGIN_REQUIREMENT: f64 = 0.0;
const DEFAULT_MONTHS_BACK: u32 = 3;
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Rejections raised before anything is sent to the backend.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("at least one ticker is required")]
    EmptyTickerList,

    #[error("nothing to run: no nodes are reachable from the start node")]
    NoReachableNodes,

    #[error("{field} must be in YYYY-MM-DD format, got {value:?}")]
    InvalidDate { field: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSelection {
    pub model_name: String,
    pub model_provider: String,
}

/// Raw editor inputs for a run, before normalization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub tickers: Vec<String>,
    /// Per-node model assignments keyed by node id.
    #[serde(default)]
    pub agent_models: HashMap<String, ModelSelection>,
    /// Global model used by agents without an explicit assignment.
    #[serde(default)]
    pub model: Option<ModelSelection>,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default, deserialize_with = "raw_amount")]
    pub initial_cash: String,
    #[serde(default, deserialize_with = "raw_amount")]
    pub margin_requirement: String,
}

/// Editors send amounts as text or as numbers; keep either as raw text.
fn raw_amount<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentModel {
    pub agent_id: String,
    pub model_name: String,
    pub model_provider: String,
}

/// The payload for exactly one backend execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub tickers: Vec<String>,
    pub graph_nodes: Vec<Node>,
    pub graph_edges: Vec<Edge>,
    pub agent_models: Vec<AgentModel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_provider: Option<String>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub initial_cash: f64,
    pub margin_requirement: f64,
}

pub fn build(subgraph: ReachableSubgraph, config: &RunConfig) -> Result<RunRequest, ValidationError> {
    build_as_of(subgraph, config, Utc::now().date_naive())
}

/// Same as [`build`] with an explicit "today" for the default date range.
pub fn build_as_of(
    subgraph: ReachableSubgraph,
    config: &RunConfig,
    today: NaiveDate,
) -> Result<RunRequest, ValidationError> {
    let tickers = parse_tickers(&config.tickers);
    if tickers.is_empty() {
        return Err(ValidationError::EmptyTickerList);
    }
    if subgraph.nodes.is_empty() {
        return Err(ValidationError::NoReachableNodes);
    }

    let (start_date, end_date) = resolve_dates(
        config.start_date.as_deref(),
        config.end_date.as_deref(),
        today,
    )?;

    let agent_models: Vec<AgentModel> = subgraph
        .nodes
        .iter()
        .filter(|n| n.is_agent())
        .filter_map(|n| {
            config.agent_models.get(&n.id).map(|m| AgentModel {
                agent_id: n.id.clone(),
                model_name: m.model_name.clone(),
                model_provider: m.model_provider.clone(),
            })
        })
        .collect();

    let initial_cash = parse_amount(&config.initial_cash, DEFAULT_INITIAL_CASH);
    let margin_requirement = parse_amount(&config.margin_requirement, DEFAULT_MARGIN_REQUIREMENT);

    Ok(RunRequest {
        tickers,
        graph_nodes: subgraph.nodes,
        graph_edges: subgraph.edges,
        agent_models,
        model_name: config.model.as_ref().map(|m| m.model_name.clone()),
        model_provider: config.model.as_ref().map(|m| m.model_provider.clone()),
        start_date,
        end_date,
        initial_cash,
        margin_requirement,
    })
}

/// Trim, split comma-joined entries and drop blanks, keeping input order.
pub fn parse_tickers(raw: &[String]) -> Vec<String> {
    raw.iter()
        .flat_map(|entry| entry.split(','))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

/// Unparsable, empty or non-finite input silently becomes `default`.
pub fn parse_amount(raw: &str, default: f64) -> f64 {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}

fn resolve_dates(
    start: Option<&str>,
    end: Option<&str>,
    today: NaiveDate,
) -> Result<(NaiveDate, NaiveDate), ValidationError> {
    let start = parse_date("start_date", start)?;
    let end = parse_date("end_date", end)?.unwrap_or(today);
    let start = match start {
        Some(d) => d,
        None => end
            .checked_sub_months(Months::new(DEFAULT_MONTHS_BACK))
            .unwrap_or(end),
    };
    Ok((start, end))
}

fn parse_date(field: &'static str, raw: Option<&str>) -> Result<Option<NaiveDate>, ValidationError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(value) => NaiveDate::parse_from_str(value, DATE_FORMAT)
            .map(Some)
            .map_err(|_| ValidationError::InvalidDate {
                field,
                value: value.to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flows::NodeType;
    use crate::flows::graph::extract_reachable;
    use crate::flows::test_support::{agent, edge, node};

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 31).unwrap()
    }

    fn subgraph() -> ReachableSubgraph {
        let nodes = vec![
            node("start", NodeType::Start),
            agent("warren_buffett_abc123"),
            agent("michael_burry_def456"),
            node("portfolio_manager", NodeType::DecisionMaker),
            node("prices", NodeType::DataSource),
        ];
        let edges = vec![
            edge("start", "warren_buffett_abc123"),
            edge("start", "michael_burry_def456"),
            edge("warren_buffett_abc123", "portfolio_manager"),
            edge("michael_burry_def456", "portfolio_manager"),
            edge("prices", "portfolio_manager"),
        ];
        extract_reachable(&nodes, &edges, "start")
    }

    fn config(tickers: &[&str]) -> RunConfig {
        RunConfig {
            tickers: tickers.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_blank_tickers_are_stripped() {
        let request = build_as_of(subgraph(), &config(&["", "  ", "AAPL"]), today()).unwrap();
        assert_eq!(request.tickers, vec!["AAPL"]);
    }

    #[test]
    fn test_comma_joined_tickers_are_split() {
        let request = build_as_of(subgraph(), &config(&["AAPL, MSFT", ",NVDA,"]), today()).unwrap();
        assert_eq!(request.tickers, vec!["AAPL", "MSFT", "NVDA"]);
    }

    #[test]
    fn test_all_blank_tickers_rejected() {
        let err = build_as_of(subgraph(), &config(&["", ""]), today()).unwrap_err();
        assert_eq!(err, ValidationError::EmptyTickerList);
    }

    #[test]
    fn test_empty_subgraph_rejected() {
        let err = build_as_of(ReachableSubgraph::default(), &config(&["AAPL"]), today()).unwrap_err();
        assert_eq!(err, ValidationError::NoReachableNodes);
    }

    #[test]
    fn test_ticker_check_runs_before_node_check() {
        let err = build_as_of(ReachableSubgraph::default(), &config(&[" "]), today()).unwrap_err();
        assert_eq!(err, ValidationError::EmptyTickerList);
    }

    #[test]
    fn test_graph_mirrors_extractor_output() {
        let sub = subgraph();
        let request = build_as_of(sub.clone(), &config(&["AAPL"]), today()).unwrap();
        assert_eq!(request.graph_nodes, sub.nodes);
        assert_eq!(request.graph_edges, sub.edges);
    }

    #[test]
    fn test_agent_models_only_for_assigned_reachable_agents() {
        let mut cfg = config(&["AAPL"]);
        let gpt = ModelSelection {
            model_name: "gpt-4o".into(),
            model_provider: "OpenAI".into(),
        };
        cfg.agent_models.insert("warren_buffett_abc123".into(), gpt.clone());
        cfg.agent_models.insert("portfolio_manager".into(), gpt.clone());
        // Not an agent node, and one that is not in the subgraph
        cfg.agent_models.insert("prices".into(), gpt.clone());
        cfg.agent_models.insert("cathie_wood_zzz999".into(), gpt.clone());
        cfg.model = Some(ModelSelection {
            model_name: "claude-sonnet".into(),
            model_provider: "Anthropic".into(),
        });

        let request = build_as_of(subgraph(), &cfg, today()).unwrap();
        let ids: Vec<&str> = request.agent_models.iter().map(|m| m.agent_id.as_str()).collect();
        assert_eq!(ids, vec!["warren_buffett_abc123", "portfolio_manager"]);
        assert_eq!(request.model_name.as_deref(), Some("claude-sonnet"));
        assert_eq!(request.model_provider.as_deref(), Some("Anthropic"));
    }

    #[test]
    fn test_unparsable_cash_falls_back_to_default() {
        for raw in ["", "   ", "abc", "1e999", "NaN"] {
            let mut cfg = config(&["AAPL"]);
            cfg.initial_cash = raw.to_string();
            let request = build_as_of(subgraph(), &cfg, today()).unwrap();
            assert_eq!(request.initial_cash, DEFAULT_INITIAL_CASH, "input {raw:?}");
        }

        let mut cfg = config(&["AAPL"]);
        cfg.initial_cash = " 250000.5 ".into();
        cfg.margin_requirement = "0.5".into();
        let request = build_as_of(subgraph(), &cfg, today()).unwrap();
        assert_eq!(request.initial_cash, 250_000.5);
        assert_eq!(request.margin_requirement, 0.5);
    }

    #[test]
    fn test_default_dates_are_three_months_back_from_today() {
        let request = build_as_of(subgraph(), &config(&["AAPL"]), today()).unwrap();
        assert_eq!(request.end_date, today());
        assert_eq!(request.start_date, NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
    }

    #[test]
    fn test_start_defaults_relative_to_given_end() {
        let mut cfg = config(&["AAPL"]);
        cfg.end_date = Some("2023-12-15".into());
        let request = build_as_of(subgraph(), &cfg, today()).unwrap();
        assert_eq!(request.start_date, NaiveDate::from_ymd_opt(2023, 9, 15).unwrap());
    }

    #[test]
    fn test_invalid_date_rejected() {
        let mut cfg = config(&["AAPL"]);
        cfg.start_date = Some("03/01/2024".into());
        let err = build_as_of(subgraph(), &cfg, today()).unwrap_err();
        assert_eq!(
            err,
            ValidationError::InvalidDate {
                field: "start_date",
                value: "03/01/2024".into()
            }
        );
    }

    #[test]
    fn test_request_serializes_dates_as_plain_strings() {
        let request = build_as_of(subgraph(), &config(&["AAPL"]), today()).unwrap();
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["end_date"], "2024-05-31");
        assert!(json.get("model_name").is_none());
        assert_eq!(json["graph_nodes"][0]["type"], "agent");
    }

    #[test]
    fn test_run_config_accepts_numeric_amounts() {
        let config: RunConfig = serde_json::from_str(
            r#"{"tickers": ["AAPL"], "initial_cash": 250000, "margin_requirement": "0.5"}"#,
        )
        .unwrap();
        assert_eq!(config.initial_cash, "250000");
        assert_eq!(parse_amount(&config.initial_cash, DEFAULT_INITIAL_CASH), 250_000.0);
        assert_eq!(parse_amount(&config.margin_requirement, DEFAULT_MARGIN_REQUIREMENT), 0.5);

        let config: RunConfig = serde_json::from_str(r#"{"initial_cash": null}"#).unwrap();
        assert_eq!(config.initial_cash, "");
    }

    #[test]
    fn test_validation_error_messages() {
        assert_eq!(
            ValidationError::EmptyTickerList.to_string(),
            "at least one ticker is required"
        );
        assert!(ValidationError::NoReachableNodes.to_string().contains("start node"));
    }
}
