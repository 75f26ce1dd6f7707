use async_trait::async_trait;
use futures::StreamExt;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::{Client, Response, StatusCode};
use serde::Serialize;
use serde_json::Value;

use super::sse::SseDecoder;
use super::{BackendError, EventStream, ExecutionBackend};
use crate::flows::events::BackendEvent;
use crate::flows::history::LastState;
use crate::flows::request::RunRequest;

#[derive(Serialize)]
struct StartBody<'a> {
    flow_id: &'a str,
    #[serde(flatten)]
    request: &'a RunRequest,
}

/// Talks to the execution backend over HTTP; runs stream back as SSE.
pub struct HttpBackend {
    client: Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn flow_url(&self, flow_id: &str, suffix: &str) -> String {
        let id = utf8_percent_encode(flow_id, NON_ALPHANUMERIC);
        format!("{}/flows/{id}/{suffix}", self.base_url)
    }
}

#[async_trait]
impl ExecutionBackend for HttpBackend {
    async fn start(&self, flow_id: &str, request: &RunRequest) -> Result<EventStream, BackendError> {
        let url = format!("{}/hedge-fund/run", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header("Accept", "text/event-stream")
            .json(&StartBody { flow_id, request })
            .send()
            .await?;

        let resp = check_status(resp, flow_id).await?;
        Ok(event_stream(resp))
    }

    async fn attach(&self, flow_id: &str) -> Result<EventStream, BackendError> {
        let resp = self
            .client
            .get(self.flow_url(flow_id, "runs/live"))
            .header("Accept", "text/event-stream")
            .send()
            .await?;

        let resp = check_status(resp, flow_id).await?;
        Ok(event_stream(resp))
    }

    async fn stop(&self, flow_id: &str) -> Result<(), BackendError> {
        // Over HTTP the backend cancels when the stream's connection closes,
        // which happens when the caller drops the EventStream.
        tracing::debug!(flow_id = %flow_id, "stop relies on stream close");
        Ok(())
    }

    async fn last_state(&self, flow_id: &str) -> Result<Option<LastState>, BackendError> {
        let resp = self
            .client
            .get(self.flow_url(flow_id, "runs/latest"))
            .send()
            .await?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = check_status(resp, flow_id).await?;

        let json: Value = resp.json().await?;
        if json.is_null() {
            return Ok(None);
        }
        LastState::from_value(&json)
            .map(Some)
            .ok_or_else(|| BackendError::Decode(format!("unrecognized run state for flow {flow_id}")))
    }
}

async fn check_status(resp: Response, flow_id: &str) -> Result<Response, BackendError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(BackendError::NotFound(flow_id.to_string()));
    }
    let body = resp.text().await.unwrap_or_default();
    Err(BackendError::Status {
        status: status.as_u16(),
        body,
    })
}

fn event_stream(resp: Response) -> EventStream {
    let mut bytes = resp.bytes_stream();
    Box::pin(async_stream::stream! {
        let mut decoder = SseDecoder::default();
        while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(BackendError::Transport(e.to_string()));
                    return;
                }
            };
            for frame in decoder.push(&chunk) {
                match BackendEvent::decode(frame.event.as_deref(), &frame.data) {
                    Ok(Some(event)) => yield Ok(event),
                    Ok(None) => {
                        tracing::debug!(event = ?frame.event, "ignoring backend frame");
                    }
                    Err(e) => {
                        tracing::warn!(event = ?frame.event, error = %e, "skipping malformed backend frame");
                    }
                }
            }
        }
    })
}
