//! DevTools Fetch-domain interception: every request pauses at the request
//! stage and again at the response stage, and each pause is surfaced to the
//! coordinator as an event carrying an owned resume token.

use crate::error::{DriverError, DriverResult};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chromiumoxide::cdp::browser_protocol::fetch::{
    ContinueRequestParams, ContinueResponseParams, EnableParams, EventRequestPaused,
    FailRequestParams, FulfillRequestParams, GetResponseBodyParams, HeaderEntry, RequestId,
    RequestPattern, RequestStage,
};
use chromiumoxide::cdp::browser_protocol::network::ErrorReason;
use chromiumoxide::Page;
use futures::StreamExt;
use mediator_core::driver::{
    DriverEvent, PausedRequest, PausedResponse, RequestOverrides, RequestToken, ResponseOverrides,
    ResponseToken,
};
use mediator_core::{HeaderList, Result as MediatorResult};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Arm Fetch interception on the page at both stages.
pub(crate) async fn enable(page: &Page) -> DriverResult<()> {
    let request_stage = RequestPattern::builder()
        .url_pattern("*")
        .request_stage(RequestStage::Request)
        .build();
    let response_stage = RequestPattern::builder()
        .url_pattern("*")
        .request_stage(RequestStage::Response)
        .build();

    page.execute(
        EnableParams::builder()
            .patterns(vec![request_stage, response_stage])
            .build(),
    )
    .await
    .map_err(|e| DriverError::Protocol(e.to_string()))?;
    Ok(())
}

/// Spawn the pump translating `Fetch.requestPaused` events into driver
/// events for the coordinator.
pub(crate) async fn spawn_pump(
    page: Page,
    events: mpsc::Sender<DriverEvent>,
) -> DriverResult<JoinHandle<()>> {
    let mut paused = page
        .event_listener::<EventRequestPaused>()
        .await
        .map_err(|e| DriverError::Protocol(e.to_string()))?;

    let task = tokio::spawn(async move {
        while let Some(event) = paused.next().await {
            let page = page.clone();
            let events = events.clone();
            // Response-stage handling fetches the body first; spawning per
            // pause keeps one slow origin from stalling the stream.
            tokio::spawn(async move {
                dispatch(page, event, events).await;
            });
        }
        debug!("Fetch event stream ended");
    });
    Ok(task)
}

async fn dispatch(page: Page, event: Arc<EventRequestPaused>, events: mpsc::Sender<DriverEvent>) {
    let driver_id = event.request_id.inner().to_string();

    if let Some(reason) = &event.response_error_reason {
        // The fetch already failed upstream; propagate and report the loss.
        debug!("Exchange {} failed upstream: {:?}", driver_id, reason);
        fail(&page, event.request_id.clone()).await;
        let _ = events
            .send(DriverEvent::Aborted {
                driver_id,
            })
            .await;
        return;
    }

    if event.response_status_code.is_some() {
        handle_response_stage(page, event, events, driver_id).await;
    } else {
        handle_request_stage(page, event, events, driver_id).await;
    }
}

async fn handle_request_stage(
    page: Page,
    event: Arc<EventRequestPaused>,
    events: mpsc::Sender<DriverEvent>,
    driver_id: String,
) {
    let request = &event.request;
    let headers = headers_from_network(serde_json::to_value(&request.headers).unwrap_or_default());
    let body = request
        .post_data
        .as_ref()
        .map(|d| d.as_bytes().to_vec())
        .unwrap_or_default();

    let paused = PausedRequest {
        driver_id,
        method: request.method.clone(),
        url: request.url.clone(),
        headers,
        body,
        resource_type: format!("{:?}", event.resource_type).to_lowercase(),
        token: Box::new(CdpRequestToken {
            page,
            request_id: event.request_id.clone(),
        }),
    };

    if events.send(DriverEvent::Request(paused)).await.is_err() {
        warn!("Coordinator gone, releasing paused request untouched");
    }
}

async fn handle_response_stage(
    page: Page,
    event: Arc<EventRequestPaused>,
    events: mpsc::Sender<DriverEvent>,
    driver_id: String,
) {
    let status = event.response_status_code.unwrap_or(0) as u16;
    let headers: HeaderList = event
        .response_headers
        .as_ref()
        .map(|entries| {
            entries
                .iter()
                .map(|h| mediator_core::Header::new(h.name.clone(), h.value.clone()))
                .collect()
        })
        .unwrap_or_default();

    let body = match page
        .execute(GetResponseBodyParams::new(event.request_id.clone()))
        .await
    {
        Ok(response) => {
            let returns = response.result;
            if returns.base64_encoded {
                BASE64.decode(returns.body.as_bytes()).unwrap_or_default()
            } else {
                returns.body.into_bytes()
            }
        }
        Err(e) => {
            debug!("getResponseBody failed for {}: {}", driver_id, e);
            Vec::new()
        }
    };

    let paused = PausedResponse {
        driver_id,
        status,
        headers: headers.clone(),
        body: body.clone(),
        token: Box::new(CdpResponseToken {
            page,
            request_id: event.request_id.clone(),
            status,
            headers,
            body,
        }),
    };

    if events.send(DriverEvent::Response(paused)).await.is_err() {
        warn!("Coordinator gone, paused response left to time out");
    }
}

async fn fail(page: &Page, request_id: RequestId) {
    let params = FailRequestParams::new(request_id, ErrorReason::Aborted);
    if let Err(e) = page.execute(params).await {
        debug!("failRequest error: {}", e);
    }
}

/// Network headers arrive as a JSON object; flatten it into the ordered
/// list form the engine uses.
fn headers_from_network(value: serde_json::Value) -> HeaderList {
    match value.as_object() {
        Some(map) => map
            .iter()
            .map(|(name, value)| {
                mediator_core::Header::new(name.clone(), value.as_str().unwrap_or_default())
            })
            .collect(),
        None => HeaderList::new(),
    }
}

fn header_entries(headers: &HeaderList) -> Vec<HeaderEntry> {
    headers
        .iter()
        .map(|h| HeaderEntry {
            name: h.name.clone(),
            value: h.value.clone(),
        })
        .collect()
}

/// Resume token for a request paused before going upstream. Owns the CDP
/// request id; consumed by exactly one verdict.
struct CdpRequestToken {
    page: Page,
    request_id: RequestId,
}

#[async_trait]
impl RequestToken for CdpRequestToken {
    async fn resume(self: Box<Self>, overrides: Option<RequestOverrides>) -> MediatorResult<()> {
        let mut builder = ContinueRequestParams::builder().request_id(self.request_id);
        if let Some(overrides) = overrides {
            if let Some(method) = overrides.method {
                builder = builder.method(method);
            }
            if let Some(url) = overrides.url {
                builder = builder.url(url);
            }
            if let Some(headers) = overrides.headers {
                builder = builder.headers(header_entries(&headers));
            }
            if let Some(body) = overrides.body {
                builder = builder.post_data(BASE64.encode(&body));
            }
        }
        let params = builder
            .build()
            .map_err(DriverError::Protocol)?;
        self.page
            .execute(params)
            .await
            .map_err(|e| DriverError::Protocol(e.to_string()))?;
        Ok(())
    }

    async fn abort(self: Box<Self>) -> MediatorResult<()> {
        let params = FailRequestParams::new(self.request_id, ErrorReason::Aborted);
        self.page
            .execute(params)
            .await
            .map_err(|e| DriverError::Protocol(e.to_string()))?;
        Ok(())
    }
}

/// Resume token for a response paused before delivery. Keeps the original
/// status, headers and body so an edit can be merged into a full fulfill.
struct CdpResponseToken {
    page: Page,
    request_id: RequestId,
    status: u16,
    headers: HeaderList,
    body: Vec<u8>,
}

#[async_trait]
impl ResponseToken for CdpResponseToken {
    async fn fulfill(self: Box<Self>, overrides: Option<ResponseOverrides>) -> MediatorResult<()> {
        match overrides {
            None => {
                // Untouched: let the origin response continue as-is.
                let params = ContinueResponseParams::builder()
                    .request_id(self.request_id)
                    .build()
                    .map_err(DriverError::Protocol)?;
                self.page
                    .execute(params)
                    .await
                    .map_err(|e| DriverError::Protocol(e.to_string()))?;
            }
            Some(overrides) => {
                let status = overrides.status.unwrap_or(self.status);
                let headers = overrides.headers.unwrap_or(self.headers);
                let body = overrides.body.unwrap_or(self.body);
                let params = FulfillRequestParams::builder()
                    .request_id(self.request_id)
                    .response_code(i64::from(status))
                    .response_headers(header_entries(&headers))
                    .body(BASE64.encode(&body))
                    .build()
                    .map_err(DriverError::Protocol)?;
                self.page
                    .execute(params)
                    .await
                    .map_err(|e| DriverError::Protocol(e.to_string()))?;
            }
        }
        Ok(())
    }

    async fn abort(self: Box<Self>) -> MediatorResult<()> {
        let params = FailRequestParams::new(self.request_id, ErrorReason::Aborted);
        self.page
            .execute(params)
            .await
            .map_err(|e| DriverError::Protocol(e.to_string()))?;
        Ok(())
    }
}
