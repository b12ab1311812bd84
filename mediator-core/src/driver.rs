//! The seam between the mediation engine and the instrumented browser.
//!
//! The driver pauses exchanges inside the browser and surfaces each one as
//! an event carrying an owned resume token. The token is the sole owner of
//! the paused exchange: it is consumed by exactly one of resume, fulfill,
//! or abort, which is what makes operator decisions idempotent at the
//! coordinator level.

use crate::error::Result;
use crate::exchange::HeaderList;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Edits applied to an outgoing request when it is released upstream.
#[derive(Debug, Clone, Default)]
pub struct RequestOverrides {
    pub method: Option<String>,
    pub url: Option<String>,
    pub headers: Option<HeaderList>,
    pub body: Option<Vec<u8>>,
}

/// Edits applied to a response before it is delivered to the browser.
#[derive(Debug, Clone, Default)]
pub struct ResponseOverrides {
    pub status: Option<u16>,
    pub headers: Option<HeaderList>,
    pub body: Option<Vec<u8>>,
}

/// Resume token for a request paused before going upstream.
#[async_trait]
pub trait RequestToken: Send + Sync {
    /// Release the request upstream, optionally edited. `None` continues
    /// the request exactly as the browser issued it.
    async fn resume(self: Box<Self>, overrides: Option<RequestOverrides>) -> Result<()>;

    /// Abort the request; the browser observes a failed fetch.
    async fn abort(self: Box<Self>) -> Result<()>;
}

/// Resume token for a response paused before delivery to the browser.
#[async_trait]
pub trait ResponseToken: Send + Sync {
    /// Deliver the response, optionally edited. `None` continues the
    /// response exactly as the origin produced it.
    async fn fulfill(self: Box<Self>, overrides: Option<ResponseOverrides>) -> Result<()>;

    /// Abort the exchange; the browser observes a failed fetch.
    async fn abort(self: Box<Self>) -> Result<()>;
}

/// A request paused at the pre-flight hook.
pub struct PausedRequest {
    /// The driver's own correlation key, shared by the request and response
    /// pauses of one exchange.
    pub driver_id: String,
    pub method: String,
    pub url: String,
    pub headers: HeaderList,
    pub body: Vec<u8>,
    pub resource_type: String,
    pub token: Box<dyn RequestToken>,
}

/// A response paused before delivery to the browser.
pub struct PausedResponse {
    pub driver_id: String,
    pub status: u16,
    pub headers: HeaderList,
    pub body: Vec<u8>,
    pub token: Box<dyn ResponseToken>,
}

/// Events the driver emits toward the coordinator.
pub enum DriverEvent {
    Request(PausedRequest),
    Response(PausedResponse),
    /// The browser abandoned the exchange (navigation away, tab close)
    /// while it was paused or in flight.
    Aborted { driver_id: String },
}

impl std::fmt::Debug for DriverEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverEvent::Request(r) => f
                .debug_struct("Request")
                .field("driver_id", &r.driver_id)
                .field("method", &r.method)
                .field("url", &r.url)
                .finish_non_exhaustive(),
            DriverEvent::Response(r) => f
                .debug_struct("Response")
                .field("driver_id", &r.driver_id)
                .field("status", &r.status)
                .finish_non_exhaustive(),
            DriverEvent::Aborted { driver_id } => f
                .debug_struct("Aborted")
                .field("driver_id", driver_id)
                .finish(),
        }
    }
}

/// Lifecycle of the instrumented browser.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Launch the browser and begin emitting events on `events`.
    async fn start(&self, events: mpsc::Sender<DriverEvent>) -> Result<()>;

    /// Tear the browser down. Paused exchanges die with it.
    async fn stop(&self) -> Result<()>;

    fn is_running(&self) -> bool;
}
