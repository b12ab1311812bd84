//! Interception coordinator: holds in-flight exchanges, correlates
//! asynchronous operator decisions with paused browser traffic, and runs
//! the rewrite pipeline on both phases.

use crate::driver::{DriverEvent, PausedRequest, PausedResponse, RequestOverrides, RequestToken, ResponseOverrides, ResponseToken};
use crate::events::{Ack, ExchangeEdit, ExchangeEvent, Notice, OutboundMessage};
use crate::exchange::{Exchange, ExchangeState, ResponseRecord};
use crate::exclusion::{is_excluded, ExclusionRule};
use crate::ids::IdAllocator;
use crate::rewrite::{MatchReplaceRule, RewriteEngine, RewriteScope};
use crate::router::OperatorRouter;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Policy knobs. The grace period governs degraded mode and the janitor
/// cadence; any positive value is acceptable for correctness.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How long a disconnected operator may reconnect before suspended
    /// exchanges are auto-forwarded.
    pub grace_period: Duration,
    /// Suspended entries older than this are dropped by the janitor.
    pub janitor_max_age: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
            janitor_max_age: Duration::from_secs(50),
        }
    }
}

/// Capture-log records pushed toward the project store.
#[derive(Debug, Clone)]
pub enum HistoryRecord {
    /// First sighting of a visible exchange.
    Captured(Exchange),
    /// Later state change (response merged, completed, dropped).
    Updated(Exchange),
}

impl HistoryRecord {
    pub fn exchange(&self) -> &Exchange {
        match self {
            HistoryRecord::Captured(ex) | HistoryRecord::Updated(ex) => ex,
        }
    }
}

enum SuspendedPhase {
    Request(Box<dyn RequestToken>),
    Response(Box<dyn ResponseToken>),
}

/// A parked exchange. The entry is the sole owner of the resume token,
/// so removing it from the map is what serialises competing decisions.
struct Suspended {
    phase: SuspendedPhase,
    since: Instant,
}

pub struct InterceptionCoordinator {
    ids: IdAllocator,
    config: CoordinatorConfig,
    router: Arc<OperatorRouter>,
    rewriter: RewriteEngine,
    /// All visible non-terminal exchanges, keyed by exchange id.
    live: DashMap<String, Exchange>,
    /// Suspended exchanges awaiting an operator decision.
    suspended: DashMap<String, Suspended>,
    /// Driver correlation key to exchange id.
    by_driver: DashMap<String, String>,
    intercept_requests: AtomicBool,
    operator_on: AtomicBool,
    disconnect_epoch: AtomicU64,
    match_rules: RwLock<Arc<Vec<MatchReplaceRule>>>,
    exclusions: RwLock<Arc<Vec<ExclusionRule>>>,
    history_tx: mpsc::UnboundedSender<HistoryRecord>,
}

impl InterceptionCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        router: Arc<OperatorRouter>,
        history_tx: mpsc::UnboundedSender<HistoryRecord>,
    ) -> Self {
        Self {
            ids: IdAllocator::new(),
            config,
            router,
            rewriter: RewriteEngine::new(),
            live: DashMap::new(),
            suspended: DashMap::new(),
            by_driver: DashMap::new(),
            intercept_requests: AtomicBool::new(false),
            operator_on: AtomicBool::new(false),
            disconnect_epoch: AtomicU64::new(0),
            match_rules: RwLock::new(Arc::new(Vec::new())),
            exclusions: RwLock::new(Arc::new(Vec::new())),
            history_tx,
        }
    }

    /// Consume driver events until the browser side closes the channel.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<DriverEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                DriverEvent::Request(paused) => self.on_request(paused).await,
                DriverEvent::Response(paused) => self.on_response(paused).await,
                DriverEvent::Aborted { driver_id } => self.on_aborted(&driver_id).await,
            }
        }
        debug!("Driver event stream ended");
    }

    // ---- operator state -------------------------------------------------

    pub fn set_intercept_requests(&self, enabled: bool) {
        self.intercept_requests.store(enabled, Ordering::SeqCst);
        info!("Request interception {}", if enabled { "armed" } else { "disarmed" });
    }

    pub fn intercept_requests(&self) -> bool {
        self.intercept_requests.load(Ordering::SeqCst)
    }

    /// Tag or untag a live exchange for response-phase suspension.
    pub fn set_intercept_response(&self, id: &str, enabled: bool) -> bool {
        match self.live.get_mut(id) {
            Some(mut ex) => {
                ex.intercept_response = enabled;
                true
            }
            None => false,
        }
    }

    /// Replace the rewrite rule list. Writers clone-and-replace; in-flight
    /// rewrite passes keep their snapshot.
    pub fn set_match_rules(&self, rules: Vec<MatchReplaceRule>) {
        *self.match_rules.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(rules);
    }

    pub fn set_exclusions(&self, rules: Vec<ExclusionRule>) {
        *self.exclusions.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(rules);
    }

    pub fn exclusions_snapshot(&self) -> Arc<Vec<ExclusionRule>> {
        self.exclusions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn match_rules_snapshot(&self) -> Arc<Vec<MatchReplaceRule>> {
        self.match_rules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn suspended_count(&self) -> usize {
        self.suspended.len()
    }

    /// The operator channel came up. Cancels any pending grace timer.
    pub fn operator_attached(&self) {
        self.operator_on.store(true, Ordering::SeqCst);
        self.disconnect_epoch.fetch_add(1, Ordering::SeqCst);
        info!("Operator channel attached");
    }

    /// The operator channel went away: enter degraded mode. Suspended
    /// exchanges are auto-forwarded unedited after the grace period unless
    /// the operator reconnects first; new captures skip suspension
    /// meanwhile.
    pub fn operator_detached(self: Arc<Self>) {
        self.operator_on.store(false, Ordering::SeqCst);
        let epoch = self.disconnect_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(
            "Operator channel detached, {} exchange(s) suspended; grace period {:?}",
            self.suspended.len(),
            self.config.grace_period
        );

        let this = self;
        tokio::spawn(async move {
            tokio::time::sleep(this.config.grace_period).await;
            if this.disconnect_epoch.load(Ordering::SeqCst) != epoch
                || this.operator_on.load(Ordering::SeqCst)
            {
                return;
            }
            let pending = this.suspended.len();
            if pending > 0 {
                warn!("Grace period expired, auto-forwarding {} suspended exchange(s)", pending);
            }
            this.intercept_requests.store(false, Ordering::SeqCst);
            this.release_all().await;
        });
    }

    /// Forward every suspended exchange unedited.
    pub async fn release_all(&self) {
        let ids: Vec<String> = self.suspended.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.forward(&id, None, None).await;
        }
    }

    /// Drop every suspended exchange (operator stop, browser teardown).
    pub async fn drop_all(&self) {
        let ids: Vec<String> = self.suspended.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.drop_exchange(&id).await;
        }
    }

    /// Periodic sweep for orphaned suspension entries.
    pub fn spawn_janitor(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(this.config.grace_period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let stale: Vec<String> = this
                    .suspended
                    .iter()
                    .filter(|e| e.value().since.elapsed() > this.config.janitor_max_age)
                    .map(|e| e.key().clone())
                    .collect();
                for id in stale {
                    warn!("Janitor dropping stale suspended exchange [{}]", id);
                    this.router.publish(OutboundMessage::Notice(Notice::for_exchange(
                        "dropped",
                        "suspended exchange expired",
                        &id,
                    )));
                    this.drop_exchange(&id).await;
                }
            }
        })
    }

    // ---- browser events -------------------------------------------------

    async fn on_request(&self, paused: PausedRequest) {
        // Identity is stamped before the visibility decision; a dropped
        // allocation may leave a display gap, which is permitted.
        let id = self.ids.new_id();
        let seq = self.ids.next_seq();

        let exclusions = self.exclusions_snapshot();
        if is_excluded(&paused.url, &exclusions) {
            if let Err(e) = paused.token.resume(None).await {
                debug!("Release of excluded request failed: {}", e);
            }
            return;
        }

        let PausedRequest {
            driver_id,
            mut method,
            mut url,
            headers,
            body,
            resource_type,
            token,
        } = paused;

        let rules = self.match_rules_snapshot();
        let mut changed = false;

        let line = format!("{} {} HTTP/1.1", method, url);
        let rewritten = self
            .rewriter
            .apply_first_line(&rules, RewriteScope::RequestFirstLine, &line);
        if rewritten != line {
            let mut parts = rewritten.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some(m), Some(u)) => {
                    method = m.to_string();
                    url = u.to_string();
                    changed = true;
                }
                _ => warn!("Rewritten request line '{}' is malformed, keeping original", rewritten),
            }
        }

        let mut new_headers = self
            .rewriter
            .apply_headers(&rules, RewriteScope::RequestHeader, &headers);
        if new_headers != headers {
            changed = true;
        }
        let new_body = self
            .rewriter
            .apply_body(&rules, RewriteScope::RequestBody, &body);
        if new_body != body {
            new_headers.set_content_length(new_body.len());
            changed = true;
        }

        let mut exchange = Exchange::new(
            id.clone(),
            seq,
            driver_id.clone(),
            method,
            url,
            new_headers,
            new_body,
            resource_type,
        );
        exchange.state = ExchangeState::ReqRewritten;

        let suspend =
            self.intercept_requests.load(Ordering::SeqCst) && self.operator_on.load(Ordering::SeqCst);

        info!("Request [{}] seq={} {} {}", id, seq, exchange.method, exchange.url);
        self.router.publish(OutboundMessage::Capture(ExchangeEvent::request(
            &exchange, suspend,
        )));
        self.by_driver.insert(driver_id, id.clone());

        if suspend {
            exchange.state = ExchangeState::ReqSuspended;
            self.live.insert(id.clone(), exchange.clone());
            self.suspended.insert(
                id.clone(),
                Suspended {
                    phase: SuspendedPhase::Request(token),
                    since: Instant::now(),
                },
            );
            self.record(HistoryRecord::Captured(exchange.clone()));

            let delivered = self.router.publish(OutboundMessage::Intercept(
                ExchangeEvent::request(&exchange, true),
            ));
            if !delivered {
                warn!("Prompt for [{}] undeliverable, auto-forwarding", id);
                self.router.publish(OutboundMessage::Notice(Notice::for_exchange(
                    "degraded",
                    "interception prompt undeliverable, exchange auto-forwarded",
                    &id,
                )));
                self.forward(&id, None, None).await;
            }
        } else {
            exchange.state = ExchangeState::InFlight;
            self.live.insert(id.clone(), exchange.clone());
            self.record(HistoryRecord::Captured(exchange.clone()));

            let overrides = changed.then(|| RequestOverrides {
                method: Some(exchange.method.clone()),
                url: Some(exchange.url.clone()),
                headers: Some(exchange.headers.clone()),
                body: Some(exchange.body.clone()),
            });
            if let Err(e) = token.resume(overrides).await {
                warn!("Upstream release of [{}] failed: {}", id, e);
                self.fail_exchange(&id, format!("upstream release failed: {}", e));
            }
        }
    }

    async fn on_response(&self, paused: PausedResponse) {
        let Some(id) = self.by_driver.get(&paused.driver_id).map(|e| e.value().clone()) else {
            // Excluded earlier, or not ours: deliver untouched.
            if let Err(e) = paused.token.fulfill(None).await {
                debug!("Release of uncorrelated response failed: {}", e);
            }
            return;
        };

        let PausedResponse {
            driver_id: _,
            mut status,
            headers,
            body,
            token,
        } = paused;

        let rules = self.match_rules_snapshot();
        let mut changed = false;

        let line = format!("HTTP/1.1 {} {}", status, reason_phrase(status));
        let rewritten = self
            .rewriter
            .apply_first_line(&rules, RewriteScope::ResponseFirstLine, &line);
        if rewritten != line {
            match rewritten
                .split_whitespace()
                .nth(1)
                .and_then(|s| s.parse::<u16>().ok())
            {
                Some(s) => {
                    status = s;
                    changed = true;
                }
                None => warn!("Rewritten status line '{}' is malformed, keeping original", rewritten),
            }
        }

        let mut new_headers = self
            .rewriter
            .apply_headers(&rules, RewriteScope::ResponseHeader, &headers);
        if new_headers != headers {
            changed = true;
        }
        let new_body = self
            .rewriter
            .apply_body(&rules, RewriteScope::ResponseBody, &body);
        if new_body != body {
            new_headers.set_content_length(new_body.len());
            changed = true;
        }

        let Some(mut exchange) = self.live.get(&id).map(|e| e.value().clone()) else {
            // Raced with a drop; nothing to deliver to.
            let _ = token.abort().await;
            return;
        };
        exchange.state = ExchangeState::ResRewritten;
        exchange.response = Some(ResponseRecord {
            status,
            headers: new_headers,
            body: new_body,
        });

        let suspend = exchange.intercept_response && self.operator_on.load(Ordering::SeqCst);
        info!("Response [{}] status={} suspended={}", id, status, suspend);

        if suspend {
            exchange.state = ExchangeState::ResSuspended;
            self.live.insert(id.clone(), exchange.clone());
            self.router.publish(OutboundMessage::Capture(ExchangeEvent::response(
                &exchange, true, None,
            )));
            self.suspended.insert(
                id.clone(),
                Suspended {
                    phase: SuspendedPhase::Response(token),
                    since: Instant::now(),
                },
            );
            self.record(HistoryRecord::Updated(exchange.clone()));

            let delivered = self.router.publish(OutboundMessage::Intercept(
                ExchangeEvent::response(&exchange, true, None),
            ));
            if !delivered {
                warn!("Response prompt for [{}] undeliverable, auto-forwarding", id);
                self.router.publish(OutboundMessage::Notice(Notice::for_exchange(
                    "degraded",
                    "interception prompt undeliverable, response auto-forwarded",
                    &id,
                )));
                self.forward(&id, None, None).await;
            }
        } else {
            exchange.state = ExchangeState::Completed;
            self.live.remove(&id);
            self.by_driver.remove(&exchange.driver_id);
            self.router.publish(OutboundMessage::Capture(ExchangeEvent::response(
                &exchange, false, None,
            )));
            self.record(HistoryRecord::Updated(exchange.clone()));

            let overrides = if changed {
                exchange.response.as_ref().map(|res| ResponseOverrides {
                    status: Some(res.status),
                    headers: Some(res.headers.clone()),
                    body: Some(res.body.clone()),
                })
            } else {
                None
            };
            if let Err(e) = token.fulfill(overrides).await {
                warn!("Response delivery for [{}] failed: {}", id, e);
            }
        }
    }

    /// The browser abandoned the exchange. The token, if one is parked,
    /// died with the browser side; dropping it is the cleanup.
    async fn on_aborted(&self, driver_id: &str) {
        let Some((_, id)) = self.by_driver.remove(driver_id) else {
            return;
        };
        let was_suspended = self.suspended.remove(&id).is_some();
        if let Some((_, mut exchange)) = self.live.remove(&id) {
            exchange.dropped = true;
            exchange.state = ExchangeState::Dropped;
            info!("Exchange [{}] aborted upstream (suspended={})", id, was_suspended);
            self.router.publish(OutboundMessage::Notice(Notice::for_exchange(
                "dropped",
                "browser aborted the exchange",
                &id,
            )));
            self.record(HistoryRecord::Updated(exchange));
        }
    }

    // ---- operator decisions ---------------------------------------------

    /// Release a suspended exchange, optionally edited. Unknown or already
    /// decided ids acknowledge as no-ops.
    pub async fn forward(
        &self,
        id: &str,
        edit: Option<ExchangeEdit>,
        intercept_response: Option<bool>,
    ) -> Ack {
        let Some((_, entry)) = self.suspended.remove(id) else {
            return Ack::ok("forward");
        };

        match entry.phase {
            SuspendedPhase::Request(token) => {
                let Some(mut exchange) = self.live.get(id).map(|e| e.value().clone()) else {
                    return Ack::ok("forward");
                };

                let mut edited = false;
                if let Some(edit) = edit {
                    edited = !edit.is_empty();
                    if let Some(method) = edit.method {
                        exchange.method = method;
                    }
                    if let Some(url) = edit.url {
                        // Scheme or host changes reroute the request.
                        exchange.url = url;
                    }
                    if let Some(headers) = edit.headers {
                        exchange.headers = headers;
                    }
                    if let Some(body) = edit.body {
                        exchange.body = body;
                    }
                }
                // Content-Length always derives from the final body; a
                // stale value in an edited header list is overwritten.
                if edited
                    && (!exchange.body.is_empty()
                        || exchange.headers.get("Content-Length").is_some())
                {
                    exchange.headers.set_content_length(exchange.body.len());
                }
                if let Some(flag) = intercept_response {
                    exchange.intercept_response = flag;
                }
                exchange.state = ExchangeState::InFlight;
                self.live.insert(id.to_string(), exchange.clone());
                self.record(HistoryRecord::Updated(exchange.clone()));

                let overrides = RequestOverrides {
                    method: Some(exchange.method.clone()),
                    url: Some(exchange.url.clone()),
                    headers: Some(exchange.headers.clone()),
                    body: Some(exchange.body.clone()),
                };
                if let Err(e) = token.resume(Some(overrides)).await {
                    warn!("Upstream release of [{}] failed: {}", id, e);
                    self.fail_exchange(id, format!("upstream release failed: {}", e));
                }
                Ack::ok("forward")
            }
            SuspendedPhase::Response(token) => {
                let Some(mut exchange) = self.live.get(id).map(|e| e.value().clone()) else {
                    return Ack::ok("forward");
                };

                if let Some(edit) = edit {
                    let edited = !edit.is_empty();
                    if let Some(res) = exchange.response.as_mut() {
                        if let Some(status) = edit.status {
                            res.status = status;
                        }
                        if let Some(headers) = edit.headers {
                            res.headers = headers;
                        }
                        if let Some(body) = edit.body {
                            res.body = body;
                        }
                        if edited
                            && (!res.body.is_empty()
                                || res.headers.get("Content-Length").is_some())
                        {
                            res.headers.set_content_length(res.body.len());
                        }
                    }
                }
                exchange.state = ExchangeState::Completed;
                self.live.remove(id);
                self.by_driver.remove(&exchange.driver_id);
                self.router.publish(OutboundMessage::Capture(ExchangeEvent::response(
                    &exchange, false, None,
                )));
                self.record(HistoryRecord::Updated(exchange.clone()));

                let overrides = exchange.response.as_ref().map(|res| ResponseOverrides {
                    status: Some(res.status),
                    headers: Some(res.headers.clone()),
                    body: Some(res.body.clone()),
                });
                if let Err(e) = token.fulfill(overrides).await {
                    warn!("Response delivery for [{}] failed: {}", id, e);
                }
                Ack::ok("forward")
            }
        }
    }

    /// Abort a suspended exchange. Unknown ids acknowledge as no-ops.
    pub async fn drop_exchange(&self, id: &str) -> Ack {
        let Some((_, entry)) = self.suspended.remove(id) else {
            return Ack::ok("drop");
        };

        let aborted = match entry.phase {
            SuspendedPhase::Request(token) => token.abort().await,
            SuspendedPhase::Response(token) => token.abort().await,
        };
        if let Err(e) = aborted {
            debug!("Abort of [{}] failed: {}", id, e);
        }

        if let Some((_, mut exchange)) = self.live.remove(id) {
            self.by_driver.remove(&exchange.driver_id);
            exchange.dropped = true;
            exchange.state = ExchangeState::Dropped;
            info!("Exchange [{}] dropped by operator", id);
            self.record(HistoryRecord::Updated(exchange));
        }
        Ack::ok("drop")
    }

    // ---- internals ------------------------------------------------------

    /// Tear down a live exchange after an upstream failure, with the
    /// synthetic-error response event the history correlates on.
    fn fail_exchange(&self, id: &str, message: String) {
        if let Some((_, mut exchange)) = self.live.remove(id) {
            self.by_driver.remove(&exchange.driver_id);
            exchange.dropped = true;
            exchange.state = ExchangeState::Dropped;
            self.router.publish(OutboundMessage::Capture(ExchangeEvent::response(
                &exchange,
                false,
                Some(message),
            )));
            self.record(HistoryRecord::Updated(exchange));
        }
    }

    fn record(&self, record: HistoryRecord) {
        if self.history_tx.send(record).is_err() {
            debug!("History consumer gone, capture log entry lost");
        }
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "",
    }
}
