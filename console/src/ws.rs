//! The operator channel: one full-duplex WebSocket at `/ws`.
//!
//! The writer task drains the router's bounded queue, so outbound order is
//! preserved per connection while a slow client sheds captures instead of
//! stalling the browser. Inbound commands run in their own tasks: decisions
//! on independent exchanges proceed concurrently.

use crate::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use mediator_core::events::{Ack, Command, OutboundMessage};
use std::sync::Arc;
use tracing::{info, warn};

pub async fn ws_handler(State(app): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| operator_session(app, socket))
}

async fn operator_session(app: Arc<AppState>, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let epoch = app.router.connect();
    app.coordinator.operator_attached();
    info!("Operator connected (epoch {})", epoch);

    let writer = {
        let app = app.clone();
        tokio::spawn(async move {
            while let Some(msg) = app.router.next(epoch).await {
                match serde_json::to_string(&msg) {
                    Ok(text) => {
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Outbound message failed to serialize: {}", e),
                }
            }
            let _ = sink.close().await;
        })
    };

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<Command>(&text) {
                Ok(command) => {
                    let app = app.clone();
                    tokio::spawn(async move {
                        let ack = dispatch(&app, command).await;
                        app.router.publish(OutboundMessage::Ack(ack));
                    });
                }
                Err(e) => {
                    // Malformed commands are operator errors: acked, never
                    // fatal to the channel.
                    app.router
                        .publish(OutboundMessage::Ack(Ack::err("parse", e.to_string())));
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    if app.router.disconnect(epoch) {
        app.coordinator.clone().operator_detached();
    }
    writer.abort();
    info!("Operator disconnected (epoch {})", epoch);
}

async fn dispatch(app: &Arc<AppState>, command: Command) -> Ack {
    let name = command.name();
    match command {
        Command::Start => match app.driver.start(app.driver_events()).await {
            Ok(()) => Ack::ok(name),
            Err(e) => Ack::err(name, e.to_string()),
        },
        Command::Stop => {
            app.coordinator.drop_all().await;
            match app.driver.stop().await {
                Ok(()) => Ack::ok(name),
                Err(e) => Ack::err(name, e.to_string()),
            }
        }
        Command::InterceptRequests { enabled } => {
            app.coordinator.set_intercept_requests(enabled);
            Ack::ok(name)
        }
        Command::Forward {
            id,
            modified,
            intercept_response,
        } => app.coordinator.forward(&id, modified, intercept_response).await,
        Command::Drop { id } => app.coordinator.drop_exchange(&id).await,
        Command::Replay {
            tab_id,
            raw_request,
        } => {
            let outcome = app.replays.execute(&tab_id, &raw_request).await;
            {
                let mut project = app.active.write().await;
                match project.repeater_tabs.iter_mut().find(|t| t.id == tab_id) {
                    Some(tab) => {
                        tab.request = raw_request;
                        tab.response = outcome.raw.clone();
                    }
                    None => project.repeater_tabs.push(mediator_core::RepeaterTab {
                        id: tab_id.clone(),
                        name: tab_id.clone(),
                        request: raw_request,
                        response: outcome.raw.clone(),
                    }),
                }
            }
            app.schedule_save();
            app.router
                .publish(OutboundMessage::ReplayResponse(outcome));
            Ack::ok(name)
        }
        Command::ReplayCancel { tab_id } => {
            // Cancelling a finished replay is a no-op, like any stale
            // decision.
            app.replays.cancel(&tab_id);
            Ack::ok(name)
        }
        Command::InterceptResponse { id, enabled } => {
            app.coordinator.set_intercept_response(&id, enabled);
            Ack::ok(name)
        }
        Command::SetExclusions { rules } => {
            let problems = mediator_core::exclusion::invalid_patterns(&rules);
            app.coordinator.set_exclusions(rules.clone());
            app.active.write().await.exclusion_rules = rules;
            app.schedule_save();
            if problems.is_empty() {
                Ack::ok(name)
            } else {
                Ack::err(name, format!("invalid pattern(s): {}", problems.join("; ")))
            }
        }
        Command::PurgeHistory => {
            let rules = app.coordinator.exclusions_snapshot();
            let removed = app.active.write().await.purge_excluded(&rules);
            info!("Purged {} history entr(ies) by exclusion rules", removed);
            app.schedule_save();
            Ack::ok(name)
        }
        Command::SetMatchReplace { rules } => {
            let problems = mediator_core::rewrite::invalid_patterns(&rules);
            app.coordinator.set_match_rules(rules.clone());
            app.active.write().await.match_replace_rules = rules;
            app.schedule_save();
            if problems.is_empty() {
                Ack::ok(name)
            } else {
                Ack::err(name, format!("invalid pattern(s): {}", problems.join("; ")))
            }
        }
        Command::SetTabs { tabs } => {
            app.active.write().await.repeater_tabs = tabs;
            app.schedule_save();
            Ack::ok(name)
        }
    }
}
