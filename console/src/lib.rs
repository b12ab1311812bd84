//! Operator console: wires the mediation engine, the browser driver, the
//! project store, and the operator channel into one local process.

pub mod api;
pub mod error;
pub mod store;
pub mod ws;

pub use error::{ConsoleError, ConsoleResult};

use axum::routing::get;
use axum::Router;
use browser_driver::{BrowserOptions, ChromiumDriver};
use mediator_core::coordinator::{CoordinatorConfig, HistoryRecord, InterceptionCoordinator};
use mediator_core::driver::{BrowserDriver, DriverEvent};
use mediator_core::events::{Notice, OutboundMessage};
use mediator_core::{OperatorRouter, Project, ReplayExecutor};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use store::ProjectStore;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct ConsoleConfig {
    pub project_root: PathBuf,
    pub project: String,
    pub bind: String,
    pub port: u16,
    pub browser: BrowserOptions,
    pub grace_period: Duration,
}

pub struct AppState {
    pub coordinator: Arc<InterceptionCoordinator>,
    pub router: Arc<OperatorRouter>,
    pub driver: Arc<dyn BrowserDriver>,
    pub replays: Arc<ReplayExecutor>,
    pub store: Arc<ProjectStore>,
    /// The project currently open; the capture log lands here.
    pub active: Arc<RwLock<Project>>,
    /// Nudges the debounced autosave task.
    autosave_tx: mpsc::Sender<()>,
    /// Cloned into the driver on every browser start.
    events_tx: mpsc::Sender<DriverEvent>,
}

impl AppState {
    pub fn schedule_save(&self) {
        // A full channel already has a pending nudge; nothing is lost.
        let _ = self.autosave_tx.try_send(());
    }

    pub fn driver_events(&self) -> mpsc::Sender<DriverEvent> {
        self.events_tx.clone()
    }

    /// Swap the open project and push its rule lists into the coordinator.
    pub async fn activate(&self, project: Project) {
        self.coordinator
            .set_exclusions(project.exclusion_rules.clone());
        self.coordinator
            .set_match_rules(project.match_replace_rules.clone());
        *self.active.write().await = project;
    }
}

/// Assemble the process: open the project, start the coordinator, the
/// janitor, the history consumer and the autosave task.
pub async fn build(config: &ConsoleConfig) -> ConsoleResult<Arc<AppState>> {
    let store = Arc::new(ProjectStore::new(&config.project_root)?);
    let project = store.load_or_create(&config.project).await?;
    info!(
        "Project '{}' open ({} history entries)",
        project.name,
        project.requests.len()
    );

    let router = Arc::new(OperatorRouter::new());
    let (history_tx, history_rx) = mpsc::unbounded_channel();
    let coordinator = Arc::new(InterceptionCoordinator::new(
        CoordinatorConfig {
            grace_period: config.grace_period,
            janitor_max_age: config.grace_period * 10,
        },
        router.clone(),
        history_tx,
    ));
    coordinator.set_exclusions(project.exclusion_rules.clone());
    coordinator.set_match_rules(project.match_replace_rules.clone());
    coordinator.clone().spawn_janitor();

    let (events_tx, events_rx) = mpsc::channel(256);
    tokio::spawn(coordinator.clone().run(events_rx));

    let driver: Arc<dyn BrowserDriver> = Arc::new(ChromiumDriver::new(config.browser.clone()));
    let replays = Arc::new(ReplayExecutor::new()?);

    let (autosave_tx, autosave_rx) = mpsc::channel(8);
    let app = Arc::new(AppState {
        coordinator,
        router,
        driver,
        replays,
        store,
        active: Arc::new(RwLock::new(project)),
        autosave_tx,
        events_tx,
    });

    spawn_history_consumer(app.clone(), history_rx);
    spawn_autosave(app.clone(), autosave_rx);
    Ok(app)
}

/// Serve the management API and the operator WebSocket until shutdown.
pub async fn serve(app: Arc<AppState>, config: &ConsoleConfig) -> ConsoleResult<()> {
    let addr: SocketAddr = format!("{}:{}", config.bind, config.port)
        .parse()
        .map_err(|e| {
            ConsoleError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("bad bind address: {}", e),
            ))
        })?;

    let router = Router::new()
        .route("/health", get(api::health))
        .route(
            "/api/projects",
            get(api::list_projects).post(api::create_project),
        )
        .route(
            "/api/projects/:name",
            get(api::load_project).put(api::replace_project),
        )
        .route("/ws", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(app);

    info!("Console listening on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

/// Mirror coordinator history records into the open project's capture log.
fn spawn_history_consumer(app: Arc<AppState>, mut rx: mpsc::UnboundedReceiver<HistoryRecord>) {
    tokio::spawn(async move {
        while let Some(record) = rx.recv().await {
            {
                let mut project = app.active.write().await;
                match record {
                    HistoryRecord::Captured(ex) | HistoryRecord::Updated(ex) => {
                        project.upsert_exchange(ex)
                    }
                }
            }
            app.schedule_save();
        }
    });
}

/// Debounced autosave: nudges coalesce for a short window, then one save
/// runs. A failed save is surfaced to the operator and retried on the next
/// nudge; in-memory state is never touched by the failure.
fn spawn_autosave(app: Arc<AppState>, mut rx: mpsc::Receiver<()>) {
    const DEBOUNCE: Duration = Duration::from_millis(1500);

    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            let window = tokio::time::sleep(DEBOUNCE);
            tokio::pin!(window);
            loop {
                tokio::select! {
                    _ = &mut window => break,
                    nudge = rx.recv() => {
                        if nudge.is_none() {
                            break;
                        }
                    }
                }
            }

            let snapshot = {
                let mut project = app.active.write().await;
                project.touch();
                project.clone()
            };
            if let Err(e) = app.store.save(&snapshot).await {
                warn!("Autosave of '{}' failed: {}", snapshot.name, e);
                app.router.publish(OutboundMessage::Notice(Notice::new(
                    "save_error",
                    format!("autosave failed: {}", e),
                )));
            }
        }
    });
}
