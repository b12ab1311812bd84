//! Chromium-backed implementation of the mediator's browser-driver
//! contract.
//!
//! No MITM certificate authority exists anywhere in this system: the
//! browser pauses its own traffic through the DevTools Fetch domain, so
//! TLS terminates normally at the origin and the operator still sees and
//! edits plaintext.

pub mod error;
mod intercept;
pub mod launch;

pub use error::{DriverError, DriverResult};
pub use launch::BrowserOptions;

use async_trait::async_trait;
use chromiumoxide::Page;
use launch::LaunchedBrowser;
use mediator_core::driver::{BrowserDriver, DriverEvent};
use mediator_core::Result as MediatorResult;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

struct Running {
    launched: LaunchedBrowser,
    _page: Page,
    pump_task: JoinHandle<()>,
}

/// The instrumented browser. One instance at a time; `start` supplants a
/// previous launch.
pub struct ChromiumDriver {
    options: BrowserOptions,
    running: Mutex<Option<Running>>,
    is_up: AtomicBool,
}

impl ChromiumDriver {
    pub fn new(options: BrowserOptions) -> Self {
        Self {
            options,
            running: Mutex::new(None),
            is_up: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl BrowserDriver for ChromiumDriver {
    async fn start(&self, events: mpsc::Sender<DriverEvent>) -> MediatorResult<()> {
        let mut slot = self.running.lock().await;
        if let Some(previous) = slot.take() {
            info!("Replacing running browser instance");
            previous.pump_task.abort();
            previous.launched.close().await;
        }

        let launched = launch::launch(&self.options).await?;
        let page = launched
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| DriverError::Launch(e.to_string()))?;

        intercept::enable(&page).await?;
        let pump_task = intercept::spawn_pump(page.clone(), events).await?;

        *slot = Some(Running {
            launched,
            _page: page,
            pump_task,
        });
        self.is_up.store(true, Ordering::SeqCst);
        info!("Browser instrumented, interception active");
        Ok(())
    }

    async fn stop(&self) -> MediatorResult<()> {
        let mut slot = self.running.lock().await;
        self.is_up.store(false, Ordering::SeqCst);
        match slot.take() {
            Some(running) => {
                running.pump_task.abort();
                running.launched.close().await;
                info!("Browser stopped");
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn is_running(&self) -> bool {
        self.is_up.load(Ordering::SeqCst)
    }
}
