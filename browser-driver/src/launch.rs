//! Chromium launch configuration and lifecycle.

use crate::error::{DriverError, DriverResult};
use chromiumoxide::{Browser, BrowserConfig};
use futures::StreamExt;
use std::path::PathBuf;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// Browser launch options.
#[derive(Debug, Clone)]
pub struct BrowserOptions {
    /// Run without a visible UI. The operator usually drives the browser by
    /// hand, so the default is headed.
    pub headless: bool,
    /// Override the Chromium executable discovered on PATH.
    pub executable: Option<PathBuf>,
    /// Additional Chrome arguments.
    pub extra_args: Vec<String>,
    /// Window size.
    pub window_size: Option<(u32, u32)>,
}

impl Default for BrowserOptions {
    fn default() -> Self {
        Self {
            headless: false,
            executable: None,
            extra_args: Vec::new(),
            window_size: Some((1440, 900)),
        }
    }
}

impl BrowserOptions {
    pub fn headless() -> Self {
        Self {
            headless: true,
            ..Default::default()
        }
    }

    pub fn with_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable = Some(path.into());
        self
    }
}

/// A launched browser plus its event-pump task and profile directory.
pub(crate) struct LaunchedBrowser {
    pub browser: Browser,
    pub handler_task: JoinHandle<()>,
    pub user_data_dir: PathBuf,
}

impl LaunchedBrowser {
    pub async fn close(mut self) {
        self.handler_task.abort();
        if let Err(e) = self.browser.close().await {
            warn!("Browser close failed: {:?}", e);
        }
        if self.user_data_dir.exists() {
            info!("Cleaning up browser profile: {:?}", self.user_data_dir);
            if let Err(e) = std::fs::remove_dir_all(&self.user_data_dir) {
                warn!("Failed to remove browser profile dir: {:?}", e);
            }
        }
    }
}

/// Launch Chromium with the given options and start its event pump.
pub(crate) async fn launch(options: &BrowserOptions) -> DriverResult<LaunchedBrowser> {
    let mut config_builder = BrowserConfig::builder();

    // A unique user data directory avoids SingletonLock errors.
    let user_data_dir = std::env::temp_dir().join(format!("specter_browser_{}", Uuid::new_v4()));
    config_builder = config_builder.user_data_dir(&user_data_dir);

    // chromiumoxide defaults to headless; with_head() makes it visible.
    if !options.headless {
        config_builder = config_builder.with_head();
    }

    if let Some(exe) = &options.executable {
        config_builder = config_builder.chrome_executable(exe);
    }

    if let Some((width, height)) = options.window_size {
        config_builder = config_builder.arg(format!("--window-size={},{}", width, height));
    }

    for arg in &options.extra_args {
        config_builder = config_builder.arg(arg);
    }

    config_builder = config_builder
        .arg("--disable-blink-features=AutomationControlled")
        .arg("--no-first-run")
        .arg("--no-default-browser-check");

    let config = config_builder
        .build()
        .map_err(DriverError::Launch)?;

    let (browser, mut handler) = Browser::launch(config)
        .await
        .map_err(|e| DriverError::Launch(format!("failed to launch browser: {}", e)))?;

    let handler_task = tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if let Err(e) = event {
                warn!("Browser event error: {:?}", e);
            }
        }
    });

    info!("Browser launched (headless: {})", options.headless);
    Ok(LaunchedBrowser {
        browser,
        handler_task,
        user_data_dir,
    })
}
