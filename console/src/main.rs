use browser_driver::BrowserOptions;
use clap::Parser;
use console::ConsoleConfig;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Specter - interactive intercepting proxy driven by an instrumented browser
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory holding project documents
    #[arg(long, default_value = "./projects")]
    project_root: PathBuf,

    /// Project to open at startup (created if missing)
    #[arg(long, default_value = "default")]
    project: String,

    /// Local bind address for the API and operator WebSocket
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// HTTP port
    #[arg(long, default_value_t = 8844)]
    port: u16,

    /// Chromium executable override
    #[arg(long)]
    browser_path: Option<PathBuf>,

    /// Run the browser headless
    #[arg(long)]
    headless: bool,

    /// Seconds a disconnected operator may reconnect before suspended
    /// exchanges are auto-forwarded
    #[arg(long, default_value_t = 5)]
    grace_period: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "console=info,mediator_core=info,browser_driver=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut browser = BrowserOptions {
        headless: args.headless,
        ..Default::default()
    };
    if let Some(path) = args.browser_path.clone() {
        browser = browser.with_executable(path);
    }

    let config = ConsoleConfig {
        project_root: args.project_root.clone(),
        project: args.project.clone(),
        bind: args.bind.clone(),
        port: args.port,
        browser,
        grace_period: Duration::from_secs(args.grace_period),
    };

    let app = console::build(&config).await?;

    println!("🚀 Specter starting...");
    println!("🌐 API:              http://{}:{}/api/projects", args.bind, args.port);
    println!("🔌 Operator channel: ws://{}:{}/ws", args.bind, args.port);
    println!("📁 Project root:     {}", args.project_root.display());
    println!("📂 Open project:     {}", args.project);
    println!();
    println!("💡 Tip: Use --help to see all available options");
    println!();

    console::serve(app, &config).await?;
    Ok(())
}
