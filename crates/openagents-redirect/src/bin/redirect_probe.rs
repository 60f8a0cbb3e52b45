use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use openagents_redirect::{
    BeginOptions, DetachedSurface, ExternalSurface, LaunchError, Launcher, LoopbackTransport,
    PortPolicy, Presentation, RedirectConfig, RedirectController, Resolution,
};
use serde_json::json;
use url::Url;

/// Runs one loopback redirect end to end and prints the outcome as JSON.
#[derive(Parser, Debug)]
struct Args {
    /// URL to open, e.g. an OAuth authorize endpoint.
    url: String,
    /// Port policy override: `0`, a port, or `start-end`.
    #[arg(long)]
    port: Option<String>,
    /// Timeout override in milliseconds; `0` waits forever.
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// Query parameter that carries the loopback callback URI.
    #[arg(long, default_value = "redirect_uri")]
    redirect_param: String,
    /// Log the launch URL instead of opening a browser.
    #[arg(long)]
    no_browser: bool,
}

struct LogOnlyLauncher;

impl Launcher for LogOnlyLauncher {
    fn launch(
        &self,
        url: &Url,
        presentation: &Presentation,
    ) -> Result<Arc<dyn ExternalSurface>, LaunchError> {
        tracing::info!(url = %url, presentation = %presentation, "Open this URL to continue");
        Ok(Arc::new(DetachedSurface::default()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = RedirectConfig::from_env().context("load redirect config")?;
    if let Some(port) = args.port.as_deref() {
        config.port = PortPolicy::parse(port)
            .map_err(|error| anyhow::anyhow!("invalid --port: {error}"))?;
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.timeout = (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms));
    }

    let launcher: Arc<dyn Launcher> = if args.no_browser {
        Arc::new(LogOnlyLauncher)
    } else {
        Arc::new(config.launcher())
    };
    let controller = RedirectController::new(launcher);
    let transport = Arc::new(LoopbackTransport::new(config.loopback_options()));
    let mut options = BeginOptions::new(transport).with_redirect_param(args.redirect_param);
    if let Some(timeout) = config.timeout {
        options = options.with_timeout(timeout);
    }

    let handle = controller.begin(&args.url, options);
    let resolution = tokio::select! {
        resolution = handle.result() => resolution,
        _ = tokio::signal::ctrl_c() => {
            handle.cancel();
            handle.result().await
        }
    };

    let report = json!({
        "operation_id": handle.id().to_string(),
        "outcome": resolution.label(),
        "callback_uri": resolution.callback_uri().map(Url::as_str),
        "error_kind": resolution.error().map(|error| error.kind().as_str()),
        "error": resolution.error().map(ToString::to_string),
    });
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", serde_json::to_string_pretty(&report)?)?;

    if let Resolution::Succeeded(_) = resolution {
        Ok(())
    } else {
        bail!("redirect did not complete: {resolution}")
    }
}
