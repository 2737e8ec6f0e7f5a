mod api;
mod auth;
mod config;
mod diagnostics;
mod embed;
mod frame;
mod guest;
mod mount;
mod policy;
mod report;
mod sdk;
#[cfg(test)]
mod testing;

use crate::config::{AppConfig, ConfigOverlay, DashboardId};
use crate::diagnostics::Diagnostics;
use crate::embed::Embedder;
use crate::mount::Page;
use crate::report::DiagnosticReport;
use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "superset-embed",
    version,
    about = "Embed Superset dashboards with guest tokens and diagnose embedding setups"
)]
struct Cli {
    /// TOML config file, applied over the defaults and under env/flags
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    cmd: Command,
}

/// Highest-priority configuration layer.
#[derive(Args, Debug, Default)]
struct Overrides {
    /// Superset base URL, e.g. http://localhost:8088
    #[arg(long, global = true)]
    base_url: Option<String>,

    #[arg(long, global = true)]
    username: Option<String>,

    #[arg(long, global = true)]
    password: Option<String>,

    /// Numeric id or slug of the dashboard
    #[arg(long, global = true)]
    dashboard_id: Option<String>,

    /// Per-request timeout in milliseconds
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    /// URL of the embedded SDK ES module
    #[arg(long, global = true)]
    sdk_url: Option<String>,

    /// Origin of the page that hosts the dashboard
    #[arg(long = "origin", global = true)]
    embed_origin: Option<String>,
}

impl From<Overrides> for ConfigOverlay {
    fn from(o: Overrides) -> Self {
        ConfigOverlay {
            base_url: o.base_url,
            username: o.username,
            password: o.password,
            dashboard_id: o.dashboard_id.as_deref().map(DashboardId::parse),
            timeout_ms: o.timeout_ms,
            sdk_url: o.sdk_url,
            embed_origin: o.embed_origin,
            ..ConfigOverlay::default()
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the embedding diagnostics against the configured server.
    Diagnose {
        /// Print the report as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Render the embedded dashboard into a host page.
    Embed {
        /// Host page containing the mount element; a blank page when omitted
        #[arg(long)]
        page: Option<PathBuf>,

        /// Write the page here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,

        /// Re-embed with a fresh guest token on this interval until interrupted
        #[arg(long)]
        refresh_secs: Option<u64>,
    },

    /// Print a fresh guest token for the configured dashboard.
    Token,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref(), cli.overrides.into())?;
    tracing::debug!(base_url = %config.base_url, dashboard = %config.dashboard_id, "configuration loaded");

    match cli.cmd {
        Command::Diagnose { json } => diagnose(config, json).await,
        Command::Embed {
            page,
            out,
            refresh_secs,
        } => embed(config, page.as_deref(), out.as_deref(), refresh_secs).await,
        Command::Token => token(config).await,
    }
}

async fn diagnose(config: AppConfig, json: bool) -> anyhow::Result<ExitCode> {
    let diagnostics = Diagnostics::from_config(config)?;
    let results = diagnostics.run().await;
    let report = DiagnosticReport::new(diagnostics.config(), results);
    if json {
        println!("{}", report.to_json()?);
    } else {
        print!("{}", report.to_text());
    }
    Ok(exit_code(!report.has_failures()))
}

async fn embed(
    config: AppConfig,
    page_path: Option<&Path>,
    out: Option<&Path>,
    refresh_secs: Option<u64>,
) -> anyhow::Result<ExitCode> {
    let page = match page_path {
        Some(path) => {
            let html = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading host page {}", path.display()))?;
            Page::parse(&html)
        }
        None => Page::blank(),
    };
    let mut embedder = Embedder::from_config(config)?;

    let embedded = embedder.init_embed(&page).await;
    write_page(&page, out).await?;

    let Some(secs) = refresh_secs.filter(|s| *s > 0) else {
        return Ok(exit_code(embedded.is_some()));
    };
    tracing::info!(every_secs = secs, "refreshing embed until interrupted");
    let mut ticker = tokio::time::interval(Duration::from_secs(secs));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                embedder.refresh_embed(&page).await;
                write_page(&page, out).await?;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted; stopping refresh");
                break;
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn token(config: AppConfig) -> anyhow::Result<ExitCode> {
    let mut embedder = Embedder::from_config(config)?;
    match embedder.fetch_token().await {
        Some(token) => {
            println!("{token}");
            Ok(ExitCode::SUCCESS)
        }
        None => Ok(ExitCode::FAILURE),
    }
}

async fn write_page(page: &Page, out: Option<&Path>) -> anyhow::Result<()> {
    let html = page.to_html();
    match out {
        Some(path) => tokio::fs::write(path, html)
            .await
            .with_context(|| format!("writing page to {}", path.display())),
        None => {
            println!("{html}");
            Ok(())
        }
    }
}

fn exit_code(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_become_the_top_config_layer() {
        let cli = Cli::parse_from([
            "superset-embed",
            "--base-url",
            "https://bi.example.com",
            "--dashboard-id",
            "sales-overview",
            "--origin",
            "https://app.example.com",
            "diagnose",
            "--json",
        ]);
        assert!(matches!(cli.cmd, Command::Diagnose { json: true }));

        let mut config = AppConfig::default();
        config.apply(cli.overrides.into());
        assert_eq!(config.base_url, "https://bi.example.com");
        assert_eq!(
            config.dashboard_id,
            DashboardId::Slug("sales-overview".into())
        );
        assert_eq!(config.embed_origin, "https://app.example.com");
        assert_eq!(config.username, AppConfig::default().username);
    }

    #[test]
    fn global_flags_are_accepted_after_the_subcommand() {
        let cli = Cli::parse_from(["superset-embed", "token", "--timeout-ms", "1500"]);
        assert!(matches!(cli.cmd, Command::Token));
        assert_eq!(cli.overrides.timeout_ms, Some(1500));
    }

    #[tokio::test]
    async fn embed_writes_the_page_to_the_output_file() {
        use crate::testing::{StubBehavior, StubSuperset};

        let stub = StubSuperset::spawn(StubBehavior::default()).await;
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("dashboard.html");

        let code = embed(stub.config(), None, Some(out.as_path()), None).await.unwrap();
        assert_eq!(code, ExitCode::SUCCESS);
        let html = std::fs::read_to_string(&out).unwrap();
        assert!(html.contains("id=\"dashboardWrapper\""));
        assert!(html.contains("embedDashboard"));
    }
}
