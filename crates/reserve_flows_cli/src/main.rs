//! reserve-flows CLI: balance snapshots and weekly/daily flows per entity.

use clap::{Parser, Subcommand};
use reserve_flows::{AddressRow, ChainRegistry, EntityReport, HttpTransport, Orchestrator, ScanConfig, ScanContext, Window};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    match cli.command {
        Command::Balances(args) => run_balances(args),
        Command::Flows(args) => run_flows(args),
    }
}

#[derive(Parser)]
#[command(name = "reserve-flows")]
#[command(author = "gorusys <goru.connector@outlook.com>")]
#[command(about = "Multi-chain reserve balances and fund flows (Bitcoin, EVM, Solana, Tron)")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Current balance of every configured asset at every address.
    Balances(BalancesArgs),
    /// Weekly and daily inflow/outflow within a window.
    Flows(FlowsArgs),
}

#[derive(Parser)]
struct CommonArgs {
    /// Scan config JSON; falls back to RESERVE_FLOWS_CONFIG, then ./config/reserve_flows.json.
    #[arg(long)]
    config: Option<PathBuf>,
    /// JSON array of {entity, chain, address}.
    #[arg(long)]
    rows: PathBuf,
    /// Give up after this many seconds, keeping what was gathered.
    #[arg(long)]
    timeout_secs: Option<u64>,
    /// Write the report here instead of stdout.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Parser)]
struct BalancesArgs {
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Parser)]
struct FlowsArgs {
    #[command(flatten)]
    common: CommonArgs,
    /// Window start, RFC3339 (inclusive).
    #[arg(long)]
    from: String,
    /// Window end, RFC3339 (exclusive).
    #[arg(long)]
    to: String,
}

struct Setup {
    config: ScanConfig,
    registry: ChainRegistry,
    rows: Vec<AddressRow>,
    ctx: ScanContext,
}

fn setup(common: &CommonArgs) -> Result<Setup, Box<dyn std::error::Error>> {
    let config = ScanConfig::load(common.config.as_deref())?;
    let transport = Arc::new(HttpTransport::new()?);
    let registry = config.build_registry(&config.client(transport))?;
    let rows: Vec<AddressRow> = serde_json::from_str(&std::fs::read_to_string(&common.rows)?)?;
    let mut ctx = ScanContext::new();
    if let Some(secs) = common.timeout_secs {
        ctx = ctx.with_timeout(Duration::from_secs(secs));
    }
    info!(chains = registry.len(), rows = rows.len(), "scan configured");
    Ok(Setup {
        config,
        registry,
        rows,
        ctx,
    })
}

/// Cancel the scan on Ctrl-C so partial results are still written.
fn cancel_on_ctrl_c(rt: &tokio::runtime::Runtime, ctx: ScanContext) -> ScanContext {
    let token = CancellationToken::new();
    let child = token.clone();
    rt.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, finishing with partial results");
            child.cancel();
        }
    });
    ctx.with_cancel(token)
}

fn write_reports(reports: &[EntityReport], out: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let json = serde_json::to_string_pretty(reports)?;
    match out {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            std::fs::write(path, json)?;
            info!(path = %path.display(), "report written");
        }
        None => println!("{json}"),
    }
    let failures: usize = reports.iter().map(|r| r.failures.len()).sum();
    if failures > 0 {
        warn!(failures, "some scan steps failed; see failures in the report");
    }
    Ok(())
}

fn run_balances(args: BalancesArgs) -> Result<(), Box<dyn std::error::Error>> {
    let s = setup(&args.common)?;
    let rt = tokio::runtime::Runtime::new()?;
    let ctx = cancel_on_ctrl_c(&rt, s.ctx);
    let orchestrator = Orchestrator::new(s.registry);
    let reports = rt.block_on(orchestrator.snapshot(&s.rows, &ctx));
    write_reports(&reports, args.common.out.as_deref())
}

fn run_flows(args: FlowsArgs) -> Result<(), Box<dyn std::error::Error>> {
    let window = Window::parse_rfc3339(&args.from, &args.to)?;
    let s = setup(&args.common)?;
    let offset = s.config.reporting_offset()?;
    let rt = tokio::runtime::Runtime::new()?;
    let ctx = cancel_on_ctrl_c(&rt, s.ctx);
    let orchestrator = Orchestrator::new(s.registry);
    let reports = rt.block_on(orchestrator.flows(&s.rows, &window, offset, &ctx));
    info!(
        entities = reports.len(),
        from = %args.from,
        to = %args.to,
        "flows computed"
    );
    write_reports(&reports, args.common.out.as_deref())
}
