use anyhow::{anyhow, Context, Result};
use cdse_dem::copernicus::Provider;
use cdse_dem::credentials::{CredentialStore, TerminalPrompt};
use cdse_dem::dem::{ElevationModel, Resolution};
use cdse_dem::download_plan::DownloadPlan;
use cdse_dem::error::DemError;
use cdse_dem::report::Verdict;
use cdse_dem::resolver::TileResolver;
use cdse_dem::settings::Settings;
use cdse_dem::tile_index::TileIndex;
use cdse_dem::token::TokenManager;
use cdse_dem::work_list::{read_work_list, WorkItem};
use clap::Parser;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const PLAN_FILE: &str = "download_plan.json";
const REPORT_FILE: &str = "dem_report.json";

// Setup errors exit with 1 (`ExitCode::FAILURE`).
const EXIT_ABORTED: u8 = 2;
const EXIT_AUTH_FAILED: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "cdse-dem")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Download the Copernicus DEM tiles covering Sentinel-2 MGRS tiles", long_about = None)]
struct Cli {
    /// Settings file (TOML, or the legacy configuration.xml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// DEM resolution in metres (30 or 90)
    #[arg(short, long)]
    resolution: Option<Resolution>,

    /// Elevation model (DGED or DTED)
    #[arg(short, long)]
    model: Option<ElevationModel>,

    /// Output directory
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Work list: one MGRS tile id or SAFE product name per line
    #[arg(short, long, conflicts_with = "tile")]
    input: Option<PathBuf>,

    /// A single MGRS tile id or SAFE product name
    #[arg(short, long)]
    tile: Option<String>,

    /// Delete the stored credentials and exit
    #[arg(long)]
    reset: bool,

    /// Where to write the batch report (defaults to the output directory)
    #[arg(long)]
    report: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut settings = match &cli.config {
        Some(path) => Settings::load_or_create(path)
            .with_context(|| format!("Reading settings from {}", path.display()))?,
        None => Settings::default(),
    };
    if let Some(resolution) = cli.resolution {
        settings.dem.resolution = resolution;
    }
    if let Some(model) = cli.model {
        settings.dem.elevation_model = model;
    }
    if let Some(output) = cli.output {
        settings.paths.output = output;
    }
    if let Some(input) = cli.input {
        settings.paths.work_list = input;
    }

    let store_dir = match &settings.paths.credentials {
        Some(dir) => dir.clone(),
        None => CredentialStore::default_dir()
            .ok_or_else(|| anyhow!("Unable to locate the user configuration directory"))?,
    };
    let store = CredentialStore::new(store_dir);

    if cli.reset {
        reset_credentials(&store)?;
        return Ok(ExitCode::SUCCESS);
    }

    // Everything that can fail locally is checked before touching the network.
    let index = TileIndex::load(&settings.paths.tile_index)?;
    let items = match &cli.tile {
        Some(tile) => vec![WorkItem::parse(tile)?],
        None => read_work_list(&settings.paths.work_list)
            .with_context(|| format!("Reading {}", settings.paths.work_list.display()))?,
    };
    info!("{} MGRS tiles to cover with {}", items.len(), settings.dem);

    let resolver = TileResolver::new(&index, settings.dem.clone());
    let tiles = resolver.resolve_batch(&items)?;

    std::fs::create_dir_all(&settings.paths.output)?;
    let plan = DownloadPlan::new(tiles, &settings.paths.output);
    plan.write(settings.paths.output.join(PLAN_FILE))?;
    info!("{} DEM tiles planned", plan.len());
    if plan.is_empty() {
        warn!("Nothing to download");
    }

    let credential = store.load_or_enroll(&mut TerminalPrompt)?;
    let provider = Provider::new(settings.endpoints.clone(), settings.http_timeout())?;
    let mut tokens = TokenManager::new(
        provider.clone(),
        settings.token_policy(),
        settings.retry_config(),
    );
    let report_path = cli
        .report
        .unwrap_or_else(|| settings.paths.output.join(REPORT_FILE));

    if let Err(e) = tokens.authenticate(&credential).await {
        error!("Authentication failed: {e}");
        if matches!(e, DemError::AuthRejected(_)) {
            error!("Credentials were rejected, run with --reset to enter them again");
        }
        plan.abandoned(&e).write(&report_path)?;
        info!("Report written to {}", report_path.display());
        return Ok(ExitCode::from(EXIT_AUTH_FAILED));
    }

    let report = plan
        .execute(&mut tokens, &provider, &settings.pipeline_config())
        .await;
    report.write(&report_path)?;

    let summary = report.summary();
    info!(
        "{} fetched, {} already present, {} not found, {} failed, {} not attempted",
        summary.fetched, summary.skipped, summary.not_found, summary.failed, summary.token_expired
    );
    info!("Report written to {}", report_path.display());

    let verdict = report.verdict();
    match verdict {
        Verdict::FullySucceeded => info!("All DEM tiles are available"),
        Verdict::Partial => warn!("Some DEM tiles could not be retrieved"),
        Verdict::NothingFound => warn!("The catalog holds none of the requested DEM tiles"),
        Verdict::AllFailed => error!("No DEM tile could be retrieved"),
        Verdict::Aborted => error!("The run was aborted before completion"),
    }

    Ok(match verdict {
        Verdict::Aborted => ExitCode::from(EXIT_ABORTED),
        _ => ExitCode::SUCCESS,
    })
}

fn reset_credentials(store: &CredentialStore) -> Result<()> {
    if !store.has_credentials() {
        info!("No stored credentials in {}", store.dir().display());
        return Ok(());
    }

    print!(
        "Delete the stored credentials in {}? [y/N] ",
        store.dir().display()
    );
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;

    if matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes") {
        store.reset(true)?;
        info!("Credentials deleted, they will be asked for on the next run");
    } else {
        info!("Credentials kept");
    }
    Ok(())
}
