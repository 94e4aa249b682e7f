mod error;
mod models;
mod pkce;
mod portal;
mod readings;
mod schedule;
mod service;
mod settings;
mod statistics;
mod storage;

use clap::{Parser, Subcommand};
use error::AppError;
use models::{Series, StatisticMetadata, StatisticPoint};
use portal::{PortalEndpoints, ThamesWaterPortal};
use schedule::{run_daemon, FetchSchedule};
use serde::Serialize;
use service::MeterService;
use settings::{
    db_path, ensure_initialized, get_password, load_config, parse_fetch_hours, save_config,
    set_password, AppConfig, MeterSettings,
};
use std::sync::Arc;
use storage::SqliteStore;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "water-meter")]
#[command(about = "Hourly smart water meter statistics from the Thames Water portal")]
struct Cli {
    /// Log at debug level.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init,
    Configure {
        #[arg(long)]
        email: String,
        #[arg(long)]
        account_number: String,
        #[arg(long)]
        meter_id: String,
        /// Stored in the OS keyring, never in config.toml.
        #[arg(long)]
        password: Option<String>,
        #[arg(long)]
        liter_cost: Option<f64>,
        /// Comma-separated local hours, e.g. "15,23".
        #[arg(long)]
        fetch_hours: Option<String>,
        #[arg(long)]
        timezone: Option<String>,
    },
    /// Run one update cycle now.
    Refresh,
    /// Run update cycles on the fetch schedule until interrupted.
    Run,
    Export {
        #[arg(long, default_value = "consumption")]
        series: String,
        #[arg(long, default_value = "json")]
        format: String,
    },
}

fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "water_meter=debug"
    } else {
        "water_meter=info"
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new(default_directive(true))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(false)))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_series(input: &str) -> Result<Series, AppError> {
    match input.to_ascii_lowercase().as_str() {
        "consumption" => Ok(Series::Consumption),
        "cost" => Ok(Series::Cost),
        _ => Err(AppError::Config(
            "Unsupported series. Use consumption or cost.".into(),
        )),
    }
}

#[derive(Debug, Serialize)]
struct SeriesExport {
    metadata: Option<StatisticMetadata>,
    points: Vec<StatisticPoint>,
}

fn render_csv(points: &[StatisticPoint]) -> String {
    let mut out = String::from("hour_start,value,cumulative_sum\n");
    for p in points {
        out.push_str(&format!(
            "{},{},{}\n",
            p.hour_start.to_rfc3339(),
            p.value,
            p.cumulative_sum
        ));
    }
    out
}

fn apply_overrides(
    cfg: &mut AppConfig,
    liter_cost: Option<f64>,
    fetch_hours: Option<String>,
    timezone: Option<String>,
) -> Result<(), AppError> {
    if let Some(cost) = liter_cost {
        cfg.liter_cost = cost;
    }
    if let Some(hours) = fetch_hours {
        if parse_fetch_hours(&hours).is_none() {
            return Err(AppError::Config(format!(
                "invalid fetch_hours '{hours}'. Use comma-separated hours between 0 and 23."
            )));
        }
        cfg.fetch_hours = Some(hours);
    }
    if let Some(tz) = timezone {
        cfg.timezone = tz;
    }
    Ok(())
}

/// Validates settings and wires the live portal to the local store. No
/// network I/O happens here.
fn build_service(cfg: &AppConfig) -> Result<MeterService, AppError> {
    let password = get_password(cfg.email.as_deref());
    let settings = MeterSettings::from_config(cfg, password)?;
    let store = SqliteStore::open(&db_path()?)?;
    Ok(MeterService::new(
        settings,
        Box::new(ThamesWaterPortal::new(PortalEndpoints::default())),
        Arc::new(store),
    ))
}

fn now_local(service: &MeterService) -> chrono::NaiveDateTime {
    chrono::Utc::now()
        .with_timezone(&service.timezone())
        .naive_local()
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Init => {
            ensure_initialized()?;
            println!("Initialized water-meter config and data directories.");
        }
        Commands::Configure {
            email,
            account_number,
            meter_id,
            password,
            liter_cost,
            fetch_hours,
            timezone,
        } => {
            ensure_initialized()?;
            let mut cfg = load_config()?;
            cfg.email = Some(email.trim().to_string());
            cfg.account_number = Some(account_number.trim().to_string());
            cfg.meter_id = Some(meter_id.trim().to_string());
            apply_overrides(&mut cfg, liter_cost, fetch_hours, timezone)?;

            if let Some(password) = password {
                set_password(&email, &password)?;
            }
            save_config(&cfg)?;
            println!("Meter '{}' configured.", meter_id.trim());
        }
        Commands::Refresh => {
            ensure_initialized()?;
            let cfg = load_config()?;
            let mut svc = build_service(&cfg)?;
            let now = now_local(&svc);
            let report = svc.run_cycle(now).await?;
            println!(
                "Fetched {} readings over {} days ({} new), stored {} points",
                report.readings_fetched,
                report.days_requested,
                report.readings_new,
                report.points_emitted
            );
            if let Some(state) = svc.state() {
                println!("Latest daily usage: {state} L");
            }
        }
        Commands::Run => {
            ensure_initialized()?;
            let cfg = load_config()?;
            let svc = build_service(&cfg)?;
            let schedule =
                FetchSchedule::from_config(cfg.fetch_hours.as_deref(), &mut rand::thread_rng());
            run_daemon(svc, schedule).await;
        }
        Commands::Export { series, format } => {
            ensure_initialized()?;
            let series = parse_series(&series)?;
            let store = SqliteStore::open(&db_path()?)?;
            let points = store.points(series.series_id())?;
            if format.eq_ignore_ascii_case("json") {
                let export = SeriesExport {
                    metadata: store.metadata(series.series_id())?,
                    points,
                };
                println!("{}", serde_json::to_string_pretty(&export)?);
            } else if format.eq_ignore_ascii_case("csv") {
                print!("{}", render_csv(&points));
            } else {
                return Err(AppError::Config(
                    "Unsupported export format. Use json or csv".into(),
                ));
            }
        }
    }

    Ok(())
}
