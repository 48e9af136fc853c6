//! Time Billing Service entry point.

use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use service_core::error::AppError;
use service_core::observability::init_tracing;
use std::process::ExitCode;
use time_billing_service::config::BillingConfig;
use time_billing_service::services::get_metrics;
use time_billing_service::startup::Application;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "time-billing-service")]
#[command(version, about = "Time-entry billing and annual hour allowance maintenance", long_about = None)]
struct Cli {
    /// Print Prometheus metrics to stdout after the command finishes
    #[arg(long, global = true, default_value_t = false)]
    print_metrics: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending database migrations
    Migrate,
    /// Rebuild billing fields from the full entry history
    Recalculate(RecalculateArgs),
    /// Zero yearly usage as of January 1
    ResetYear(ResetYearArgs),
    /// Change a client's annual hour allowance
    SetAllowance(SetAllowanceArgs),
    /// Show a client's allowance position
    Summary(SummaryArgs),
}

#[derive(Args)]
struct RecalculateArgs {
    /// Only this client (defaults to every client)
    #[arg(long)]
    client_id: Option<Uuid>,
}

#[derive(Args)]
struct ResetYearArgs {
    /// Target year (defaults to the current year)
    #[arg(long)]
    year: Option<i32>,
    /// Only this client (defaults to every client not yet reset)
    #[arg(long)]
    client_id: Option<Uuid>,
}

#[derive(Args)]
struct SetAllowanceArgs {
    #[arg(long)]
    client_id: Uuid,
    /// New annual allowance in hours
    #[arg(long)]
    hours: Decimal,
}

#[derive(Args)]
struct SummaryArgs {
    #[arg(long)]
    client_id: Uuid,
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), AppError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Failed to encode output: {}", e)))?;
    println!("{}", text);
    Ok(())
}

async fn run(cli: Cli, config: BillingConfig) -> Result<(), AppError> {
    let app = Application::build(config).await?;
    let service = app.service();

    match cli.command {
        Commands::Migrate => {
            tracing::info!("Migrations up to date");
        }
        Commands::Recalculate(args) => match args.client_id {
            Some(client_id) => print_json(&service.recalculate_client(client_id).await?)?,
            None => {
                let report = service.recalculate_all().await?;
                print_json(&report)?;
                if !report.failed.is_empty() {
                    return Err(AppError::InternalError(anyhow::anyhow!(
                        "{} client(s) failed to recalculate",
                        report.failed.len()
                    )));
                }
            }
        },
        Commands::ResetYear(args) => {
            let year = args.year.unwrap_or_else(|| service.current_year());
            match args.client_id {
                Some(client_id) => print_json(&service.reset_year(client_id, year).await?)?,
                None => {
                    let touched = service.reset_all_years(year).await?;
                    print_json(&serde_json::json!({ "year": year, "clients_reset": touched }))?;
                }
            }
        }
        Commands::SetAllowance(args) => {
            let update = service.update_allowance(args.client_id, args.hours).await?;
            print_json(&serde_json::json!({
                "client": update.client,
                "recalculation": update.recalculation,
            }))?;
        }
        Commands::Summary(args) => {
            print_json(&service.allowance_summary(args.client_id).await?)?;
        }
    }

    if cli.print_metrics {
        print!("{}", get_metrics());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match BillingConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return ExitCode::from(e.exit_code() as u8);
        }
    };

    if let Err(e) = init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    ) {
        eprintln!("Failed to initialize tracing: {}", e);
        return ExitCode::from(e.exit_code() as u8);
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        db_max_connections = %config.database.max_connections,
        default_hourly_rate = %config.engine.default_hourly_rate,
        "Starting time-billing-service"
    );

    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, kind = e.kind(), "Command failed");
            eprintln!("Error: {}", e);
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
