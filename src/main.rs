pub mod types;
pub mod config;
pub mod data;
pub mod geocode;
pub mod markers;
pub mod cluster;
pub mod filter;
pub mod pipeline;
pub mod session;
pub mod server;
pub mod forecast;

use anyhow::anyhow;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Geocode one dataset and write its markers as GeoJSON
    Build {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
        /// Dataset name from the config (defaults to map.default_dataset)
        #[arg(short, long)]
        dataset: Option<String>,
        /// Read this CSV instead of the dataset's configured source
        #[arg(long)]
        source: Option<String>,
        #[arg(short, long, value_name = "FILE", default_value = "markers.geojson")]
        output: PathBuf,
    },
    /// Serve the interactive map
    Serve {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
    /// Print the hourly crime forecast for a category and day
    Predict {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
        #[arg(long)]
        category: String,
        #[arg(long)]
        month: u32,
        #[arg(long)]
        day: u32,
    },
}

fn geocoder_for(app_config: &config::AppConfig) -> geocode::GoogleGeocoder {
    let api_key = app_config.geocoder_api_key();
    if api_key.is_none() {
        tracing::warn!("No geocoder API key configured; requests will likely be denied");
    }
    geocode::GoogleGeocoder::new(app_config.geocoder.endpoint.clone(), api_key)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Build { config, dataset, source, output } => {
            println!("Building markers with config: {:?}", config);
            let app_config = config::AppConfig::load_from_file(config)?;
            let name = dataset.clone().unwrap_or_else(|| app_config.map.default_dataset.clone());
            let geocoder = geocoder_for(&app_config);

            let loaded = pipeline::load_dataset(&app_config, &name, source.as_deref(), &geocoder).await?;
            pipeline::write_geojson(output, &loaded.markers)?;

            let report = &loaded.report;
            println!(
                "Wrote {} markers to {:?} ({} rows parsed, {} dropped, {} not geocoded)",
                report.markers,
                output,
                report.parse.emitted,
                report.parse.dropped(),
                report.unresolved.len()
            );
            for miss in &report.unresolved {
                println!("  unresolved: {} ({})", miss.address, miss.reason);
            }
        }
        Commands::Serve { config } => {
            println!("Serving map with config: {:?}", config);
            let app_config = config::AppConfig::load_from_file(config)?;
            let geocoder = geocoder_for(&app_config);

            server::start_server(app_config, geocoder).await?;
        }
        Commands::Predict { config, category, month, day } => {
            let app_config = config::AppConfig::load_from_file(config)?;
            let forecast_config = app_config
                .forecast
                .as_ref()
                .ok_or_else(|| anyhow!("No [forecast] section in {:?}", config))?;

            let log = forecast::IncidentLog::load(&forecast_config.incidents_csv)?;
            let forecast = log
                .forecast(category, *month, *day, forecast_config.target_year)
                .map_err(|e| match e {
                    forecast::ForecastError::UnknownCategory(_) => {
                        anyhow!("{} (known categories: {})", e, log.categories().join(", "))
                    }
                    other => other.into(),
                })?;

            println!(
                "{} on {:02}-{:02}: {:.2} incidents expected in {}",
                forecast.category, forecast.month, forecast.day, forecast.predicted_total, forecast.target_year
            );
            for (hour, value) in forecast.hourly.iter().enumerate() {
                println!("{:02}:00  {:.6}", hour, value);
            }
        }
    }

    Ok(())
}
