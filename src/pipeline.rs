use crate::config::AppConfig;
use crate::data::{ParseStats, RecordParser};
use crate::geocode::{resolve_all, Geocoder, Unresolved};
use crate::markers::{build_marker, MapMarker, MarkerStyle};
use anyhow::{Context, Result};
use geojson::{Feature, FeatureCollection, Geometry, JsonObject, Value};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// What happened to the rows of one load. Dropped and unresolved rows are
/// only visible here and in the logs.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    pub source: String,
    pub parse: ParseStats,
    pub unresolved: Vec<Unresolved>,
    pub markers: usize,
}

#[derive(Debug)]
pub struct LoadedDataset {
    pub name: String,
    pub markers: Vec<MapMarker>,
    pub report: LoadReport,
}

/// Reads the CSV text from a local path or an http(s) URL. Only this step
/// can fail a load; it is retried up to `retries` extra times.
pub async fn fetch_source(source: &str, retries: u32) -> Result<String> {
    let mut retry_delay = Duration::from_millis(500);
    let mut attempt = 0;
    loop {
        match fetch_once(source).await {
            Ok(text) => return Ok(text),
            Err(e) if attempt < retries => {
                attempt += 1;
                warn!(source, attempt, error = %e, "Fetching source failed. Retrying...");
                sleep(retry_delay).await;
                retry_delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn fetch_once(source: &str) -> Result<String> {
    if source.starts_with("http://") || source.starts_with("https://") {
        let text = reqwest::get(source)
            .await
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("Failed to fetch CSV: {}", source))?
            .text()
            .await
            .with_context(|| format!("Failed to read CSV body: {}", source))?;
        Ok(text)
    } else {
        tokio::fs::read_to_string(source)
            .await
            .with_context(|| format!("Failed to open CSV file: {:?}", source))
    }
}

/// Runs the full load for one dataset: fetch, parse, geocode, build markers.
/// `source` overrides the configured file, e.g. when the page switches files.
pub async fn load_dataset<G>(
    config: &AppConfig,
    name: &str,
    source: Option<&str>,
    geocoder: &G,
) -> Result<LoadedDataset>
where
    G: Geocoder + Sync,
{
    let dataset = config.dataset(name)?;
    let source = source.unwrap_or(&dataset.source);
    info!(dataset = name, source, "Loading dataset");

    // 1. Fetch
    let text = fetch_source(source, config.geocoder.fetch_retries).await?;

    // 2. Parse and geocode, one record at a time
    let mut parser = RecordParser::new(&text, dataset, source);
    let delay = (dataset.request_delay_ms > 0)
        .then(|| Duration::from_millis(dataset.request_delay_ms));
    let resolution = resolve_all(geocoder, parser.by_ref(), delay).await;
    let parse = parser.stats();
    if parse.dropped() > 0 {
        info!(
            bad_number = parse.bad_number,
            excluded = parse.excluded,
            malformed = parse.malformed,
            "Dropped rows while parsing"
        );
    }

    // 3. Build markers
    let style = MarkerStyle::from(dataset);
    let markers: Vec<MapMarker> = resolution
        .located
        .into_iter()
        .enumerate()
        .map(|(id, location)| build_marker(id, location, &style))
        .collect();

    info!(dataset = name, markers = markers.len(), "Dataset loaded");

    Ok(LoadedDataset {
        name: name.to_string(),
        report: LoadReport {
            source: source.to_string(),
            parse,
            unresolved: resolution.unresolved,
            markers: markers.len(),
        },
        markers,
    })
}

pub fn to_feature_collection<'a>(markers: impl IntoIterator<Item = &'a MapMarker>) -> FeatureCollection {
    let features = markers
        .into_iter()
        .map(|marker| {
            let record = &marker.location.record;
            let mut properties = JsonObject::new();
            properties.insert("title".to_string(), marker.title.clone().into());
            properties.insert("category".to_string(), record.category.clone().into());
            properties.insert("address".to_string(), record.address.clone().into());
            properties.insert("year".to_string(), record.year.into());
            if let Some(age) = record.age {
                properties.insert("age".to_string(), age.into());
            }
            if let Some(count) = record.count {
                properties.insert("count".to_string(), count.into());
            }
            if let Some(label) = &marker.label {
                properties.insert("label".to_string(), label.clone().into());
            }

            let position = marker.position();
            Feature {
                bbox: None,
                geometry: Some(Geometry::new(Value::Point(vec![position.lng, position.lat]))),
                id: Some(geojson::feature::Id::Number(marker.id.into())),
                properties: Some(properties),
                foreign_members: None,
            }
        })
        .collect();

    FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    }
}

pub fn write_geojson(path: &Path, markers: &[MapMarker]) -> Result<()> {
    let collection = to_feature_collection(markers);
    let json = serde_json::to_string_pretty(&collection)?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write GeoJSON: {:?}", path))
}
