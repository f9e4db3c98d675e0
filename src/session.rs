//! The per-page map session: markers, clusters, the active overlay and the
//! current view, with an explicit install/reset lifecycle.

use crate::cluster::{ClusterManager, ClusterView};
use crate::config::{AppConfig, DatasetConfig, MatchOn};
use crate::filter::{apply_filter, CategorySelector};
use crate::markers::{CircleOverlay, MapMarker, MarkerStyle, Popup};
use crate::pipeline::{LoadReport, LoadedDataset};
use crate::types::{LatLng, ViewState};
use serde::Serialize;
use tracing::info;

/// Result of activating (clicking) a marker.
#[derive(Debug, Clone, Serialize)]
pub struct Activation {
    pub marker_id: usize,
    pub popup: Popup,
    pub popup_html: String,
    /// Set when the dataset re-centers on activation.
    pub view: Option<ViewState>,
    pub overlay: Option<CircleOverlay>,
}

pub struct MapSession {
    dataset: String,
    style: MarkerStyle,
    match_on: MatchOn,
    all_label: String,
    initial_view: ViewState,
    selection_zoom: u8,
    view: ViewState,
    markers: Vec<MapMarker>,
    clusters: ClusterManager,
    active_overlay: Option<CircleOverlay>,
    report: LoadReport,
}

impl MapSession {
    /// An empty session for `dataset`, showing the configured initial view.
    pub fn new(config: &AppConfig, dataset_name: &str, dataset: &DatasetConfig) -> Self {
        let center = match dataset.center {
            Some([lat, lng]) => LatLng { lat, lng },
            None => LatLng {
                lat: config.map.center_lat,
                lng: config.map.center_lng,
            },
        };
        let initial_view = ViewState {
            center,
            zoom: config.map.zoom,
        };

        Self {
            dataset: dataset_name.to_string(),
            style: MarkerStyle::from(dataset),
            match_on: dataset.match_on,
            all_label: config.map.all_label.clone(),
            initial_view,
            selection_zoom: config.map.selection_zoom,
            view: initial_view,
            markers: Vec::new(),
            clusters: ClusterManager::new(config.cluster.clone()),
            active_overlay: None,
            report: LoadReport::default(),
        }
    }

    /// Builds a session and installs a finished load into it.
    pub fn with_dataset(config: &AppConfig, loaded: LoadedDataset) -> anyhow::Result<Self> {
        let dataset = config.dataset(&loaded.name)?;
        let mut session = Self::new(config, &loaded.name, dataset);
        session.install(loaded);
        Ok(session)
    }

    /// Drops every marker, the overlay and the clusters, and restores the
    /// initial view.
    pub fn reset(&mut self) {
        self.markers.clear();
        self.clusters.clear();
        self.active_overlay = None;
        self.view = self.initial_view;
        self.report = LoadReport::default();
    }

    /// Replaces the session contents with a freshly loaded dataset. Every
    /// marker starts visible.
    pub fn install(&mut self, loaded: LoadedDataset) {
        self.reset();
        self.markers = loaded.markers;
        self.report = loaded.report;
        self.rebuild_clusters();
        info!(dataset = %self.dataset, markers = self.markers.len(), "Session ready");
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    pub fn view(&self) -> ViewState {
        self.view
    }

    pub fn report(&self) -> &LoadReport {
        &self.report
    }

    pub fn markers(&self) -> &[MapMarker] {
        &self.markers
    }

    pub fn visible_markers(&self) -> impl Iterator<Item = &MapMarker> {
        self.markers.iter().filter(|m| m.visible)
    }

    pub fn clusters(&self) -> &ClusterView {
        self.clusters.view()
    }

    pub fn active_overlay(&self) -> Option<&CircleOverlay> {
        self.active_overlay.as_ref()
    }

    /// Applies a dropdown value and rebuilds the clusters from the markers
    /// that are now visible.
    pub fn apply_filter(&mut self, value: &str) -> usize {
        let selector = CategorySelector::parse(value, &self.all_label);
        let visible = apply_filter(&mut self.markers, &selector, self.match_on);
        self.rebuild_clusters();
        info!(selection = value, visible, "Filter applied");
        visible
    }

    /// Changes the zoom the clusters are computed for.
    pub fn set_zoom(&mut self, zoom: u8) {
        if zoom != self.view.zoom {
            self.view.zoom = zoom;
            self.rebuild_clusters();
        }
    }

    /// Builds the popup for a marker and, when the dataset highlights its
    /// selection, moves the view and swaps the overlay. Returns `None` for an
    /// unknown id.
    pub fn activate(&mut self, marker_id: usize) -> Option<Activation> {
        let marker = self.markers.get(marker_id)?;
        let popup = marker.popup();
        let popup_html = popup.to_html();

        let (view, overlay) = match marker.overlay(&self.style) {
            Some(overlay) => {
                let view = ViewState {
                    center: marker.position(),
                    zoom: self.selection_zoom,
                };
                (Some(view), Some(overlay))
            }
            None => (None, None),
        };

        if let Some(view) = view {
            self.view = view;
            self.active_overlay = overlay.clone();
            self.rebuild_clusters();
        }

        Some(Activation {
            marker_id,
            popup,
            popup_html,
            view,
            overlay,
        })
    }

    fn rebuild_clusters(&mut self) {
        let zoom = self.view.zoom;
        self.clusters
            .rebuild(self.markers.iter().filter(|m| m.visible), zoom);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SAMPLE_CONFIG;
    use crate::markers::build_marker;
    use crate::pipeline::LoadReport;
    use crate::types::{IncidentRecord, ResolvedLocation};
    use geo::Point;

    fn loaded(config: &AppConfig, name: &str, rows: &[(&str, i32, u32, f64, f64)]) -> LoadedDataset {
        let style = MarkerStyle::from(config.dataset(name).unwrap());
        let markers = rows
            .iter()
            .enumerate()
            .map(|(id, (category, year, count, lat, lng))| {
                let location = ResolvedLocation {
                    position: Point::new(*lng, *lat),
                    record: IncidentRecord {
                        year: *year,
                        age: None,
                        address: format!("place {}", id),
                        category: category.to_string(),
                        count: Some(*count),
                    },
                };
                build_marker(id, location, &style)
            })
            .collect::<Vec<_>>();
        LoadedDataset {
            name: name.to_string(),
            report: LoadReport {
                markers: markers.len(),
                ..LoadReport::default()
            },
            markers,
        }
    }

    fn riots_session() -> MapSession {
        let config = AppConfig::from_toml(SAMPLE_CONFIG).unwrap();
        let data = loaded(
            &config,
            "riots",
            &[
                ("RIOTS", 2019, 14, 12.97, 77.59),
                ("RIOTS", 2020, 2, 12.98, 77.60),
                ("RIOTS", 2019, 5, 28.61, 77.21),
            ],
        );
        MapSession::with_dataset(&config, data).unwrap()
    }

    #[test]
    fn install_starts_with_everything_visible_and_clustered() {
        let session = riots_session();
        assert_eq!(session.visible_markers().count(), 3);
        assert_eq!(session.clusters().marker_count(), 3);
        assert_eq!(session.view().zoom, 7);
    }

    #[test]
    fn clusters_track_filter_changes() {
        let mut session = riots_session();

        assert_eq!(session.apply_filter("RIOTS (2019)"), 2);
        let clustered: Vec<usize> = {
            let view = session.clusters();
            let mut ids: Vec<usize> = view.singles.clone();
            ids.extend(view.clusters.iter().flat_map(|c| c.marker_ids.iter().copied()));
            ids.sort_unstable();
            ids
        };
        assert_eq!(clustered, vec![0, 2]);

        assert_eq!(session.apply_filter("All"), 3);
        assert_eq!(session.clusters().marker_count(), 3);
    }

    #[test]
    fn only_one_overlay_exists_at_a_time() {
        let mut session = riots_session();

        let first = session.activate(0).unwrap();
        assert_eq!(first.overlay.as_ref().unwrap().radius_m, 2400.0);
        assert_eq!(first.view.unwrap().center, LatLng { lat: 12.97, lng: 77.59 });

        let second = session.activate(1).unwrap();
        assert_eq!(second.overlay.as_ref().unwrap().radius_m, 1200.0);
        assert_eq!(session.active_overlay().unwrap().marker_id, 1);
        assert_eq!(session.view().zoom, 13);

        assert!(session.activate(42).is_none());
        assert_eq!(session.active_overlay().unwrap().marker_id, 1);
    }

    #[test]
    fn datasets_without_overlay_only_open_the_popup() {
        let config = AppConfig::from_toml(SAMPLE_CONFIG).unwrap();
        let data = loaded(&config, "children", &[("Kidnapping", 2021, 1, 12.97, 77.59)]);
        let mut session = MapSession::with_dataset(&config, data).unwrap();

        let activation = session.activate(0).unwrap();
        assert!(activation.overlay.is_none());
        assert!(activation.view.is_none());
        assert!(session.active_overlay().is_none());
        assert!(activation.popup_html.contains("Kidnapping"));
    }

    #[test]
    fn reset_clears_markers_overlay_and_view() {
        let mut session = riots_session();
        session.activate(0);
        session.reset();

        assert!(session.markers().is_empty());
        assert!(session.active_overlay().is_none());
        assert_eq!(session.clusters().marker_count(), 0);
        assert_eq!(session.view().zoom, 7);
        assert_eq!(session.dataset(), "riots");
    }
}
