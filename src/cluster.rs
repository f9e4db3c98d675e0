use crate::config::ClusterConfig;
use crate::markers::MapMarker;
use crate::types::LatLng;
use rstar::primitives::GeomWithData;
use rstar::RTree;
use serde::Serialize;
use std::f64::consts::PI;

// Constants for Web Mercator
const TILE_SIZE: f64 = 256.0;
const MAX_LATITUDE: f64 = 85.051_128_78;

type ProjectedMarker = GeomWithData<[f64; 2], usize>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cluster {
    pub position: LatLng,
    pub marker_ids: Vec<usize>,
}

impl Cluster {
    pub fn count(&self) -> usize {
        self.marker_ids.len()
    }
}

/// Clustering of the visible markers at one zoom level. Groups smaller than
/// the minimum cluster size are listed as `singles`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClusterView {
    pub zoom: u8,
    pub clusters: Vec<Cluster>,
    pub singles: Vec<usize>,
}

impl ClusterView {
    pub fn marker_count(&self) -> usize {
        self.singles.len() + self.clusters.iter().map(Cluster::count).sum::<usize>()
    }
}

/// Owns the current `ClusterView` but never the markers themselves.
#[derive(Debug, Clone)]
pub struct ClusterManager {
    config: ClusterConfig,
    view: ClusterView,
}

impl ClusterManager {
    pub fn new(config: ClusterConfig) -> Self {
        Self {
            config,
            view: ClusterView::default(),
        }
    }

    pub fn view(&self) -> &ClusterView {
        &self.view
    }

    pub fn clear(&mut self) {
        self.view = ClusterView::default();
    }

    /// Discards the current view and clusters exactly the given markers.
    pub fn rebuild<'a>(&mut self, markers: impl IntoIterator<Item = &'a MapMarker>, zoom: u8) {
        self.view = cluster_markers(markers, zoom, &self.config);
    }
}

fn cluster_markers<'a>(
    markers: impl IntoIterator<Item = &'a MapMarker>,
    zoom: u8,
    config: &ClusterConfig,
) -> ClusterView {
    let markers: Vec<&MapMarker> = markers.into_iter().collect();
    let projected: Vec<ProjectedMarker> = markers
        .iter()
        .enumerate()
        .map(|(slot, m)| {
            let ll = m.position();
            GeomWithData::new(lat_lon_to_world_pixel(ll.lat, ll.lng, zoom), slot)
        })
        .collect();
    let tree = RTree::bulk_load(projected.clone());

    let radius_sq = config.grid_size_px * config.grid_size_px;
    let mut assigned = vec![false; markers.len()];
    let mut view = ClusterView {
        zoom,
        ..ClusterView::default()
    };

    // Seeds are taken in marker order so the result is deterministic.
    for seed in &projected {
        if assigned[seed.data] {
            continue;
        }
        let mut members: Vec<usize> = tree
            .locate_within_distance(*seed.geom(), radius_sq)
            .map(|p| p.data)
            .filter(|slot| !assigned[*slot])
            .collect();
        members.sort_unstable();
        for slot in &members {
            assigned[*slot] = true;
        }

        if members.len() < config.min_cluster_size.max(2) {
            view.singles.extend(members.iter().map(|slot| markers[*slot].id));
            continue;
        }

        let n = members.len() as f64;
        let (lat_sum, lng_sum) = members.iter().fold((0.0, 0.0), |(lat, lng), slot| {
            let p = markers[*slot].position();
            (lat + p.lat, lng + p.lng)
        });
        view.clusters.push(Cluster {
            position: LatLng {
                lat: lat_sum / n,
                lng: lng_sum / n,
            },
            marker_ids: members.iter().map(|slot| markers[*slot].id).collect(),
        });
    }

    view
}

// Coordinate conversions
fn lat_lon_to_world_pixel(lat: f64, lon: f64, zoom: u8) -> [f64; 2] {
    let n = 2.0_f64.powi(zoom as i32) * TILE_SIZE;
    let lat_rad = lat.clamp(-MAX_LATITUDE, MAX_LATITUDE).to_radians();
    let x = (lon + 180.0) / 360.0 * n;
    let y = (1.0 - (lat_rad.tan() + (1.0 / lat_rad.cos())).ln() / PI) / 2.0 * n;
    [x, y]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markers::{build_marker, MarkerStyle};
    use crate::config::TitleFormat;
    use crate::types::{IncidentRecord, ResolvedLocation};
    use geo::Point;

    fn marker(id: usize, lat: f64, lng: f64) -> MapMarker {
        let style = MarkerStyle {
            title: TitleFormat::Category,
            show_count_label: false,
            overlay: None,
        };
        build_marker(
            id,
            ResolvedLocation {
                position: Point::new(lng, lat),
                record: IncidentRecord {
                    year: 2020,
                    age: Some(10),
                    address: format!("addr {}", id),
                    category: "Assault".to_string(),
                    count: None,
                },
            },
            &style,
        )
    }

    #[test]
    fn projection_matches_tile_origin() {
        let [x, y] = lat_lon_to_world_pixel(0.0, 0.0, 0);
        assert!((x - 128.0).abs() < 1e-9);
        assert!((y - 128.0).abs() < 1e-9);

        let [x1, _] = lat_lon_to_world_pixel(0.0, 0.0, 1);
        assert!((x1 - 256.0).abs() < 1e-9);
    }

    #[test]
    fn nearby_markers_cluster_at_low_zoom_and_split_when_zoomed_in() {
        let markers = vec![
            marker(0, 12.97, 77.59),
            marker(1, 12.98, 77.60),
            marker(2, 28.61, 77.21),
        ];
        let mut manager = ClusterManager::new(ClusterConfig::default());

        manager.rebuild(&markers, 7);
        let view = manager.view();
        assert_eq!(view.clusters.len(), 1);
        assert_eq!(view.clusters[0].marker_ids, vec![0, 1]);
        assert_eq!(view.singles, vec![2]);
        assert_eq!(view.marker_count(), 3);

        manager.rebuild(&markers, 18);
        assert!(manager.view().clusters.is_empty());
        assert_eq!(manager.view().singles.len(), 3);
    }

    #[test]
    fn rebuild_replaces_previous_view() {
        let markers = vec![marker(0, 12.97, 77.59), marker(1, 12.98, 77.60)];
        let mut manager = ClusterManager::new(ClusterConfig::default());

        manager.rebuild(&markers, 5);
        assert_eq!(manager.view().marker_count(), 2);

        manager.rebuild(markers.iter().filter(|m| m.id == 1), 5);
        assert_eq!(manager.view().marker_count(), 1);
        assert_eq!(manager.view().singles, vec![1]);

        manager.rebuild(std::iter::empty(), 5);
        assert_eq!(manager.view().marker_count(), 0);
    }
}
