use geo::Point;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IncidentRecord {
    pub year: i32,
    pub age: Option<i32>,
    pub address: String,
    pub category: String,
    // Aggregate datasets only
    pub count: Option<u32>,
}

/// A record the geocoder found. `position` is (x = longitude, y = latitude).
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedLocation {
    pub position: Point<f64>,
    pub record: IncidentRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl From<Point<f64>> for LatLng {
    fn from(p: Point<f64>) -> Self {
        LatLng { lat: p.y(), lng: p.x() }
    }
}

/// Center and zoom of the map as the page should display it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ViewState {
    pub center: LatLng,
    pub zoom: u8,
}
