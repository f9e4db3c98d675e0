use crate::config::{DatasetConfig, OverlayConfig, TitleFormat};
use crate::types::{LatLng, ResolvedLocation};
use serde::Serialize;

/// How markers of one dataset are titled, labelled and highlighted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarkerStyle {
    pub title: TitleFormat,
    pub show_count_label: bool,
    pub overlay: Option<OverlayConfig>,
}

impl From<&DatasetConfig> for MarkerStyle {
    fn from(dataset: &DatasetConfig) -> Self {
        Self {
            title: dataset.title,
            show_count_label: dataset.show_count_label,
            overlay: dataset.overlay,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MapMarker {
    pub id: usize,
    pub location: ResolvedLocation,
    pub title: String,
    pub label: Option<String>,
    pub visible: bool,
}

pub fn build_marker(id: usize, location: ResolvedLocation, style: &MarkerStyle) -> MapMarker {
    let record = &location.record;
    let title = match style.title {
        TitleFormat::Category => record.category.clone(),
        TitleFormat::CategoryYear => format!("{} ({})", record.category, record.year),
    };
    let label = if style.show_count_label {
        record.count.map(|c| c.to_string())
    } else {
        None
    };

    MapMarker {
        id,
        location,
        title,
        label,
        visible: true,
    }
}

impl MapMarker {
    pub fn position(&self) -> LatLng {
        self.location.position.into()
    }

    /// Detail popup, built when the marker is activated.
    pub fn popup(&self) -> Popup {
        let record = &self.location.record;
        let mut fields = Vec::with_capacity(3);

        match record.count {
            Some(count) => {
                fields.push(PopupField::new("Crime Type", &record.category));
                fields.push(PopupField::new("Number of Incidents", count));
            }
            None => fields.push(PopupField::new("Crime", &record.category)),
        }
        if let Some(age) = record.age {
            fields.push(PopupField::new("Age", age));
        }
        fields.push(PopupField::new("Year", record.year));

        Popup { fields }
    }

    /// Circle drawn around the marker on activation, if the dataset has one.
    pub fn overlay(&self, style: &MarkerStyle) -> Option<CircleOverlay> {
        let radius_m = match style.overlay? {
            OverlayConfig::Fixed { radius_m } => radius_m,
            OverlayConfig::Scaled { base_m, per_incident_m } => {
                base_m + f64::from(self.location.record.count.unwrap_or(0)) * per_incident_m
            }
        };
        Some(CircleOverlay::highlight(self.id, self.position(), radius_m))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PopupField {
    pub label: &'static str,
    pub value: String,
}

impl PopupField {
    fn new(label: &'static str, value: impl ToString) -> Self {
        Self {
            label,
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Popup {
    pub fields: Vec<PopupField>,
}

impl Popup {
    /// Info-window markup. Values come from the CSV and are escaped.
    pub fn to_html(&self) -> String {
        let body = self
            .fields
            .iter()
            .map(|f| format!("<strong>{}:</strong> {}", f.label, escape_html(&f.value)))
            .collect::<Vec<_>>()
            .join("<br>");
        format!("<div style=\"font-family: Arial; font-size: 14px;\">{}</div>", body)
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircleOverlay {
    pub marker_id: usize,
    pub center: LatLng,
    pub radius_m: f64,
    pub stroke_color: &'static str,
    pub stroke_opacity: f64,
    pub stroke_weight: u32,
    pub fill_color: &'static str,
    pub fill_opacity: f64,
}

impl CircleOverlay {
    fn highlight(marker_id: usize, center: LatLng, radius_m: f64) -> Self {
        Self {
            marker_id,
            center,
            radius_m,
            stroke_color: "#FF0000",
            stroke_opacity: 0.8,
            stroke_weight: 2,
            fill_color: "#FF0000",
            fill_opacity: 0.3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IncidentRecord;
    use geo::Point;

    fn located(age: Option<i32>, count: Option<u32>) -> ResolvedLocation {
        ResolvedLocation {
            position: Point::new(77.59, 12.97),
            record: IncidentRecord {
                year: 2019,
                age,
                address: "Bengaluru".to_string(),
                category: "RIOTS".to_string(),
                count,
            },
        }
    }

    const PLAIN: MarkerStyle = MarkerStyle {
        title: TitleFormat::Category,
        show_count_label: false,
        overlay: None,
    };

    const AGGREGATE: MarkerStyle = MarkerStyle {
        title: TitleFormat::CategoryYear,
        show_count_label: true,
        overlay: Some(OverlayConfig::Scaled { base_m: 1000.0, per_incident_m: 100.0 }),
    };

    #[test]
    fn plain_marker_uses_category_title() {
        let marker = build_marker(0, located(Some(12), None), &PLAIN);
        assert_eq!(marker.title, "RIOTS");
        assert!(marker.label.is_none());
        assert!(marker.visible);
        assert!(marker.overlay(&PLAIN).is_none());

        let labels: Vec<_> = marker.popup().fields.iter().map(|f| f.label).collect();
        assert_eq!(labels, vec!["Crime", "Age", "Year"]);
    }

    #[test]
    fn aggregate_marker_has_year_title_and_count_label() {
        let marker = build_marker(4, located(None, Some(14)), &AGGREGATE);
        assert_eq!(marker.title, "RIOTS (2019)");
        assert_eq!(marker.label.as_deref(), Some("14"));

        let popup = marker.popup();
        assert_eq!(popup.fields[1], PopupField::new("Number of Incidents", 14));

        let overlay = marker.overlay(&AGGREGATE).unwrap();
        assert_eq!(overlay.radius_m, 2400.0);
        assert_eq!(overlay.marker_id, 4);
        assert_eq!(overlay.center, LatLng { lat: 12.97, lng: 77.59 });
    }

    #[test]
    fn fixed_overlay_ignores_count() {
        let style = MarkerStyle {
            overlay: Some(OverlayConfig::Fixed { radius_m: 800.0 }),
            ..PLAIN
        };
        let marker = build_marker(1, located(Some(70), Some(99)), &style);
        assert_eq!(marker.overlay(&style).unwrap().radius_m, 800.0);
    }

    #[test]
    fn popup_html_escapes_values() {
        let mut location = located(Some(9), None);
        location.record.category = "<b>Theft</b>".to_string();
        let html = build_marker(0, location, &PLAIN).popup().to_html();
        assert!(html.contains("<strong>Crime:</strong> &lt;b&gt;Theft&lt;/b&gt;"));
        assert!(html.contains("<strong>Year:</strong> 2019"));
    }
}
