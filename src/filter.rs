use crate::config::MatchOn;
use crate::markers::MapMarker;

/// A dropdown value turned into a visibility predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CategorySelector {
    All,
    Category(String),
}

impl CategorySelector {
    pub fn parse(value: &str, all_label: &str) -> Self {
        if value == all_label {
            CategorySelector::All
        } else {
            CategorySelector::Category(value.to_string())
        }
    }

    /// Title matching is exact, so an aggregate title such as `RIOTS (2019)`
    /// only matches that category and year.
    pub fn matches(&self, marker: &MapMarker, match_on: MatchOn) -> bool {
        match self {
            CategorySelector::All => true,
            CategorySelector::Category(value) => match match_on {
                MatchOn::Title => marker.title == *value,
                MatchOn::Category => marker.location.record.category == *value,
            },
        }
    }
}

/// Sets every marker's visibility from the selector. Returns the number of
/// visible markers.
pub fn apply_filter(markers: &mut [MapMarker], selector: &CategorySelector, match_on: MatchOn) -> usize {
    let mut visible = 0;
    for marker in markers.iter_mut() {
        marker.visible = selector.matches(marker, match_on);
        if marker.visible {
            visible += 1;
        }
    }
    visible
}
