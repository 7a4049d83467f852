//! # Map Update
//!
//! JSON document a map view draws from: one marker per located device and one
//! polyline per device trail.
//!
//! ```json
//! {
//!   "markers": [{"id": "B1", "latitude": 37.7, "longitude": -122.5, "altitude": 900.0}],
//!   "trails": [{"id": "B1", "points": [[37.6, -122.4], [37.7, -122.5]]}]
//! }
//! ```

use serde::Serialize;

use super::record::{DeviceId, Location, TelemetryRecord};
use crate::error::Result;

/// Current position of one device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapMarker {
    pub id: DeviceId,
    #[serde(flatten)]
    pub location: Location,
}

/// Past positions of one device as `[latitude, longitude]` pairs, oldest first
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapTrail {
    pub id: DeviceId,
    pub points: Vec<[f64; 2]>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct MapUpdate {
    pub markers: Vec<MapMarker>,
    pub trails: Vec<MapTrail>,
}

impl MapUpdate {
    /// Build markers and trails for every record whose location is set
    ///
    /// Devices without a location are left off the map. Trails with fewer
    /// than two points draw nothing and are skipped.
    pub fn from_records(records: &[TelemetryRecord]) -> Self {
        let located = records.iter().filter(|record| record.location_set());

        let mut update = Self::default();
        for record in located {
            update.markers.push(MapMarker {
                id: record.id().clone(),
                location: record.location(),
            });

            if record.trail().len() >= 2 {
                update.trails.push(MapTrail {
                    id: record.id().clone(),
                    points: record
                        .trail()
                        .iter()
                        .map(|location| [location.latitude, location.longitude])
                        .collect(),
                });
            }
        }
        update
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_only_located_devices_are_drawn() {
        let mut located = TelemetryRecord::new("B1");
        located.apply_update([("latitude", 37.6), ("longitude", -122.4)]).unwrap();
        located
            .apply_update([("latitude", 37.7), ("longitude", -122.5), ("altitude", 900.0)])
            .unwrap();

        let mut silent = TelemetryRecord::new("B2");
        silent.apply_update([("temperature", -30.0)]).unwrap();

        let update = MapUpdate::from_records(&[located, silent]);
        let value: serde_json::Value = serde_json::from_str(&update.to_json().unwrap()).unwrap();

        assert_eq!(
            value,
            json!({
                "markers": [
                    {"id": "B1", "latitude": 37.7, "longitude": -122.5, "altitude": 900.0}
                ],
                "trails": [
                    {"id": "B1", "points": [[37.6, -122.4], [37.7, -122.5]]}
                ]
            })
        );
    }

    #[test]
    fn test_single_point_has_no_trail() {
        let mut record = TelemetryRecord::new("B1");
        record.apply_update([("latitude", 1.0)]).unwrap();

        let update = MapUpdate::from_records(&[record]);
        assert_eq!(update.markers.len(), 1);
        assert!(update.trails.is_empty());
    }

    #[test]
    fn test_empty_update() {
        let update = MapUpdate::from_records(&[]);
        assert_eq!(update.to_json().unwrap(), r#"{"markers":[],"trails":[]}"#);
    }
}
