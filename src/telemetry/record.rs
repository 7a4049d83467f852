//! # Telemetry Record
//!
//! Latest known state of one tracked device.
//!
//! The telemetry schema is fixed: every record carries all eighteen fields,
//! zeroed until the device reports them. Updates arrive as name/value pairs and
//! are validated against the schema before anything is written, so a rejected
//! update never leaves a record half-applied.
//!
//! Each record also keeps a bounded trail of the positions it has reported,
//! oldest first, for drawing its flight path.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;

use crate::error::{IcarusError, Result};

/// Positions kept per device unless configured otherwise
pub const DEFAULT_TRAIL_LENGTH: usize = 100;

/// Opaque device identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Named telemetry fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TelemetryField {
    Latitude,
    Longitude,
    Altitude,
    AltitudeEllipsoid,
    AltitudeRelative,
    AltitudeBarometric,
    VelocityHorizontal,
    VelocityVertical,
    Roll,
    Pitch,
    Yaw,
    Heading,
    Course,
    Temperature,
    Pressure,
    Humidity,
    Hdop,
    Fix,
}

impl TelemetryField {
    /// Every field in schema order
    pub const ALL: [TelemetryField; 18] = [
        TelemetryField::Latitude,
        TelemetryField::Longitude,
        TelemetryField::Altitude,
        TelemetryField::AltitudeEllipsoid,
        TelemetryField::AltitudeRelative,
        TelemetryField::AltitudeBarometric,
        TelemetryField::VelocityHorizontal,
        TelemetryField::VelocityVertical,
        TelemetryField::Roll,
        TelemetryField::Pitch,
        TelemetryField::Yaw,
        TelemetryField::Heading,
        TelemetryField::Course,
        TelemetryField::Temperature,
        TelemetryField::Pressure,
        TelemetryField::Humidity,
        TelemetryField::Hdop,
        TelemetryField::Fix,
    ];

    /// Wire name of the field
    pub fn name(self) -> &'static str {
        match self {
            TelemetryField::Latitude => "latitude",
            TelemetryField::Longitude => "longitude",
            TelemetryField::Altitude => "altitude",
            TelemetryField::AltitudeEllipsoid => "altitude_ellipsoid",
            TelemetryField::AltitudeRelative => "altitude_relative",
            TelemetryField::AltitudeBarometric => "altitude_barometric",
            TelemetryField::VelocityHorizontal => "velocity_horizontal",
            TelemetryField::VelocityVertical => "velocity_vertical",
            TelemetryField::Roll => "roll",
            TelemetryField::Pitch => "pitch",
            TelemetryField::Yaw => "yaw",
            TelemetryField::Heading => "heading",
            TelemetryField::Course => "course",
            TelemetryField::Temperature => "temperature",
            TelemetryField::Pressure => "pressure",
            TelemetryField::Humidity => "humidity",
            TelemetryField::Hdop => "hdop",
            TelemetryField::Fix => "fix",
        }
    }

    /// Fields whose presence marks the record's location as set
    pub fn is_location(self) -> bool {
        matches!(
            self,
            TelemetryField::Latitude | TelemetryField::Longitude | TelemetryField::Altitude
        )
    }
}

impl fmt::Display for TelemetryField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TelemetryField {
    type Err = IcarusError;

    fn from_str(s: &str) -> Result<Self> {
        // Older trackers spell it "elipsoid"
        if s == "altitude_elipsoid" {
            return Ok(TelemetryField::AltitudeEllipsoid);
        }

        TelemetryField::ALL
            .iter()
            .copied()
            .find(|field| field.name() == s)
            .ok_or_else(|| IcarusError::UnknownField(s.to_string()))
    }
}

/// Fixed-schema telemetry payload
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Telemetry {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub altitude_ellipsoid: f64,
    pub altitude_relative: f64,
    pub altitude_barometric: f64,
    pub velocity_horizontal: f64,
    pub velocity_vertical: f64,
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
    pub heading: f64,
    pub course: f64,
    pub temperature: f64,
    pub pressure: f64,
    pub humidity: f64,
    pub hdop: f64,
    pub fix: i64,
}

impl Telemetry {
    /// Read a field as `f64`
    pub fn get(&self, field: TelemetryField) -> f64 {
        match field {
            TelemetryField::Latitude => self.latitude,
            TelemetryField::Longitude => self.longitude,
            TelemetryField::Altitude => self.altitude,
            TelemetryField::AltitudeEllipsoid => self.altitude_ellipsoid,
            TelemetryField::AltitudeRelative => self.altitude_relative,
            TelemetryField::AltitudeBarometric => self.altitude_barometric,
            TelemetryField::VelocityHorizontal => self.velocity_horizontal,
            TelemetryField::VelocityVertical => self.velocity_vertical,
            TelemetryField::Roll => self.roll,
            TelemetryField::Pitch => self.pitch,
            TelemetryField::Yaw => self.yaw,
            TelemetryField::Heading => self.heading,
            TelemetryField::Course => self.course,
            TelemetryField::Temperature => self.temperature,
            TelemetryField::Pressure => self.pressure,
            TelemetryField::Humidity => self.humidity,
            TelemetryField::Hdop => self.hdop,
            TelemetryField::Fix => self.fix as f64,
        }
    }

    /// Write a field; `fix` is truncated to an integer
    pub fn set(&mut self, field: TelemetryField, value: f64) {
        let slot = match field {
            TelemetryField::Latitude => &mut self.latitude,
            TelemetryField::Longitude => &mut self.longitude,
            TelemetryField::Altitude => &mut self.altitude,
            TelemetryField::AltitudeEllipsoid => &mut self.altitude_ellipsoid,
            TelemetryField::AltitudeRelative => &mut self.altitude_relative,
            TelemetryField::AltitudeBarometric => &mut self.altitude_barometric,
            TelemetryField::VelocityHorizontal => &mut self.velocity_horizontal,
            TelemetryField::VelocityVertical => &mut self.velocity_vertical,
            TelemetryField::Roll => &mut self.roll,
            TelemetryField::Pitch => &mut self.pitch,
            TelemetryField::Yaw => &mut self.yaw,
            TelemetryField::Heading => &mut self.heading,
            TelemetryField::Course => &mut self.course,
            TelemetryField::Temperature => &mut self.temperature,
            TelemetryField::Pressure => &mut self.pressure,
            TelemetryField::Humidity => &mut self.humidity,
            TelemetryField::Hdop => &mut self.hdop,
            TelemetryField::Fix => {
                self.fix = value as i64;
                return;
            }
        };
        *slot = value;
    }
}

/// Validated set of field values to merge into a record
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TelemetryUpdate {
    values: BTreeMap<TelemetryField, f64>,
}

impl TelemetryUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an update from name/value pairs
    ///
    /// # Errors
    ///
    /// Returns `UnknownField` for the first name outside the schema.
    pub fn from_pairs<I, K>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, f64)>,
        K: AsRef<str>,
    {
        let mut update = Self::new();
        for (name, value) in pairs {
            let field: TelemetryField = name.as_ref().parse()?;
            update.values.insert(field, value);
        }
        Ok(update)
    }

    pub fn set(&mut self, field: TelemetryField, value: f64) -> &mut Self {
        self.values.insert(field, value);
        self
    }

    pub fn with(mut self, field: TelemetryField, value: f64) -> Self {
        self.values.insert(field, value);
        self
    }

    pub fn get(&self, field: TelemetryField) -> Option<f64> {
        self.values.get(&field).copied()
    }

    pub fn fields(&self) -> impl Iterator<Item = TelemetryField> + '_ {
        self.values.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn contains_location(&self) -> bool {
        self.values.keys().any(|field| field.is_location())
    }
}

/// Position as shown on the map
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
}

/// Position with every altitude source
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocationDetailed {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub altitude_ellipsoid: f64,
    pub altitude_relative: f64,
    pub altitude_barometric: f64,
}

/// GNSS fix quality
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocationStatus {
    pub hdop: f64,
    pub fix: i64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Orientation {
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
    pub heading: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Movement {
    pub velocity_horizontal: f64,
    pub velocity_vertical: f64,
    pub course: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Environment {
    pub temperature: f64,
    pub pressure: f64,
    pub humidity: f64,
}

/// Latest known state of one tracked device
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRecord {
    id: DeviceId,
    telemetry: Telemetry,
    time_of_last_contact: Option<DateTime<Utc>>,
    location_set: bool,
    trail: VecDeque<Location>,
    trail_length: usize,
}

impl TelemetryRecord {
    /// Create a record with every field at its default
    pub fn new(id: impl Into<DeviceId>) -> Self {
        Self::with_trail_length(id, DEFAULT_TRAIL_LENGTH)
    }

    /// Create a record keeping at most `trail_length` past positions
    ///
    /// A length of 0 disables the trail.
    pub fn with_trail_length(id: impl Into<DeviceId>, trail_length: usize) -> Self {
        Self {
            id: id.into(),
            telemetry: Telemetry::default(),
            time_of_last_contact: None,
            location_set: false,
            trail: VecDeque::with_capacity(trail_length.min(DEFAULT_TRAIL_LENGTH)),
            trail_length,
        }
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// `None` until the first update has been applied
    pub fn time_of_last_contact(&self) -> Option<DateTime<Utc>> {
        self.time_of_last_contact
    }

    pub fn location_set(&self) -> bool {
        self.location_set
    }

    /// Reported positions, oldest first
    pub fn trail(&self) -> &VecDeque<Location> {
        &self.trail
    }

    /// Merge name/value pairs into the record
    ///
    /// All names are validated before any value is written.
    ///
    /// # Returns
    ///
    /// * `Result<Vec<TelemetryField>>` - Fields that were written
    ///
    /// # Errors
    ///
    /// Returns `UnknownField` if a name is outside the schema; the record is
    /// left untouched.
    ///
    /// # Examples
    ///
    /// ```
    /// use icarus_gcs::telemetry::record::TelemetryRecord;
    ///
    /// let mut record = TelemetryRecord::new("B1");
    /// record.apply_update([("latitude", 37.7), ("longitude", -122.5)])?;
    ///
    /// let location = record.location();
    /// assert_eq!((location.latitude, location.longitude), (37.7, -122.5));
    /// assert!(record.location_set());
    /// # Ok::<(), icarus_gcs::error::IcarusError>(())
    /// ```
    pub fn apply_update<I, K>(&mut self, pairs: I) -> Result<Vec<TelemetryField>>
    where
        I: IntoIterator<Item = (K, f64)>,
        K: AsRef<str>,
    {
        let update = TelemetryUpdate::from_pairs(pairs)?;
        Ok(self.apply(&update))
    }

    /// Merge a validated update, stamping contact time with the current time
    pub fn apply(&mut self, update: &TelemetryUpdate) -> Vec<TelemetryField> {
        self.apply_at(update, Utc::now())
    }

    /// Merge a validated update, stamping contact time with `now`
    pub fn apply_at(
        &mut self,
        update: &TelemetryUpdate,
        now: DateTime<Utc>,
    ) -> Vec<TelemetryField> {
        for (field, value) in &update.values {
            self.telemetry.set(*field, *value);
        }

        if update.contains_location() {
            self.location_set = true;
            self.record_position();
        }
        self.time_of_last_contact = Some(now);

        update.fields().collect()
    }

    fn record_position(&mut self) {
        if self.trail_length == 0 {
            return;
        }
        while self.trail.len() >= self.trail_length {
            self.trail.pop_front();
        }
        self.trail.push_back(self.location());
    }

    /// Time since the last applied update, `None` if never updated
    pub fn time_since_last_contact(&self) -> Option<Duration> {
        self.time_since_last_contact_at(Utc::now())
    }

    pub fn time_since_last_contact_at(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.time_of_last_contact.map(|contact| now - contact)
    }

    pub fn location(&self) -> Location {
        let t = &self.telemetry;
        Location {
            latitude: t.latitude,
            longitude: t.longitude,
            altitude: t.altitude,
        }
    }

    pub fn location_detailed(&self) -> LocationDetailed {
        let t = &self.telemetry;
        LocationDetailed {
            latitude: t.latitude,
            longitude: t.longitude,
            altitude: t.altitude,
            altitude_ellipsoid: t.altitude_ellipsoid,
            altitude_relative: t.altitude_relative,
            altitude_barometric: t.altitude_barometric,
        }
    }

    pub fn location_status(&self) -> LocationStatus {
        LocationStatus {
            hdop: self.telemetry.hdop,
            fix: self.telemetry.fix,
        }
    }

    pub fn orientation(&self) -> Orientation {
        let t = &self.telemetry;
        Orientation {
            roll: t.roll,
            pitch: t.pitch,
            yaw: t.yaw,
            heading: t.heading,
        }
    }

    pub fn movement(&self) -> Movement {
        let t = &self.telemetry;
        Movement {
            velocity_horizontal: t.velocity_horizontal,
            velocity_vertical: t.velocity_vertical,
            course: t.course,
        }
    }

    pub fn environment(&self) -> Environment {
        let t = &self.telemetry;
        Environment {
            temperature: t.temperature,
            pressure: t.pressure,
            humidity: t.humidity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_new_record_has_defaults() {
        let record = TelemetryRecord::new("B1");
        assert_eq!(record.id().as_str(), "B1");
        assert_eq!(*record.telemetry(), Telemetry::default());
        assert_eq!(record.telemetry().fix, 0);
        assert!(record.time_of_last_contact().is_none());
        assert!(record.time_since_last_contact().is_none());
        assert!(!record.location_set());
    }

    #[test]
    fn test_apply_location_scenario() {
        let mut record = TelemetryRecord::new("B1");
        record
            .apply_update([("latitude", 37.7), ("longitude", -122.5)])
            .unwrap();

        assert_eq!(
            record.location(),
            Location { latitude: 37.7, longitude: -122.5, altitude: 0.0 }
        );
        assert!(record.location_set());
        assert!(record.time_of_last_contact().is_some());
    }

    #[test]
    fn test_apply_updates_only_given_keys() {
        let mut record = TelemetryRecord::new("B1");
        record.apply_update([("temperature", -40.0), ("roll", 3.0)]).unwrap();

        let before = *record.telemetry();
        let written = record.apply_update([("pressure", 101.3)]).unwrap();
        assert_eq!(written, vec![TelemetryField::Pressure]);

        for field in TelemetryField::ALL {
            if field == TelemetryField::Pressure {
                assert_eq!(record.telemetry().get(field), 101.3);
            } else {
                let value = record.telemetry().get(field);
                assert_eq!(value, before.get(field), "{} changed", field);
            }
        }
    }

    #[test]
    fn test_unknown_field_rejected_atomically() {
        let mut record = TelemetryRecord::new("B1");
        let before = record.clone();

        let result = record.apply_update([("latitude", 1.0), ("battery", 12.0)]);
        match result {
            Err(IcarusError::UnknownField(name)) => assert_eq!(name, "battery"),
            other => panic!("Expected UnknownField, got: {:?}", other),
        }

        assert_eq!(record, before);
    }

    #[test]
    fn test_non_location_update_keeps_location_unset() {
        let mut record = TelemetryRecord::new("B1");
        record.apply_update([("humidity", 40.0)]).unwrap();
        assert!(!record.location_set());
        assert!(record.time_of_last_contact().is_some());
    }

    #[test]
    fn test_legacy_ellipsoid_spelling() {
        let mut record = TelemetryRecord::new("B1");
        record.apply_update([("altitude_elipsoid", 1200.0)]).unwrap();
        assert_eq!(record.location_detailed().altitude_ellipsoid, 1200.0);
    }

    #[test]
    fn test_fix_is_truncated() {
        let mut record = TelemetryRecord::new("B1");
        record.apply_update([("fix", 3.0), ("hdop", 0.9)]).unwrap();
        assert_eq!(record.location_status(), LocationStatus { hdop: 0.9, fix: 3 });
    }

    #[test]
    fn test_derived_views() {
        let mut record = TelemetryRecord::new(DeviceId::new("B2"));
        let update = TelemetryUpdate::new()
            .with(TelemetryField::Roll, 1.0)
            .with(TelemetryField::Pitch, 2.0)
            .with(TelemetryField::Yaw, 3.0)
            .with(TelemetryField::Heading, 4.0)
            .with(TelemetryField::VelocityHorizontal, 5.0)
            .with(TelemetryField::VelocityVertical, -6.0)
            .with(TelemetryField::Course, 270.0)
            .with(TelemetryField::Temperature, -20.5)
            .with(TelemetryField::Pressure, 300.0)
            .with(TelemetryField::Humidity, 12.0);
        record.apply(&update);

        assert_eq!(
            record.orientation(),
            Orientation { roll: 1.0, pitch: 2.0, yaw: 3.0, heading: 4.0 }
        );
        assert_eq!(
            record.movement(),
            Movement { velocity_horizontal: 5.0, velocity_vertical: -6.0, course: 270.0 }
        );
        assert_eq!(
            record.environment(),
            Environment { temperature: -20.5, pressure: 300.0, humidity: 12.0 }
        );
    }

    #[test]
    fn test_time_since_last_contact() {
        let mut record = TelemetryRecord::new("B1");
        let contact = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        record.apply_at(&TelemetryUpdate::new(), contact);

        let later = contact + Duration::seconds(42);
        assert_eq!(record.time_since_last_contact_at(later), Some(Duration::seconds(42)));
    }

    #[test]
    fn test_trail_follows_location_updates() {
        let mut record = TelemetryRecord::new("B1");
        assert!(record.trail().is_empty());

        record.apply_update([("latitude", 37.7), ("longitude", -122.5)]).unwrap();
        record.apply_update([("temperature", -10.0)]).unwrap();
        record.apply_update([("altitude", 900.0)]).unwrap();

        let trail: Vec<_> = record.trail().iter().copied().collect();
        assert_eq!(
            trail,
            vec![
                Location { latitude: 37.7, longitude: -122.5, altitude: 0.0 },
                Location { latitude: 37.7, longitude: -122.5, altitude: 900.0 },
            ]
        );
    }

    #[test]
    fn test_trail_drops_oldest_positions() {
        let mut record = TelemetryRecord::with_trail_length("B1", 3);
        for i in 0..5 {
            record.apply_update([("latitude", i as f64)]).unwrap();
        }

        let latitudes: Vec<f64> = record.trail().iter().map(|l| l.latitude).collect();
        assert_eq!(latitudes, vec![2.0, 3.0, 4.0]);
        assert_eq!(record.location().latitude, 4.0);
    }

    #[test]
    fn test_zero_trail_length_keeps_no_trail() {
        let mut record = TelemetryRecord::with_trail_length("B1", 0);
        record.apply_update([("latitude", 1.0)]).unwrap();
        assert!(record.trail().is_empty());
        assert!(record.location_set());
    }

    #[test]
    fn test_field_names_round_trip_through_parse() {
        for field in TelemetryField::ALL {
            assert_eq!(field.name().parse::<TelemetryField>().unwrap(), field);
        }
    }
}
