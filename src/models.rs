//! Data models for the ingestion pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---

/// A hub (gateway) as first seen on the topic path, e.g. `H-0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct HubIdentity {
    // ---
    pub hub_id: String,
}

/// A sensor attached to exactly one hub.
///
/// `key` is the storage surrogate; readings reference it. The same `S-<n>`
/// token under two different hubs yields two identities with distinct keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct SensorIdentity {
    // ---
    pub key: i64,
    pub hub_id: String,
    pub sensor_id: String,
}

/// A validated reading, ready for the scheduler and storage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    // ---
    pub hub_id: String,
    pub sensor_id: String,
    pub temperature: f64,
    pub humidity: f64,
    pub moisture: f64,
    pub observed_at: DateTime<Utc>,
}

/// Raw message body as published by a hub.
///
/// Fields are typed strictly: a float where an integer is expected (or a
/// string where a number is expected) fails decoding instead of coercing.
#[derive(Debug, Deserialize)]
pub struct RawPayload {
    // ---
    pub sensor_id: Option<String>,
    pub hub_id: Option<String>,
    pub temp: f64,
    pub humidity: f64,
    pub moisture: f64,
    pub date: RawDate,
}

/// Broken-down observation time, interpreted as UTC.
///
/// Signed and wide: any integer decodes, and a component the calendar cannot
/// hold is reported as out of range rather than malformed.
#[derive(Debug, Deserialize)]
pub struct RawDate {
    // ---
    pub year: i64,
    pub month: i64,
    pub day: i64,
    pub hour: i64,
    pub minute: i64,
    pub second: i64,
}

/// One row of the `readings` table joined with its sensor.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ReadingRow {
    // ---
    pub hub_id: String,
    pub sensor_id: String,
    pub temperature: f64,
    pub humidity: f64,
    pub moisture: f64,
    pub observed_at: i64,
}

impl ReadingRow {
    // ---
    pub(crate) fn into_reading(self) -> Option<Reading> {
        // ---
        let observed_at = DateTime::<Utc>::from_timestamp(self.observed_at, 0)?;
        Some(Reading {
            hub_id: self.hub_id,
            sensor_id: self.sensor_id,
            temperature: self.temperature,
            humidity: self.humidity,
            moisture: self.moisture,
            observed_at,
        })
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_row_conversion() {
        // ---
        let row = ReadingRow {
            hub_id: "H-0".to_string(),
            sensor_id: "S-1".to_string(),
            temperature: 21.5,
            humidity: 40.0,
            moisture: 33.3,
            observed_at: 1_742_928_300,
        };

        let reading = row.into_reading().unwrap();
        assert_eq!(
            reading.observed_at,
            Utc.with_ymd_and_hms(2025, 3, 25, 18, 45, 0).unwrap()
        );
        assert_eq!(reading.hub_id, "H-0");
        assert_eq!(reading.sensor_id, "S-1");
        assert_eq!(reading.temperature, 21.5);
    }

    #[test]
    fn test_row_conversion_rejects_unrepresentable_time() {
        // ---
        let row = ReadingRow {
            hub_id: "H-0".to_string(),
            sensor_id: "S-1".to_string(),
            temperature: 21.5,
            humidity: 40.0,
            moisture: 33.3,
            observed_at: i64::MAX,
        };
        assert!(row.into_reading().is_none());
    }
}
