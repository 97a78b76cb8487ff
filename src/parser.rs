//! Payload parser and validator.
//!
//! Turns an MQTT `(topic, body)` pair into a [`Reading`]. The topic carries the
//! identity (`<prefix>/H-<hub>/S-<sensor>`), the JSON body carries the values.
//! Anything that does not match the schema exactly is rejected with a typed
//! [`ParseError`]; nothing is coerced.

use chrono::{DateTime, NaiveDate, Utc};

use crate::error::ParseError;
use crate::models::{RawDate, RawPayload, Reading};

/// Payload bytes kept in log lines for rejected messages.
pub const LOG_PREVIEW_BYTES: usize = 256;

// ---

/// Plausible temperature range in °C, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemperatureBounds {
    // ---
    pub min_c: f64,
    pub max_c: f64,
}

impl Default for TemperatureBounds {
    fn default() -> Self {
        Self {
            min_c: -40.0,
            max_c: 85.0,
        }
    }
}

/// Hub and sensor tokens taken from a topic, e.g. (`H-0`, `S-2`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicTokens {
    // ---
    pub hub: String,
    pub sensor: String,
}

#[derive(Debug, Clone)]
pub struct Parser {
    // ---
    prefix: String,
    bounds: TemperatureBounds,
}

impl Parser {
    // ---
    pub fn new(prefix: impl Into<String>, bounds: TemperatureBounds) -> Self {
        // ---
        Self {
            prefix: prefix.into().trim_end_matches('/').to_string(),
            bounds,
        }
    }

    /// Parse and validate one message.
    pub fn parse(&self, topic: &str, payload: &[u8]) -> Result<Reading, ParseError> {
        // ---
        let tokens = self.parse_topic(topic)?;
        let raw = decode(payload)?;

        for (field, claimed, actual) in [
            ("hub_id", raw.hub_id.as_deref(), tokens.hub.as_str()),
            ("sensor_id", raw.sensor_id.as_deref(), tokens.sensor.as_str()),
        ] {
            if let Some(claimed) = claimed {
                if claimed != actual {
                    return Err(ParseError::MalformedPayload {
                        path: field.to_string(),
                        reason: format!("'{claimed}' disagrees with topic token '{actual}'"),
                    });
                }
            }
        }

        check_finite("temp", raw.temp)?;
        if raw.temp < self.bounds.min_c || raw.temp > self.bounds.max_c {
            return Err(ParseError::OutOfRange {
                field: "temp",
                reason: format!(
                    "{} not within {}..={} °C",
                    raw.temp, self.bounds.min_c, self.bounds.max_c
                ),
            });
        }
        check_percent("humidity", raw.humidity)?;
        check_percent("moisture", raw.moisture)?;

        let observed_at = compose_timestamp(&raw.date)?;

        Ok(Reading {
            hub_id: tokens.hub,
            sensor_id: tokens.sensor,
            temperature: raw.temp,
            humidity: raw.humidity,
            moisture: raw.moisture,
            observed_at,
        })
    }

    /// Split `<prefix>/H-<hub>/S-<sensor>` into its tokens.
    pub fn parse_topic(&self, topic: &str) -> Result<TopicTokens, ParseError> {
        // ---
        let bad = || ParseError::BadTopic(topic.to_string());

        let rest = topic
            .strip_prefix(self.prefix.as_str())
            .and_then(|r| r.strip_prefix('/'))
            .ok_or_else(bad)?;

        let mut segments = rest.split('/');
        let (Some(hub), Some(sensor), None) = (segments.next(), segments.next(), segments.next())
        else {
            return Err(bad());
        };

        if !is_token(hub, "H-") || !is_token(sensor, "S-") {
            return Err(bad());
        }

        Ok(TopicTokens {
            hub: hub.to_string(),
            sensor: sensor.to_string(),
        })
    }
}

/// Lossy, length-capped rendering of a payload for log lines.
pub fn preview(payload: &[u8]) -> String {
    // ---
    if payload.len() <= LOG_PREVIEW_BYTES {
        return String::from_utf8_lossy(payload).into_owned();
    }
    let mut text = String::from_utf8_lossy(&payload[..LOG_PREVIEW_BYTES]).into_owned();
    text.push_str("...");
    text
}

fn is_token(segment: &str, marker: &str) -> bool {
    // ---
    segment.strip_prefix(marker).is_some_and(|id| {
        !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    })
}

fn decode(payload: &[u8]) -> Result<RawPayload, ParseError> {
    // ---
    let mut de = serde_json::Deserializer::from_slice(payload);
    let raw: RawPayload =
        serde_path_to_error::deserialize(&mut de).map_err(|e| ParseError::MalformedPayload {
            path: e.path().to_string(),
            reason: e.inner().to_string(),
        })?;
    de.end().map_err(|e| ParseError::MalformedPayload {
        path: ".".to_string(),
        reason: e.to_string(),
    })?;
    Ok(raw)
}

fn check_finite(field: &'static str, value: f64) -> Result<(), ParseError> {
    // ---
    if value.is_finite() {
        Ok(())
    } else {
        Err(ParseError::OutOfRange {
            field,
            reason: format!("{value} is not a finite number"),
        })
    }
}

fn check_percent(field: &'static str, value: f64) -> Result<(), ParseError> {
    // ---
    check_finite(field, value)?;
    if (0.0..=100.0).contains(&value) {
        Ok(())
    } else {
        Err(ParseError::OutOfRange {
            field,
            reason: format!("{value} not within 0..=100 %"),
        })
    }
}

fn compose_timestamp(date: &RawDate) -> Result<DateTime<Utc>, ParseError> {
    // ---
    let invalid = || ParseError::OutOfRange {
        field: "date",
        reason: format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02} is not a valid calendar time",
            date.year, date.month, date.day, date.hour, date.minute, date.second
        ),
    };

    calendar_time(date).ok_or_else(invalid)
}

fn calendar_time(date: &RawDate) -> Option<DateTime<Utc>> {
    // ---
    let part = |v: i64| u32::try_from(v).ok();

    let naive = NaiveDate::from_ymd_opt(
        i32::try_from(date.year).ok()?,
        part(date.month)?,
        part(date.day)?,
    )?
    .and_hms_opt(part(date.hour)?, part(date.minute)?, part(date.second)?)?;
    Some(naive.and_utc())
}
