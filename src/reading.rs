use serde::Serialize;

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

/// One temperature/humidity sample.
///
/// The wire shape is `{ "ts": .., "t": .., "h": .. }` regardless of which
/// storage backend holds it.
#[derive(Debug, Serialize, Clone, Copy, PartialEq)]
pub struct Reading {
    #[serde(rename = "ts")]
    pub timestamp: Timestamp,
    #[serde(rename = "t")]
    pub temperature: f64,
    #[serde(rename = "h")]
    pub humidity: f64,
}

/// A validated sample that has not been stored yet. The store assigns the
/// timestamp when it appends it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    temperature: f64,
    humidity: f64,
}

impl Sample {
    /// Returns `None` unless both values are finite.
    pub fn new(temperature: f64, humidity: f64) -> Option<Self> {
        (temperature.is_finite() && humidity.is_finite()).then_some(Self {
            temperature,
            humidity,
        })
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn humidity(&self) -> f64 {
        self.humidity
    }

    /// Stamps the sample, producing the immutable stored form.
    pub fn at(self, timestamp: Timestamp) -> Reading {
        Reading {
            timestamp,
            temperature: self.temperature(),
            humidity: self.humidity(),
        }
    }
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> Timestamp {
    let now = time::OffsetDateTime::now_utc();
    (now.unix_timestamp_nanos() / 1_000_000) as Timestamp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_rejects_non_finite() {
        assert!(Sample::new(f64::NAN, 5.0).is_none());
        assert!(Sample::new(20.0, f64::INFINITY).is_none());
        assert!(Sample::new(f64::NEG_INFINITY, 5.0).is_none());
        assert!(Sample::new(20.0, 50.0).is_some());
    }

    #[test]
    fn test_wire_shape() {
        let reading = Sample::new(19.5, 44.2).unwrap().at(1_000);
        assert_eq!(
            serde_json::to_value(reading).unwrap(),
            serde_json::json!({ "ts": 1000, "t": 19.5, "h": 44.2 })
        );
    }
}
