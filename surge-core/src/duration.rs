use serde::{de, Deserializer, Serializer};
use serde_with::{DeserializeAs, SerializeAs};
use std::fmt;
use std::time::Duration;

/// `serde_with` adapter for durations written as humantime strings (`"10s"`, `"1m 30s"`) or as
/// plain integer/float seconds.
pub struct HumanDuration;

impl<'de> DeserializeAs<'de, Duration> for HumanDuration {
    fn deserialize_as<D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(HumanDurationVisitor)
    }
}

impl SerializeAs<Duration> for HumanDuration {
    fn serialize_as<S>(source: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(&humantime::format_duration(*source))
    }
}

struct HumanDurationVisitor;

impl<'de> de::Visitor<'de> for HumanDurationVisitor {
    type Value = Duration;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a duration string (e.g. \"10s\") or a number of seconds")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        Ok(Duration::from_secs(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        u64::try_from(v)
            .map(Duration::from_secs)
            .map_err(|_| E::custom("duration must not be negative"))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
        if !v.is_finite() || v < 0. {
            return Err(E::custom("duration must be a non-negative, finite number"));
        }
        Duration::try_from_secs_f64(v).map_err(E::custom)
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        let v = v.trim();
        // humantime rejects a bare zero
        if v == "0" {
            return Ok(Duration::ZERO);
        }
        humantime::parse_duration(v).map_err(E::custom)
    }
}
