//! Serde helpers for durations in configuration and persisted records.
//!
//! Durations serialize as integer milliseconds. On input either integer
//! milliseconds or a humantime string ("30s", "7days") is accepted.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Deserialize)]
#[serde(untagged)]
enum DurationRepr {
    Millis(u64),
    Human(String),
}

impl DurationRepr {
    fn into_duration<E: serde::de::Error>(self) -> Result<Duration, E> {
        match self {
            DurationRepr::Millis(ms) => Ok(Duration::from_millis(ms)),
            DurationRepr::Human(text) => humantime::parse_duration(&text)
                .map_err(|e| E::custom(format!("invalid duration '{text}': {e}"))),
        }
    }
}

fn as_millis(d: &Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

pub mod millis {
    use super::*;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(as_millis(duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        DurationRepr::deserialize(deserializer)?.into_duration()
    }
}

pub mod millis_map {
    use super::*;

    pub fn serialize<K, S>(map: &BTreeMap<K, Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        K: Serialize + Ord,
        S: Serializer,
    {
        let raw: BTreeMap<&K, u64> = map.iter().map(|(k, v)| (k, as_millis(v))).collect();
        raw.serialize(serializer)
    }

    pub fn deserialize<'de, K, D>(deserializer: D) -> Result<BTreeMap<K, Duration>, D::Error>
    where
        K: Deserialize<'de> + Ord,
        D: Deserializer<'de>,
    {
        let raw = BTreeMap::<K, DurationRepr>::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(k, v)| Ok((k, v.into_duration::<D::Error>()?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize)]
    struct Wrapper {
        #[serde(with = "millis")]
        timeout: Duration,
    }

    #[test]
    fn test_accepts_millis_and_humantime() {
        let a: Wrapper = serde_json::from_str(r#"{"timeout": 30000}"#).unwrap();
        let b: Wrapper = serde_json::from_str(r#"{"timeout": "30s"}"#).unwrap();
        assert_eq!(a.timeout, Duration::from_secs(30));
        assert_eq!(a.timeout, b.timeout);
    }

    #[test]
    fn test_serializes_as_millis() {
        let w = Wrapper {
            timeout: Duration::from_secs(2),
        };
        assert_eq!(serde_json::to_string(&w).unwrap(), r#"{"timeout":2000}"#);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(serde_json::from_str::<Wrapper>(r#"{"timeout": "soon"}"#).is_err());
    }
}
