//! Frames: the unit of output written to segment files.
//!
//! The Frame Serializer turns a flat, arrival-ordered list of samples into a
//! column-oriented record: for every key, a vector of values and a parallel
//! vector of timestamps. Order within each key is the order of arrival; the
//! serializer never re-sorts.
//!
//! Numbers are stored as they were delivered. JSON has no literal for NaN or
//! the infinities, so those are written as the strings `"NaN"`, `"Infinity"`
//! and `"-Infinity"` and read back as the same values.
//!
//! ```rust
//! use telagg::feed::{FeedAddress, Sample};
//! use telagg::frame::Frame;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let address = FeedAddress::new("dev1", "therm")?;
//! let samples = vec![
//!     Sample::new("ch1", 0.0, 10.0),
//!     Sample::new("ch2", 0.0, 4.2),
//!     Sample::new("ch1", 0.5, 11.0),
//! ];
//! let frame = Frame::housekeeping(&address, &samples)?;
//! let hk = frame.as_housekeeping().unwrap();
//! assert_eq!(hk.tods["ch1"], vec![10.0, 11.0]);
//! assert_eq!(hk.timestamps["ch1"], vec![0.0, 0.5]);
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{FrameError, Result};
use crate::feed::{FeedAddress, Sample};

/// A record written to a segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Buffered samples of one feed.
    Housekeeping(HousekeepingFrame),
    /// Terminal marker written when a segment is closed.
    EndProcessing,
}

/// Column-oriented samples of one feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HousekeepingFrame {
    /// Source id of the publishing feed.
    pub agent_address: String,
    /// Feed name.
    pub feed: String,
    /// Values per key, in arrival order.
    #[serde(with = "columns")]
    pub tods: BTreeMap<String, Vec<f64>>,
    /// Timestamps per key, parallel to `tods`.
    #[serde(with = "columns")]
    pub timestamps: BTreeMap<String, Vec<f64>>,
}

impl HousekeepingFrame {
    /// Total number of samples in the frame.
    pub fn sample_count(&self) -> usize {
        self.tods.values().map(Vec::len).sum()
    }

    /// Iterates `(key, timestamp, value)` per key in stored order.
    pub fn samples(&self) -> impl Iterator<Item = Sample> + '_ {
        self.tods.iter().flat_map(move |(key, values)| {
            let stamps = self.timestamps.get(key).map_or(&[][..], Vec::as_slice);
            values
                .iter()
                .zip(stamps)
                .map(move |(&value, &timestamp)| Sample::new(key.clone(), timestamp, value))
        })
    }
}

impl Frame {
    /// Builds a housekeeping frame from a feed's buffered samples.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError`] if `samples` is empty or a sample has an empty
    /// key. Values and timestamps are not interpreted.
    pub fn housekeeping(address: &FeedAddress, samples: &[Sample]) -> Result<Self> {
        if samples.is_empty() {
            return Err(FrameError::Empty {
                address: address.to_string(),
            }
            .into());
        }

        let mut tods: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        let mut timestamps: BTreeMap<String, Vec<f64>> = BTreeMap::new();

        for (index, sample) in samples.iter().enumerate() {
            if sample.key.is_empty() {
                return Err(FrameError::EmptyKey {
                    address: address.to_string(),
                    index,
                }
                .into());
            }

            tods.entry(sample.key.clone())
                .or_default()
                .push(sample.value);
            timestamps
                .entry(sample.key.clone())
                .or_default()
                .push(sample.timestamp);
        }

        Ok(Self::Housekeeping(HousekeepingFrame {
            agent_address: address.source().to_string(),
            feed: address.feed().to_string(),
            tods,
            timestamps,
        }))
    }

    /// Returns the housekeeping payload, if any.
    pub fn as_housekeeping(&self) -> Option<&HousekeepingFrame> {
        match self {
            Self::Housekeeping(hk) => Some(hk),
            Self::EndProcessing => None,
        }
    }
}

/// A single number that survives a JSON round trip, non-finite included.
struct Reading(f64);

impl Serialize for Reading {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let value = self.0;
        if value.is_finite() {
            serializer.serialize_f64(value)
        } else if value.is_nan() {
            serializer.serialize_str("NaN")
        } else if value > 0.0 {
            serializer.serialize_str("Infinity")
        } else {
            serializer.serialize_str("-Infinity")
        }
    }
}

impl<'de> Deserialize<'de> for Reading {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(f64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(value) => Ok(Self(value)),
            Raw::Text(text) => match text.as_str() {
                "NaN" => Ok(Self(f64::NAN)),
                "Infinity" => Ok(Self(f64::INFINITY)),
                "-Infinity" => Ok(Self(f64::NEG_INFINITY)),
                other => Err(serde::de::Error::custom(format!("invalid number '{other}'"))),
            },
        }
    }
}

/// Serde support for per-key columns of [`Reading`]s.
mod columns {
    use std::collections::BTreeMap;

    use serde::ser::SerializeMap;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::Reading;

    pub fn serialize<S>(columns: &BTreeMap<String, Vec<f64>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        struct Column<'a>(&'a [f64]);

        impl serde::Serialize for Column<'_> {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_seq(self.0.iter().map(|&value| Reading(value)))
            }
        }

        let mut map = serializer.serialize_map(Some(columns.len()))?;
        for (key, values) in columns {
            map.serialize_entry(key, &Column(values))?;
        }
        map.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<String, Vec<f64>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = BTreeMap::<String, Vec<Reading>>::deserialize(deserializer)?;
        Ok(raw
            .into_iter()
            .map(|(key, readings)| (key, readings.into_iter().map(|r| r.0).collect()))
            .collect())
    }
}
