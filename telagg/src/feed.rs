//! Feed addressing, metadata and sample types.
//!
//! A feed is a named stream of timestamped samples published by a source.
//! Its address joins the source id and feed name around the `.feeds.`
//! separator, e.g. `observatory.lakeshore.feeds.temperatures`.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Separator between source id and feed name in a feed address.
pub const FEED_SEPARATOR: &str = ".feeds.";

/// Fully-qualified address of a feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FeedAddress {
    address: String,
    split: usize,
}

impl FeedAddress {
    /// Builds the address for `feed_name` published by `source_addr`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidAddress`] if either part is empty or the
    /// feed name itself contains the `.feeds.` separator.
    pub fn new(source_addr: &str, feed_name: &str) -> Result<Self> {
        if source_addr.is_empty() {
            return Err(invalid(source_addr, "source address is empty"));
        }
        if feed_name.is_empty() {
            return Err(invalid(feed_name, "feed name is empty"));
        }
        if feed_name.contains(FEED_SEPARATOR) {
            return Err(invalid(feed_name, "feed name contains '.feeds.'"));
        }

        Ok(Self {
            address: format!("{source_addr}{FEED_SEPARATOR}{feed_name}"),
            split: source_addr.len(),
        })
    }

    /// Parses a full `<source>.feeds.<feed>` address.
    ///
    /// The last occurrence of the separator splits the address, so source ids
    /// may themselves be dotted.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidAddress`] if the separator is missing or
    /// either side is empty.
    pub fn parse(address: &str) -> Result<Self> {
        let Some(split) = address.rfind(FEED_SEPARATOR) else {
            return Err(invalid(address, "missing '.feeds.' separator"));
        };
        Self::new(&address[..split], &address[split + FEED_SEPARATOR.len()..])
    }

    /// The source (agent) portion of the address.
    pub fn source(&self) -> &str {
        &self.address[..self.split]
    }

    /// The feed name portion of the address.
    pub fn feed(&self) -> &str {
        &self.address[self.split + FEED_SEPARATOR.len()..]
    }

    /// The full address string.
    pub fn as_str(&self) -> &str {
        &self.address
    }
}

fn invalid(address: &str, reason: &str) -> crate::error::TelaggError {
    ConfigError::InvalidAddress {
        address: address.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

impl fmt::Display for FeedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

impl TryFrom<String> for FeedAddress {
    type Error = crate::error::TelaggError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<FeedAddress> for String {
    fn from(value: FeedAddress) -> Self {
        value.address
    }
}

/// A single timestamped value for one named time series within a feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Name of the time series (e.g. a sensor channel).
    pub key: String,
    /// Sample time in seconds since the Unix epoch, as reported by the driver.
    pub timestamp: f64,
    /// The sampled value.
    pub value: f64,
}

impl Sample {
    /// Creates a new sample.
    pub fn new(key: impl Into<String>, timestamp: f64, value: f64) -> Self {
        Self {
            key: key.into(),
            timestamp,
            value,
        }
    }
}

/// How samples of a feed are buffered before serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferPolicy {
    /// The source batches before publishing; every delivery is written
    /// immediately.
    SelfBuffered,
    /// The engine accumulates samples and flushes once the window is exceeded.
    /// `None` falls back to the run's `time_per_frame`.
    Windowed(#[serde(with = "crate::config::opt_seconds")] Option<Duration>),
}

impl BufferPolicy {
    /// Resolves the accumulation window, or `None` for passthrough feeds.
    pub fn window(self, time_per_frame: Duration) -> Option<Duration> {
        match self {
            Self::SelfBuffered => None,
            Self::Windowed(window) => Some(window.unwrap_or(time_per_frame)),
        }
    }
}

/// Feed metadata delivered alongside every batch of samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedMeta {
    /// Address of the publishing feed.
    pub address: FeedAddress,
    /// Whether the source batches samples itself.
    pub buffered: bool,
    /// Advertised accumulation window for engine-buffered feeds.
    #[serde(with = "crate::config::opt_seconds", default)]
    pub buffer_time: Option<Duration>,
}

impl FeedMeta {
    /// The buffering policy this metadata requests.
    pub fn policy(&self) -> BufferPolicy {
        if self.buffered {
            BufferPolicy::SelfBuffered
        } else {
            BufferPolicy::Windowed(self.buffer_time)
        }
    }
}

/// One callback invocation from a feed source.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The samples of this data point, all arriving together.
    pub samples: Vec<Sample>,
    /// Metadata of the publishing feed.
    pub meta: FeedMeta,
}
