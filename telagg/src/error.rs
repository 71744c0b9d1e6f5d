//! Error types for the telagg aggregation engine.

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for all telagg operations.
///
/// Errors fall into two scopes. [`FrameError`] is local to a single feed's
/// flush and never stops the recorder. [`SegmentError`] is fatal to the
/// current run unless the sink only reports itself unavailable.
/// Configuration and subscription errors are rejected before any state
/// changes.
#[derive(Error, Debug)]
pub enum TelaggError {
    /// Invalid recorder or feed configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Error while subscribing to a feed.
    #[error("subscription error: {0}")]
    Subscription(#[from] SubscriptionError),

    /// Error building a frame from buffered samples.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Error writing or reading a segment file.
    #[error("segment error: {0}")]
    Segment(#[from] SegmentError),

    /// Error in the engine lifecycle.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
}

impl TelaggError {
    /// Returns true if this error terminates the current recording run.
    ///
    /// A sink reporting [`SegmentError::Unavailable`] has written nothing and
    /// is retried; every other segment error may have left a partial frame
    /// behind and ends the run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Segment(e) if !matches!(e, SegmentError::Unavailable { .. }))
    }
}

/// Errors raised while validating configuration or parameters.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A duration parameter was zero, negative or not finite.
    #[error("invalid {name}: {value} (must be a positive number of seconds)")]
    InvalidDuration {
        /// Name of the parameter.
        name: &'static str,
        /// The rejected value in seconds.
        value: f64,
    },

    /// The data directory was empty.
    #[error("data directory must not be empty")]
    EmptyDataDir,

    /// A feed address component was malformed.
    #[error("invalid feed address '{address}': {reason}")]
    InvalidAddress {
        /// The offending address or address component.
        address: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A configuration document could not be parsed.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Errors reported by a feed source when subscribing.
#[derive(Error, Debug)]
pub enum SubscriptionError {
    /// The source does not know the requested feed.
    #[error("feed '{feed}' is not published by source '{source_addr}'")]
    UnknownFeed {
        /// The source address.
        source_addr: String,
        /// The requested feed name.
        feed: String,
    },
}

/// Errors building a frame from a feed's samples.
#[derive(Error, Debug)]
pub enum FrameError {
    /// The serializer was handed no samples.
    #[error("refusing to build a frame for feed '{address}' with no samples")]
    Empty {
        /// The feed address.
        address: String,
    },

    /// A sample carried an empty key.
    #[error("sample {index} of feed '{address}' has an empty key")]
    EmptyKey {
        /// The feed address.
        address: String,
        /// Position of the sample in the buffer.
        index: usize,
    },
}

/// Errors creating, writing, closing or reading segment files.
#[derive(Error, Debug)]
pub enum SegmentError {
    /// The segment directory could not be created.
    #[error("failed to create segment directory '{}': {source}", path.display())]
    CreateDir {
        /// The directory path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The segment file could not be opened.
    #[error("failed to open segment '{}': {source}", path.display())]
    Open {
        /// The segment path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Writing a frame failed.
    #[error("failed to write segment '{}': {source}", path.display())]
    Write {
        /// The segment path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Flushing or syncing the segment failed.
    #[error("failed to sync segment '{}': {source}", path.display())]
    Sync {
        /// The segment path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A frame could not be encoded or decoded.
    #[error("frame encoding failed in segment '{}': {source}", path.display())]
    Encode {
        /// The segment path.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// The segment was written to after being finished.
    #[error("segment '{}' is already closed", path.display())]
    Closed {
        /// The segment path.
        path: PathBuf,
    },

    /// The sink could not take a frame right now and wrote nothing.
    #[error("segment '{}' is temporarily unavailable: {reason}", path.display())]
    Unavailable {
        /// The segment path.
        path: PathBuf,
        /// Why the sink refused the frame.
        reason: String,
    },

    /// The segment file is not a valid telagg segment.
    #[error("segment '{}' is corrupted: {reason}", path.display())]
    Corrupted {
        /// The segment path.
        path: PathBuf,
        /// Description of the corruption.
        reason: String,
    },
}

/// Errors in the engine lifecycle.
#[derive(Error, Debug)]
pub enum EngineError {
    /// `start` was called while a run is in progress.
    #[error("aggregator is already running")]
    AlreadyRunning,

    /// The control thread could not be spawned.
    #[error("failed to spawn control thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// The control thread panicked.
    #[error("control thread panicked")]
    ControlPanicked,

    /// A flush found no open segment to write to.
    #[error("no segment is open")]
    NoOpenSegment,

    /// Buffered samples could not be written when the run ended.
    #[error("{samples} buffered samples of {feeds} feeds could not be written")]
    Unflushed {
        /// Number of feeds with unwritten samples.
        feeds: usize,
        /// Number of unwritten samples.
        samples: usize,
    },

    /// The run ended on a fatal error before it was stopped.
    #[error("recording run aborted: {reason}")]
    RunAborted {
        /// Description of the fatal error.
        reason: String,
    },
}

/// Type alias for `Result<T, TelaggError>`.
pub type Result<T> = std::result::Result<T, TelaggError>;
