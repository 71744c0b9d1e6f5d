//! # telagg
//!
//! Housekeeping telemetry aggregator.
//!
//! telagg subscribes to named telemetry feeds published by instrument
//! drivers, buffers their samples per feed, and writes them as
//! column-oriented frames into time-partitioned segment files. Segments
//! rotate on a fixed wall-clock interval, and every sample that was accepted
//! lands in exactly one segment.
//!
//! ## Key Properties
//!
//! - Per-feed buffering: self-buffered feeds are written on arrival, the
//!   rest accumulate for a time window
//! - One open segment at a time, rotated every `time_per_file`
//! - A malformed feed never stops the others; a failing segment stops the run
//! - Segments are self-describing and terminated by an end-of-processing frame
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use telagg::{Aggregator, FeedAddress, FeedMeta, LocalHub, RecorderConfig, Sample};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // An in-process hub stands in for the driver layer.
//! let hub = LocalHub::new();
//! let therm = FeedAddress::new("dev1", "therm")?;
//! hub.declare_feed(FeedMeta { address: therm.clone(), buffered: false, buffer_time: None });
//!
//! let aggregator = Aggregator::new(Arc::new(hub.clone()));
//! aggregator.subscribe("dev1", "therm", None)?;
//! aggregator.start(RecorderConfig::new("./data"))?;
//!
//! hub.publish(&therm, vec![Sample::new("ch1", 1_700_000_000.0, 10.0)])?;
//!
//! if let Some(summary) = aggregator.stop()? {
//!     println!("{} samples in {:?}", summary.samples, summary.segments);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`engine`]: the [`Aggregator`], its subscription registry and rotation
//! - [`control`]: JSON commands, responses and progress events
//! - [`source`]: feed and discovery interfaces, plus the in-process [`LocalHub`]
//! - [`buffer`]: per-feed sample buffers
//! - [`frame`]: housekeeping frame construction
//! - [`segment`]: segment naming, writing and reading
//! - [`feed`]: feed addresses, samples and buffering policy
//! - [`config`]: recorder configuration
//! - [`clock`]: wall-clock abstraction
//! - [`error`]: error types

pub mod buffer;
pub mod clock;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod feed;
pub mod frame;
pub mod segment;
pub mod source;

// Re-export primary API types at crate root for convenience.
pub use config::RecorderConfig;
pub use control::{Command, ControlResponse, EngineEvent, StartParams};
pub use engine::{Aggregator, EngineState, RecorderState, RunSummary, Subscription};
pub use error::{Result, TelaggError};
pub use feed::{BufferPolicy, FeedAddress, FeedMeta, Sample};
pub use frame::Frame;
pub use segment::{SegmentReader, SegmentWriter};
pub use source::LocalHub;
