//! Command surface of the aggregator.
//!
//! External supervisors drive an [`Aggregator`] with [`Command`]s, which
//! deserialize from JSON objects tagged by `"command"`:
//!
//! ```json
//! { "command": "start", "time_per_file": 600, "data_dir": "/data/hk" }
//! { "command": "subscribe", "agent_address": "dev1", "feed_name": "therm" }
//! { "command": "stop" }
//! ```
//!
//! Every command yields a [`ControlResponse`]; progress is reported
//! separately as [`EngineEvent`]s on the receivers handed out by
//! [`Aggregator::events`].

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::{
    DEFAULT_DATA_DIR, DEFAULT_TIME_PER_FILE, DEFAULT_TIME_PER_FRAME, RecorderConfig,
    positive_seconds,
};
use crate::engine::{Aggregator, Subscription};
use crate::error::{ConfigError, Result};
use crate::feed::FeedAddress;

/// A request to the aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Start a recording run.
    Start(StartParams),
    /// Stop the current run.
    Stop,
    /// Subscribe to a feed.
    Subscribe {
        /// Source id of the feed's publisher.
        agent_address: String,
        /// Feed name on that source.
        feed_name: String,
    },
}

/// Parameters of [`Command::Start`], durations in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StartParams {
    /// Segment length.
    pub time_per_file: f64,
    /// Buffering window for engine-buffered feeds.
    pub time_per_frame: f64,
    /// Root directory for segments.
    pub data_dir: String,
}

impl Default for StartParams {
    fn default() -> Self {
        Self {
            time_per_file: DEFAULT_TIME_PER_FILE.as_secs_f64(),
            time_per_frame: DEFAULT_TIME_PER_FRAME.as_secs_f64(),
            data_dir: DEFAULT_DATA_DIR.to_string(),
        }
    }
}

impl StartParams {
    /// Converts the parameters into a validated [`RecorderConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a duration is not a positive number of
    /// seconds or the data directory is empty.
    pub fn into_config(self) -> Result<RecorderConfig> {
        if self.data_dir.is_empty() {
            return Err(ConfigError::EmptyDataDir.into());
        }
        let config = RecorderConfig {
            time_per_file: positive_seconds("time_per_file", self.time_per_file)?,
            time_per_frame: positive_seconds("time_per_frame", self.time_per_frame)?,
            ..RecorderConfig::new(self.data_dir)
        };
        config.validate()?;
        Ok(config)
    }
}

/// Result of a [`Command`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlResponse {
    /// Whether the command took effect.
    pub ok: bool,
    /// Human-readable outcome.
    pub message: String,
}

impl ControlResponse {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}

/// Progress notification from a running aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A new segment was opened.
    SegmentOpened {
        /// Path of the segment.
        path: PathBuf,
    },
    /// A segment was closed with its terminal marker.
    SegmentClosed {
        /// Path of the segment.
        path: PathBuf,
        /// Housekeeping frames written to it.
        frames: u64,
        /// Samples written to it.
        samples: u64,
    },
    /// Flushing a feed failed; its samples are retained.
    FlushFailed {
        /// The feed concerned.
        feed: FeedAddress,
        /// Description of the failure.
        error: String,
    },
    /// Samples without a key were dropped on arrival.
    SamplesRejected {
        /// The feed concerned.
        feed: FeedAddress,
        /// Number of samples dropped.
        count: usize,
    },
    /// The run ended, with the fatal error if there was one.
    Stopped {
        /// Description of the fatal error.
        error: Option<String>,
    },
}

impl Aggregator {
    /// Executes a command and reports its outcome.
    ///
    /// Failures are reported in the response rather than returned; the
    /// aggregator's state is unchanged by a failed command. A stop always
    /// succeeds: if the run had already ended on an error, the message
    /// carries it.
    pub fn handle(&self, command: Command) -> ControlResponse {
        match command {
            Command::Start(params) => {
                let started = params.into_config().and_then(|config| self.start(config));
                match started {
                    Ok(path) => ControlResponse::ok(format!("Recording to {}", path.display())),
                    Err(e) => ControlResponse::failed(e.to_string()),
                }
            }
            Command::Stop => match self.stop() {
                Ok(Some(summary)) => ControlResponse::ok(format!(
                    "Acquisition exited cleanly: {} samples in {} segments",
                    summary.samples,
                    summary.segments.len()
                )),
                Ok(None) => ControlResponse::ok("Acquisition is not running"),
                // The run is over either way; the error is what ended it.
                Err(e) => ControlResponse::ok(format!("Acquisition stopped with error: {e}")),
            },
            Command::Subscribe {
                agent_address,
                feed_name,
            } => match self.subscribe(&agent_address, &feed_name, None) {
                Ok(Subscription::Subscribed(address)) => {
                    ControlResponse::ok(format!("Subscribed to feed {address}"))
                }
                Ok(Subscription::AlreadySubscribed(address)) => {
                    ControlResponse::failed(format!("Already subscribed to feed {address}"))
                }
                Err(e) => ControlResponse::failed(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::error::SegmentError;
    use crate::feed::{FeedMeta, Sample};
    use crate::frame::Frame;
    use crate::segment::{FrameSink, SinkFactory};
    use crate::source::LocalHub;
    use std::io;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_parse_commands() {
        let start: Command =
            serde_json::from_str(r#"{ "command": "start", "time_per_file": 60 }"#).unwrap();
        assert_eq!(
            start,
            Command::Start(StartParams {
                time_per_file: 60.0,
                ..StartParams::default()
            })
        );

        let stop: Command = serde_json::from_str(r#"{ "command": "stop" }"#).unwrap();
        assert_eq!(stop, Command::Stop);

        let subscribe: Command = serde_json::from_str(
            r#"{ "command": "subscribe", "agent_address": "dev1", "feed_name": "therm" }"#,
        )
        .unwrap();
        assert_eq!(
            subscribe,
            Command::Subscribe {
                agent_address: "dev1".to_string(),
                feed_name: "therm".to_string(),
            }
        );

        assert!(serde_json::from_str::<Command>(r#"{ "command": "reboot" }"#).is_err());
    }

    #[test]
    fn test_start_params_defaults() {
        let config = StartParams::default().into_config().unwrap();
        assert_eq!(config.time_per_file, Duration::from_secs(3600));
        assert_eq!(config.time_per_frame, Duration::from_secs(600));
        assert_eq!(config.data_dir, PathBuf::from("data/"));
    }

    #[test]
    fn test_start_params_rejects_bad_durations() {
        for bad in [0.0, -5.0, f64::NAN] {
            let params = StartParams {
                time_per_frame: bad,
                ..StartParams::default()
            };
            assert!(params.into_config().is_err());
        }
        let params = StartParams {
            data_dir: String::new(),
            ..StartParams::default()
        };
        assert!(params.into_config().is_err());
    }

    #[test]
    fn test_command_lifecycle() {
        let dir = TempDir::new().unwrap();
        let hub = LocalHub::new();
        hub.declare_feed(FeedMeta {
            address: FeedAddress::new("dev1", "therm").unwrap(),
            buffered: false,
            buffer_time: None,
        });
        let aggregator = Aggregator::new(Arc::new(hub));

        let subscribe = || Command::Subscribe {
            agent_address: "dev1".to_string(),
            feed_name: "therm".to_string(),
        };
        assert!(aggregator.handle(subscribe()).ok);
        let again = aggregator.handle(subscribe());
        assert!(!again.ok);
        assert_eq!(again.message, "Already subscribed to feed dev1.feeds.therm");

        let bad = aggregator.handle(Command::Start(StartParams {
            time_per_file: -1.0,
            ..StartParams::default()
        }));
        assert!(!bad.ok);

        let started = aggregator.handle(Command::Start(StartParams {
            data_dir: dir.path().display().to_string(),
            ..StartParams::default()
        }));
        assert!(started.ok, "{}", started.message);

        let stopped = aggregator.handle(Command::Stop);
        assert!(stopped.ok);
        assert!(stopped.message.starts_with("Acquisition exited cleanly"));

        let idle = aggregator.handle(Command::Stop);
        assert!(idle.ok);
    }

    struct BrokenSink(PathBuf);

    impl FrameSink for BrokenSink {
        fn write_frame(&mut self, _frame: &Frame) -> Result<()> {
            Err(SegmentError::Write {
                path: self.0.clone(),
                source: io::Error::other("disk full"),
            }
            .into())
        }

        fn finish(&mut self) -> Result<()> {
            Ok(())
        }

        fn path(&self) -> &Path {
            &self.0
        }
    }

    struct BrokenSinks;

    impl SinkFactory for BrokenSinks {
        fn open(&self, path: &Path) -> Result<Box<dyn FrameSink>> {
            Ok(Box::new(BrokenSink(path.to_path_buf())))
        }
    }

    #[test]
    fn test_stop_after_aborted_run_reports_error() {
        let dir = TempDir::new().unwrap();
        let hub = LocalHub::new();
        let address = FeedAddress::new("dev1", "therm").unwrap();
        hub.declare_feed(FeedMeta {
            address: address.clone(),
            buffered: true,
            buffer_time: None,
        });
        let aggregator =
            Aggregator::with_parts(Arc::new(hub.clone()), Arc::new(SystemClock), Arc::new(BrokenSinks));
        aggregator.subscribe("dev1", "therm", None).unwrap();
        let events = aggregator.events();

        let started = aggregator.handle(Command::Start(StartParams {
            data_dir: dir.path().display().to_string(),
            ..StartParams::default()
        }));
        assert!(started.ok, "{}", started.message);
        hub.publish(&address, vec![Sample::new("ch1", 0.0, 1.0)]).unwrap();

        loop {
            let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
            if matches!(event, EngineEvent::Stopped { .. }) {
                break;
            }
        }

        let stopped = aggregator.handle(Command::Stop);
        assert!(stopped.ok);
        assert!(stopped.message.starts_with("Acquisition stopped with error"));
        assert!(stopped.message.contains("disk full"), "{}", stopped.message);

        let idle = aggregator.handle(Command::Stop);
        assert_eq!(idle.message, "Acquisition is not running");
    }

    #[test]
    fn test_event_json() {
        let event = EngineEvent::Stopped { error: None };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "stopped");
    }
}
