//! CLI for the telagg telemetry aggregator.
//!
//! Provides commands for recording synthetic feeds and for inspecting and
//! dumping segment files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, SystemTime};

use clap::{Parser, Subcommand, ValueEnum};
use telagg::config::positive_seconds;
use telagg::{Aggregator, EngineEvent, FeedAddress, FeedMeta, Frame, LocalHub, RecorderConfig, Sample, SegmentReader};
use tracing_subscriber::EnvFilter;

/// telagg: housekeeping telemetry aggregator CLI.
#[derive(Parser)]
#[command(name = "telagg", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Record synthetic in-process feeds until Ctrl-C or a duration elapses.
    Record {
        /// JSON recorder configuration; flags override its values.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Root directory for segment files.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Segment length in seconds.
        #[arg(long)]
        time_per_file: Option<f64>,

        /// Buffering window for engine-buffered feeds, in seconds.
        #[arg(long)]
        time_per_frame: Option<f64>,

        /// Stop after this long (e.g., "30s", "5m", "1h").
        #[arg(long)]
        duration: Option<String>,

        /// Number of synthetic feeds.
        #[arg(long, default_value = "3")]
        feeds: u32,

        /// Publish rate per feed in Hz.
        #[arg(long, default_value = "10")]
        rate: f64,

        /// Mark the synthetic feeds as self-buffered.
        #[arg(long)]
        self_buffered: bool,
    },

    /// Summarize a segment file: frames, feeds, keys, terminal marker.
    Inspect {
        /// Path to the segment file.
        segment: PathBuf,
    },

    /// Print every sample in a segment file.
    Dump {
        /// Path to the segment file.
        segment: PathBuf,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },
}

/// Output format for dumped samples.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Comma-separated values.
    Csv,
    /// JSON array of objects.
    Json,
}

/// Overrides from the `record` command line.
struct RecordArgs {
    config: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    time_per_file: Option<f64>,
    time_per_frame: Option<f64>,
    duration: Option<String>,
    feeds: u32,
    rate: f64,
    self_buffered: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Record {
            config,
            data_dir,
            time_per_file,
            time_per_frame,
            duration,
            feeds,
            rate,
            self_buffered,
        } => cmd_record(RecordArgs {
            config,
            data_dir,
            time_per_file,
            time_per_frame,
            duration,
            feeds,
            rate,
            self_buffered,
        }),
        Commands::Inspect { segment } => cmd_inspect(&segment),
        Commands::Dump { segment, format } => cmd_dump(&segment, &format),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Builds the recorder configuration from an optional file and flags.
fn load_config(args: &RecordArgs) -> Result<RecorderConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => {
            let data = std::fs::read_to_string(path)
                .map_err(|e| format!("cannot read config '{}': {e}", path.display()))?;
            RecorderConfig::from_json(&data)?
        }
        None => RecorderConfig::default(),
    };

    if let Some(dir) = &args.data_dir {
        config.data_dir.clone_from(dir);
    }
    if let Some(secs) = args.time_per_file {
        config.time_per_file = positive_seconds("time_per_file", secs)?;
    }
    if let Some(secs) = args.time_per_frame {
        config.time_per_frame = positive_seconds("time_per_frame", secs)?;
    }
    config.validate()?;
    Ok(config)
}

/// Interval between two publishes of one feed at `rate` Hz.
fn publish_period(rate: f64) -> Result<Duration, Box<dyn std::error::Error>> {
    if !(rate.is_finite() && rate > 0.0) {
        return Err(format!("rate must be a positive number, got {rate}").into());
    }
    Duration::try_from_secs_f64(1.0 / rate).map_err(|e| format!("rate {rate} is too low: {e}").into())
}

/// Implements `telagg record`.
fn cmd_record(args: RecordArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&args)?;
    let duration = args.duration.as_deref().map(parse_duration).transpose()?;
    let period = publish_period(args.rate)?;

    let hub = LocalHub::new();
    let aggregator = Aggregator::new(Arc::new(hub.clone()));

    let mut addresses = Vec::with_capacity(args.feeds as usize);
    for i in 0..args.feeds {
        let address = FeedAddress::new("synthetic", &format!("feed{i}"))?;
        hub.declare_feed(FeedMeta {
            address: address.clone(),
            buffered: args.self_buffered,
            buffer_time: None,
        });
        aggregator.subscribe(address.source(), address.feed(), None)?;
        addresses.push(address);
    }

    let events = aggregator.events();
    let reporter = thread::spawn(move || {
        for event in events {
            match event {
                EngineEvent::SegmentOpened { path } => println!("opened  {}", path.display()),
                EngineEvent::SegmentClosed {
                    path,
                    frames,
                    samples,
                } => println!("closed  {} ({frames} frames, {samples} samples)", path.display()),
                EngineEvent::FlushFailed { feed, error } => eprintln!("flush of {feed} failed: {error}"),
                EngineEvent::SamplesRejected { feed, count } => {
                    eprintln!("dropped {count} samples without a key from {feed}");
                }
                EngineEvent::Stopped { error: Some(error) } => eprintln!("stopped: {error}"),
                EngineEvent::Stopped { error: None } => {}
            }
        }
    });

    aggregator.start(config)?;

    let running = Arc::new(AtomicBool::new(true));
    let producers: Vec<_> = addresses
        .into_iter()
        .enumerate()
        .map(|(i, address)| {
            let hub = hub.clone();
            let running = Arc::clone(&running);
            thread::spawn(move || produce(&hub, &address, i, period, &running))
        })
        .collect();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        match duration {
            Some(duration) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
                    () = tokio::time::sleep(duration) => tracing::info!("duration elapsed"),
                }
            }
            None => {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::warn!("cannot listen for Ctrl-C: {e}");
                }
            }
        }
    });

    running.store(false, Ordering::SeqCst);
    for producer in producers {
        if producer.join().is_err() {
            tracing::warn!("producer thread panicked");
        }
    }

    let summary = aggregator.stop()?;
    drop(aggregator);
    if reporter.join().is_err() {
        tracing::warn!("event reporter panicked");
    }

    if let Some(summary) = summary {
        println!();
        println!("Segments: {}", summary.segments.len());
        println!("Frames:   {}", summary.frames);
        println!("Samples:  {}", summary.samples);
    }
    Ok(())
}

/// Publishes a slow sinusoid on four channels until `running` clears.
#[allow(clippy::cast_precision_loss)] // Synthetic values only
fn produce(hub: &LocalHub, address: &FeedAddress, index: usize, period: Duration, running: &AtomicBool) {
    let phase = index as f64;
    while running.load(Ordering::SeqCst) {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        let samples = (0..4)
            .map(|ch| {
                let value = (now / 60.0 + phase + f64::from(ch)).sin();
                Sample::new(format!("ch{ch}"), now, value)
            })
            .collect();
        if let Err(e) = hub.publish(address, samples) {
            tracing::warn!("publish to {address} failed: {e}");
            return;
        }
        thread::sleep(period);
    }
}

/// Per-key statistics gathered by `inspect`.
#[derive(Default)]
struct KeyStats {
    samples: usize,
    first: Option<f64>,
    last: Option<f64>,
}

/// Implements `telagg inspect <segment>`.
fn cmd_inspect(segment: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let reader = SegmentReader::open(segment)?;

    let mut frames = 0usize;
    let mut terminated = false;
    let mut feeds: BTreeMap<String, BTreeMap<String, KeyStats>> = BTreeMap::new();

    for frame in reader.frames() {
        match frame? {
            Frame::Housekeeping(hk) => {
                frames += 1;
                let keys = feeds
                    .entry(format!("{}.feeds.{}", hk.agent_address, hk.feed))
                    .or_default();
                for sample in hk.samples() {
                    let stats = keys.entry(sample.key).or_default();
                    stats.samples += 1;
                    stats.first = Some(stats.first.map_or(sample.timestamp, |t| t.min(sample.timestamp)));
                    stats.last = Some(stats.last.map_or(sample.timestamp, |t| t.max(sample.timestamp)));
                }
            }
            Frame::EndProcessing => terminated = true,
        }
    }

    println!("Segment: {}", segment.display());
    println!("  Housekeeping frames: {frames}");
    println!("  Terminal marker: {}", if terminated { "present" } else { "missing" });
    println!("  Feeds: {}", feeds.len());
    for (feed, keys) in &feeds {
        println!();
        println!("  {feed}");
        for (key, stats) in keys {
            let span = match (stats.first, stats.last) {
                (Some(first), Some(last)) => format!("{first:.3} .. {last:.3}"),
                _ => "-".to_string(),
            };
            println!("    {key}: {} samples, t={span}", stats.samples);
        }
    }

    Ok(())
}

/// Implements `telagg dump <segment>`.
fn cmd_dump(segment: &Path, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let reader = SegmentReader::open(segment)?;

    let mut rows = Vec::new();
    for frame in reader.frames() {
        if let Frame::Housekeeping(hk) = frame? {
            let feed = format!("{}.feeds.{}", hk.agent_address, hk.feed);
            rows.extend(hk.samples().map(|sample| (feed.clone(), sample)));
        }
    }

    match format {
        OutputFormat::Csv => {
            println!("feed,key,timestamp,value");
            for (feed, sample) in &rows {
                println!("{feed},{},{},{}", sample.key, sample.timestamp, sample.value);
            }
        }
        OutputFormat::Json => {
            let data: Vec<serde_json::Value> = rows
                .iter()
                .map(|(feed, sample)| {
                    serde_json::json!({
                        "feed": feed,
                        "key": sample.key,
                        "timestamp": sample.timestamp,
                        "value": sample.value,
                    })
                })
                .collect();

            let output = serde_json::json!({
                "segment": segment.display().to_string(),
                "count": rows.len(),
                "data": data,
            });

            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Parses a human-readable duration string (e.g., "30s", "5m", "1h", "7d").
fn parse_duration(s: &str) -> Result<Duration, Box<dyn std::error::Error>> {
    let s = s.trim();
    if s.is_empty() {
        return Err("Empty duration string".into());
    }

    let Some((split, unit)) = s.char_indices().last() else {
        return Err("Empty duration string".into());
    };
    let num: u64 = s[..split].parse()?;

    let scale = match unit {
        's' => 1,
        'm' => 60,
        'h' => 3600,
        'd' => 86400,
        _ => return Err(format!("Unknown duration unit: '{unit}'. Use s, m, h, or d.").into()),
    };
    let secs = num
        .checked_mul(scale)
        .ok_or_else(|| format!("Duration too large: '{s}'"))?;

    Ok(Duration::from_secs(secs))
}
