//! The aggregation engine.
//!
//! [`Aggregator`] ties the pieces together:
//!
//! - **Subscription registry**: one slot per subscribed feed address. The
//!   handler registered with the [`FeedSource`] closes over its slot, so
//!   deliveries never look anything up.
//! - **Buffer engine**: every delivery is either written immediately
//!   (self-buffered feeds) or accumulated until the feed's window is
//!   exceeded.
//! - **Rotation controller**: a single control thread owns the segment
//!   lifecycle. It rotates every `time_per_file` and performs the final
//!   flush on stop.
//!
//! # Concurrency
//!
//! Each feed's buffer has its own mutex; the open segment sits behind one
//! more. Locks are always taken in the order feed buffer, then segment. The
//! running flag is read while holding the feed's buffer lock, so a stop that
//! clears the flag and then flushes every buffer sees every sample that was
//! accepted, and nothing accepted afterwards.
//!
//! # Failures
//!
//! A sink that reports
//! [`SegmentError::Unavailable`](crate::error::SegmentError::Unavailable)
//! keeps the feed's samples buffered and the control thread retries them
//! every tick. Any other segment error ends the run. Samples without a key are dropped on
//! arrival, and whatever is still buffered when a run ends is discarded and
//! reported by [`Aggregator::stop`].
//!
//! Flushes have no timeout. A sink that blocks forever stalls the control
//! thread, and with it rotation and stop.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use telagg::config::RecorderConfig;
//! use telagg::engine::Aggregator;
//! use telagg::feed::{FeedAddress, FeedMeta, Sample};
//! use telagg::source::LocalHub;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let hub = LocalHub::new();
//! let address = FeedAddress::new("dev1", "therm")?;
//! hub.declare_feed(FeedMeta { address: address.clone(), buffered: false, buffer_time: None });
//!
//! let aggregator = Aggregator::new(Arc::new(hub.clone()));
//! aggregator.subscribe("dev1", "therm", None)?;
//! let first = aggregator.start(RecorderConfig::new("./data"))?;
//! println!("recording to {}", first.display());
//!
//! hub.publish(&address, vec![Sample::new("ch1", 1_700_000_000.0, 4.2)])?;
//!
//! aggregator.stop()?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use crate::buffer::FeedBuffer;
use crate::clock::{Clock, SystemClock, elapsed};
use crate::config::{DEFAULT_TIME_PER_FRAME, RecorderConfig};
use crate::control::EngineEvent;
use crate::error::{EngineError, Result, TelaggError};
use crate::feed::{BufferPolicy, Delivery, FeedAddress, Sample};
use crate::frame::Frame;
use crate::segment::{FileSinkFactory, FrameSink, SinkFactory, prepare_segment_path};
use crate::source::{DiscoveryAction, DiscoveryEvent, DiscoverySource, FeedSource, SubscriptionHandle};

/// Whether the engine accepts samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No run in progress; deliveries are dropped.
    Idle,
    /// A run is in progress with exactly one open segment.
    Running,
}

/// State of the rotation controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    /// No segment open.
    Stopped,
    /// Writing to the current segment.
    Recording,
    /// Flushing and closing the current segment before opening the next.
    Rotating,
}

/// Outcome of a subscription request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subscription {
    /// A new subscription was registered.
    Subscribed(FeedAddress),
    /// The feed was already subscribed; nothing changed.
    AlreadySubscribed(FeedAddress),
}

impl Subscription {
    /// The feed address concerned.
    pub fn address(&self) -> &FeedAddress {
        match self {
            Self::Subscribed(address) | Self::AlreadySubscribed(address) => address,
        }
    }
}

/// What a finished run wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Segments written, in order.
    pub segments: Vec<PathBuf>,
    /// Housekeeping frames written across all segments.
    pub frames: u64,
    /// Samples written across all segments.
    pub samples: u64,
}

/// A subscribed feed and its buffer.
struct FeedSlot {
    address: FeedAddress,
    policy: Option<BufferPolicy>,
    buffer: Mutex<FeedBuffer>,
    handle: Mutex<Option<SubscriptionHandle>>,
}

/// The segment currently receiving frames.
struct OpenSegment {
    sink: Box<dyn FrameSink>,
    start: SystemTime,
    frames: u64,
    samples: u64,
}

/// A closed segment's totals.
struct ClosedSegment {
    path: PathBuf,
    frames: u64,
    samples: u64,
}

/// State shared between feed handlers and the control thread.
struct Shared {
    source: Arc<dyn FeedSource>,
    clock: Arc<dyn Clock>,
    sinks: Arc<dyn SinkFactory>,
    running: AtomicBool,
    state: Mutex<RecorderState>,
    feeds: RwLock<HashMap<FeedAddress, Arc<FeedSlot>>>,
    segment: Mutex<Option<OpenSegment>>,
    frame_window: RwLock<Duration>,
    fault: Mutex<Option<String>>,
    listeners: Mutex<Vec<Sender<EngineEvent>>>,
}

/// Handle on the running control thread.
struct Control {
    stop: Sender<()>,
    thread: JoinHandle<Result<RunSummary>>,
}

/// The telemetry aggregator.
///
/// All methods take `&self`; an `Aggregator` can be shared between the
/// command layer and discovery callbacks behind an `Arc`.
pub struct Aggregator {
    shared: Arc<Shared>,
    control: Mutex<Option<Control>>,
    discovery: Mutex<Vec<SubscriptionHandle>>,
}

impl Aggregator {
    /// Creates an idle aggregator subscribing through `source`, writing
    /// segment files and reading the system clock.
    pub fn new(source: Arc<dyn FeedSource>) -> Self {
        Self::with_parts(source, Arc::new(SystemClock), Arc::new(FileSinkFactory))
    }

    /// Creates an idle aggregator with an explicit clock and sink factory.
    pub fn with_parts(
        source: Arc<dyn FeedSource>,
        clock: Arc<dyn Clock>,
        sinks: Arc<dyn SinkFactory>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                source,
                clock,
                sinks,
                running: AtomicBool::new(false),
                state: Mutex::new(RecorderState::Stopped),
                feeds: RwLock::new(HashMap::new()),
                segment: Mutex::new(None),
                frame_window: RwLock::new(DEFAULT_TIME_PER_FRAME),
                fault: Mutex::new(None),
                listeners: Mutex::new(Vec::new()),
            }),
            control: Mutex::new(None),
            discovery: Mutex::new(Vec::new()),
        }
    }

    /// Subscribes to `feed_name` on `source_addr`.
    ///
    /// `policy` pins the feed's buffering policy; `None` takes it from the
    /// metadata delivered with each batch. Subscribing to a feed that is
    /// already subscribed is a no-op reported as
    /// [`Subscription::AlreadySubscribed`].
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a malformed address, or the feed
    /// source's error if it refuses the subscription. Nothing is recorded
    /// in either case.
    pub fn subscribe(
        &self,
        source_addr: &str,
        feed_name: &str,
        policy: Option<BufferPolicy>,
    ) -> Result<Subscription> {
        Shared::subscribe(&self.shared, source_addr, feed_name, policy)
    }

    /// Watches `discovery` and subscribes every announced feed that asks to
    /// be aggregated, with the policy it advertises.
    ///
    /// # Errors
    ///
    /// Returns the discovery source's error if the watch cannot be set up.
    pub fn attach_discovery(&self, discovery: &dyn DiscoverySource) -> Result<()> {
        let shared = Arc::downgrade(&self.shared);
        let handle = discovery.watch(Box::new(move |event: DiscoveryEvent| {
            if let Some(shared) = shared.upgrade() {
                Shared::on_discovery(&shared, &event);
            }
        }))?;
        lock(&self.discovery).push(handle);
        Ok(())
    }

    /// Addresses of all subscribed feeds, sorted.
    pub fn subscribed_feeds(&self) -> Vec<FeedAddress> {
        let mut feeds: Vec<_> = read(&self.shared.feeds).keys().cloned().collect();
        feeds.sort();
        feeds
    }

    /// Samples currently buffered for a feed, or `None` if not subscribed.
    pub fn buffered(&self, address: &FeedAddress) -> Option<Vec<Sample>> {
        let slot = read(&self.shared.feeds).get(address).cloned()?;
        let samples = lock(&slot.buffer).samples().to_vec();
        Some(samples)
    }

    /// Returns a receiver of progress notifications.
    pub fn events(&self) -> Receiver<EngineEvent> {
        let (tx, rx) = mpsc::channel();
        lock(&self.shared.listeners).push(tx);
        rx
    }

    /// Whether a run is in progress.
    pub fn state(&self) -> EngineState {
        if self.shared.running.load(Ordering::SeqCst) {
            EngineState::Running
        } else {
            EngineState::Idle
        }
    }

    /// State of the rotation controller.
    pub fn recorder_state(&self) -> RecorderState {
        *lock(&self.shared.state)
    }

    /// Path of the open segment, if any.
    pub fn current_segment(&self) -> Option<PathBuf> {
        lock(&self.shared.segment)
            .as_ref()
            .map(|open| open.sink.path().to_path_buf())
    }

    /// Starts a recording run and returns the first segment's path.
    ///
    /// The first segment is opened before this returns; the control thread
    /// then rotates segments every `config.time_per_file`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an invalid config,
    /// [`EngineError::AlreadyRunning`] if a run is in progress, or the
    /// segment error if the first segment cannot be opened. The engine stays
    /// idle on error.
    pub fn start(&self, config: RecorderConfig) -> Result<PathBuf> {
        config.validate()?;

        let mut control = lock(&self.control);
        if let Some(previous) = control.take() {
            if !previous.thread.is_finished() {
                *control = Some(previous);
                return Err(EngineError::AlreadyRunning.into());
            }
            if let Err(e) = join_control(previous) {
                tracing::warn!("previous run ended with error: {e}");
            }
        }

        let shared = &self.shared;
        lock(&shared.fault).take();
        *write(&shared.frame_window) = config.time_per_frame;

        let path = shared.open_segment(&config.data_dir)?;
        shared.running.store(true, Ordering::SeqCst);
        shared.set_state(RecorderState::Recording);
        tracing::info!("starting data aggregation in directory {}", config.data_dir.display());
        shared.emit(EngineEvent::SegmentOpened { path: path.clone() });

        let (stop_tx, stop_rx) = mpsc::channel();
        let thread_shared = Arc::clone(shared);
        let first = path.clone();
        let spawned = std::thread::Builder::new()
            .name("telagg-control".to_string())
            .spawn(move || control_loop(&thread_shared, &config, &Ticker::new(stop_rx, config.tick), first));

        match spawned {
            Ok(thread) => {
                *control = Some(Control {
                    stop: stop_tx,
                    thread,
                });
                Ok(path)
            }
            Err(e) => {
                shared.running.store(false, Ordering::SeqCst);
                if let Err(close) = shared.close_segment() {
                    tracing::error!("failed to close segment after spawn failure: {close}");
                }
                shared.set_state(RecorderState::Stopped);
                Err(EngineError::Spawn(e).into())
            }
        }
    }

    /// Stops the current run: flushes every buffer, closes the segment and
    /// returns what the run wrote.
    ///
    /// Deliveries arriving after this is called are dropped. Returns
    /// `Ok(None)` if no run is in progress.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::RunAborted`] if the run had already ended on a
    /// fatal error (reported once), the error hit while closing, or
    /// [`EngineError::Unflushed`] if some buffers could not be written.
    /// Unwritten samples are discarded either way.
    pub fn stop(&self) -> Result<Option<RunSummary>> {
        let Some(control) = lock(&self.control).take() else {
            return Ok(None);
        };

        self.shared.running.store(false, Ordering::SeqCst);
        // The thread may already have exited on a fault; then there is no
        // receiver and joining returns its error.
        let _ = control.stop.send(());
        join_control(control).map(Some)
    }
}

impl Drop for Aggregator {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!("aggregator dropped with failed run: {e}");
        }
        lock(&self.discovery).clear();
        // Dropping the subscription handles detaches the handlers, which
        // hold the only other references to the feed slots.
        let slots: Vec<_> = write(&self.shared.feeds).drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            lock(&slot.handle).take();
        }
    }
}

fn join_control(control: Control) -> Result<RunSummary> {
    control
        .thread
        .join()
        .map_err(|_| TelaggError::from(EngineError::ControlPanicked))?
}

impl Shared {
    fn subscribe(
        this: &Arc<Self>,
        source_addr: &str,
        feed_name: &str,
        policy: Option<BufferPolicy>,
    ) -> Result<Subscription> {
        let address = FeedAddress::new(source_addr, feed_name)?;
        let slot = Arc::new(FeedSlot {
            address: address.clone(),
            policy,
            buffer: Mutex::new(FeedBuffer::new()),
            handle: Mutex::new(None),
        });

        {
            let mut feeds = write(&this.feeds);
            if feeds.contains_key(&address) {
                tracing::info!("already subscribed to feed {address}");
                return Ok(Subscription::AlreadySubscribed(address));
            }
            feeds.insert(address.clone(), Arc::clone(&slot));
        }

        let shared: Weak<Self> = Arc::downgrade(this);
        let target = Arc::clone(&slot);
        let handler = Box::new(move |delivery: Delivery| {
            if let Some(shared) = shared.upgrade() {
                shared.ingest(&target, delivery);
            }
        });

        match this.source.subscribe(source_addr, feed_name, handler) {
            Ok(handle) => {
                *lock(&slot.handle) = Some(handle);
                tracing::info!("subscribed to feed {address}");
                Ok(Subscription::Subscribed(address))
            }
            Err(e) => {
                write(&this.feeds).remove(&address);
                tracing::warn!("subscription to feed {address} failed: {e}");
                Err(e)
            }
        }
    }

    fn on_discovery(this: &Arc<Self>, event: &DiscoveryEvent) {
        if event.action == DiscoveryAction::Removed {
            return;
        }

        for feed in event.source.feeds.iter().filter(|feed| feed.aggregate) {
            let policy = if feed.buffered {
                BufferPolicy::SelfBuffered
            } else {
                BufferPolicy::Windowed(feed.buffer_time)
            };
            if let Err(e) = Self::subscribe(this, &event.source.address, &feed.feed_name, Some(policy)) {
                tracing::warn!(
                    "could not subscribe to announced feed {}.feeds.{}: {e}",
                    event.source.address,
                    feed.feed_name
                );
            }
        }
    }

    /// Handles one delivery on a subscribed feed.
    fn ingest(&self, slot: &FeedSlot, delivery: Delivery) {
        let mut buffer = lock(&slot.buffer);
        if !self.running.load(Ordering::SeqCst) {
            return;
        }

        let now = self.clock.now();
        let policy = slot.policy.unwrap_or_else(|| delivery.meta.policy());
        let window = policy.window(*read(&self.frame_window));

        // A keyless sample can never be framed; keep it out of the buffer so
        // the feed's other samples still flush.
        let (samples, keyless): (Vec<Sample>, Vec<Sample>) = delivery
            .samples
            .into_iter()
            .partition(|sample| !sample.key.is_empty());
        if !keyless.is_empty() {
            tracing::warn!("dropping {} samples without a key from feed {}", keyless.len(), slot.address);
            self.emit(EngineEvent::SamplesRejected {
                feed: slot.address.clone(),
                count: keyless.len(),
            });
        }
        if samples.is_empty() {
            return;
        }

        let sink = |samples: &[Sample]| self.write_samples(&slot.address, samples);
        let result = match window {
            None => buffer.push_immediate(samples, now, sink),
            Some(window) => buffer.push_windowed(samples, now, window, sink),
        };

        match result {
            Ok(0) => {}
            Ok(n) => tracing::debug!("wrote {n} samples of feed {} to frame", slot.address),
            Err(e) => self.flush_failed(&slot.address, &e),
        }
    }

    /// Serializes samples into a frame and writes it to the open segment.
    fn write_samples(&self, address: &FeedAddress, samples: &[Sample]) -> Result<()> {
        let frame = Frame::housekeeping(address, samples)?;
        let mut segment = lock(&self.segment);
        let Some(open) = segment.as_mut() else {
            return Err(EngineError::NoOpenSegment.into());
        };
        open.sink.write_frame(&frame)?;
        open.frames += 1;
        open.samples += samples.len() as u64;
        Ok(())
    }

    fn flush_failed(&self, address: &FeedAddress, error: &TelaggError) {
        tracing::warn!("flush of feed {address} failed, keeping buffer: {error}");
        if error.is_fatal() {
            let mut fault = lock(&self.fault);
            if fault.is_none() {
                *fault = Some(error.to_string());
            }
        }
        self.emit(EngineEvent::FlushFailed {
            feed: address.clone(),
            error: error.to_string(),
        });
    }

    fn slots(&self) -> Vec<Arc<FeedSlot>> {
        read(&self.feeds).values().cloned().collect()
    }

    /// Flushes every non-empty buffer into the open segment.
    fn flush_all(&self) {
        for slot in self.slots() {
            let result = lock(&slot.buffer)
                .flush_with(|samples| self.write_samples(&slot.address, samples));
            match result {
                Ok(0) => {}
                Ok(n) => tracing::debug!("flushed {n} samples of feed {}", slot.address),
                Err(e) => self.flush_failed(&slot.address, &e),
            }
        }
    }

    /// Retries buffers whose last flush failed.
    fn retry_pending(&self) {
        for slot in self.slots() {
            let mut buffer = lock(&slot.buffer);
            if !buffer.needs_retry() {
                continue;
            }
            match buffer.flush_with(|samples| self.write_samples(&slot.address, samples)) {
                Ok(n) => tracing::info!("retried flush of feed {} wrote {n} samples", slot.address),
                Err(e) => tracing::debug!("retry of feed {} failed again: {e}", slot.address),
            }
        }
    }

    /// Opens a new segment under `data_dir` and makes it current.
    fn open_segment(&self, data_dir: &Path) -> Result<PathBuf> {
        let start = self.clock.now();
        let path = prepare_segment_path(data_dir, start)?;
        let sink = self.sinks.open(&path)?;
        tracing::info!("creating file: {}", path.display());

        let previous = lock(&self.segment).replace(OpenSegment {
            sink,
            start,
            frames: 0,
            samples: 0,
        });
        if let Some(previous) = previous {
            // Callers close the current segment first; finish a stray one
            // rather than leaking it unterminated.
            self.finish(previous)?;
        }
        Ok(path)
    }

    /// Writes the terminal marker of the open segment and drops it.
    fn close_segment(&self) -> Result<Option<ClosedSegment>> {
        let Some(open) = lock(&self.segment).take() else {
            return Ok(None);
        };
        self.finish(open).map(Some)
    }

    fn finish(&self, mut open: OpenSegment) -> Result<ClosedSegment> {
        let path = open.sink.path().to_path_buf();
        open.sink.finish()?;
        tracing::info!("closing file: {}", path.display());
        self.emit(EngineEvent::SegmentClosed {
            path: path.clone(),
            frames: open.frames,
            samples: open.samples,
        });
        Ok(ClosedSegment {
            path,
            frames: open.frames,
            samples: open.samples,
        })
    }

    fn segment_age(&self) -> Option<Duration> {
        let start = lock(&self.segment).as_ref()?.start;
        Some(elapsed(self.clock.now(), start))
    }

    /// Flushes all buffers into the current segment, closes it and opens
    /// the next one.
    fn rotate(&self, data_dir: &Path, summary: &mut RunSummary) -> Result<()> {
        self.set_state(RecorderState::Rotating);
        self.flush_all();
        let fault = lock(&self.fault).clone();
        if let Some(reason) = fault {
            return Err(EngineError::RunAborted { reason }.into());
        }

        let start = self.clock.now();
        let path = prepare_segment_path(data_dir, start)?;
        let sink = self.sinks.open(&path)?;
        tracing::info!("creating file: {}", path.display());

        let previous = lock(&self.segment).replace(OpenSegment {
            sink,
            start,
            frames: 0,
            samples: 0,
        });
        if let Some(previous) = previous {
            let closed = self.finish(previous)?;
            summary.frames += closed.frames;
            summary.samples += closed.samples;
        }
        summary.segments.push(path.clone());

        self.set_state(RecorderState::Recording);
        self.emit(EngineEvent::SegmentOpened { path });
        Ok(())
    }

    /// Ends the run: flushes what it can, closes the segment and reports.
    fn finish_run(&self, mut summary: RunSummary, error: Option<TelaggError>) -> Result<RunSummary> {
        self.running.store(false, Ordering::SeqCst);
        self.flush_all();

        let closed = self.close_segment();
        let unflushed = self.discard_unflushed();
        self.set_state(RecorderState::Stopped);

        let error = match (error, closed) {
            (Some(e), Err(close)) => {
                tracing::error!("failed to close segment: {close}");
                Some(e)
            }
            (Some(e), Ok(closed)) => {
                summary.add(closed);
                Some(e)
            }
            (None, Err(close)) => Some(close),
            (None, Ok(closed)) => {
                summary.add(closed);
                let fault = lock(&self.fault).take();
                fault
                    .map(|reason| EngineError::RunAborted { reason }.into())
                    .or(unflushed)
            }
        };

        self.emit(EngineEvent::Stopped {
            error: error.as_ref().map(ToString::to_string),
        });
        match error {
            Some(e) => {
                tracing::error!("aggregation stopped: {e}");
                Err(e)
            }
            None => {
                tracing::info!("aggregation exited cleanly");
                Ok(summary)
            }
        }
    }

    /// Empties every buffer the final flush could not write.
    ///
    /// Runs after the segment is closed; the samples are reported rather
    /// than carried into the next run.
    fn discard_unflushed(&self) -> Option<TelaggError> {
        let mut feeds = 0;
        let mut samples = 0;
        for slot in self.slots() {
            let lost = lock(&slot.buffer).take();
            if !lost.is_empty() {
                tracing::error!("{} samples of feed {} were never written", lost.len(), slot.address);
                feeds += 1;
                samples += lost.len();
            }
        }
        (samples > 0).then(|| EngineError::Unflushed { feeds, samples }.into())
    }

    fn set_state(&self, state: RecorderState) {
        *lock(&self.state) = state;
    }

    fn emit(&self, event: EngineEvent) {
        lock(&self.listeners).retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl RunSummary {
    fn add(&mut self, closed: Option<ClosedSegment>) {
        if let Some(closed) = closed {
            self.frames += closed.frames;
            self.samples += closed.samples;
        }
    }
}

/// Periodic timer for the control loop that doubles as its stop signal.
struct Ticker {
    stop: Receiver<()>,
    period: Duration,
}

enum Tick {
    Elapsed,
    Stop,
}

impl Ticker {
    fn new(stop: Receiver<()>, period: Duration) -> Self {
        Self { stop, period }
    }

    /// Blocks for one period, or until a stop is requested.
    fn wait(&self) -> Tick {
        match self.stop.recv_timeout(self.period) {
            Err(RecvTimeoutError::Timeout) => Tick::Elapsed,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => Tick::Stop,
        }
    }
}

/// Body of the control thread.
fn control_loop(
    shared: &Shared,
    config: &RecorderConfig,
    ticker: &Ticker,
    first: PathBuf,
) -> Result<RunSummary> {
    let mut summary = RunSummary {
        segments: vec![first],
        ..RunSummary::default()
    };

    loop {
        if let Tick::Stop = ticker.wait() {
            return shared.finish_run(summary, None);
        }

        let fault = lock(&shared.fault).take();
        if let Some(reason) = fault {
            return shared.finish_run(summary, Some(EngineError::RunAborted { reason }.into()));
        }

        shared.retry_pending();

        let due = shared
            .segment_age()
            .is_none_or(|age| age > config.time_per_file);
        if !due {
            continue;
        }
        if let Err(e) = shared.rotate(&config.data_dir, &mut summary) {
            lock(&shared.fault).take();
            return shared.finish_run(summary, Some(e));
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}
