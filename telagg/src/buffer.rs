//! Per-feed sample buffers.
//!
//! A [`FeedBuffer`] holds the samples a feed delivered since its last
//! successful flush, together with the time its first sample arrived.
//! Flushing hands the samples to a writer closure and clears the buffer only
//! when the writer succeeds, so a sink that refuses a frame loses nothing
//! until the owner gives up on the buffer with [`FeedBuffer::take`].
//!
//! The buffer itself is not synchronised; the engine keeps each feed's
//! buffer behind its own mutex.

use std::time::{Duration, SystemTime};

use crate::clock::elapsed;
use crate::error::Result;
use crate::feed::Sample;

/// Samples of one feed awaiting serialization.
#[derive(Debug, Default)]
pub struct FeedBuffer {
    samples: Vec<Sample>,
    start: Option<SystemTime>,
    retry: bool,
}

impl FeedBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the buffer holds no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Number of buffered samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// The buffered samples in arrival order.
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Arrival time of the first sample since the last flush.
    pub fn start_time(&self) -> Option<SystemTime> {
        self.start
    }

    /// Returns true if the last flush attempt failed and the samples are
    /// still waiting to be written.
    pub fn needs_retry(&self) -> bool {
        self.retry && !self.samples.is_empty()
    }

    /// Returns true if more than `window` has passed since the first
    /// buffered sample arrived.
    pub fn window_elapsed(&self, now: SystemTime, window: Duration) -> bool {
        match self.start {
            Some(start) if !self.samples.is_empty() => elapsed(now, start) > window,
            _ => false,
        }
    }

    /// Appends samples that arrived at `now`.
    pub fn append(&mut self, samples: impl IntoIterator<Item = Sample>, now: SystemTime) {
        if self.samples.is_empty() {
            self.start = Some(now);
        }
        self.samples.extend(samples);
    }

    /// Empties the buffer and returns the samples it held.
    pub fn take(&mut self) -> Vec<Sample> {
        self.start = None;
        self.retry = false;
        std::mem::take(&mut self.samples)
    }

    /// Hands the buffered samples to `write` and clears the buffer if it
    /// succeeds.
    ///
    /// Empty buffers are skipped without calling `write`. Returns the number
    /// of samples flushed.
    ///
    /// # Errors
    ///
    /// Returns the writer's error. The samples stay buffered and the buffer
    /// is marked for retry.
    pub fn flush_with<F>(&mut self, write: F) -> Result<usize>
    where
        F: FnOnce(&[Sample]) -> Result<()>,
    {
        if self.samples.is_empty() {
            return Ok(0);
        }

        match write(&self.samples) {
            Ok(()) => {
                let n = self.samples.len();
                self.samples.clear();
                self.start = None;
                self.retry = false;
                Ok(n)
            }
            Err(e) => {
                self.retry = true;
                Err(e)
            }
        }
    }

    /// Accumulates samples of an engine-buffered feed.
    ///
    /// If the buffer's window has been exceeded, the buffer is flushed before
    /// the new samples are appended, and the new samples start the next
    /// window. If that flush fails the new samples are appended behind the
    /// retained ones.
    ///
    /// # Errors
    ///
    /// Returns the writer's error if the window flush failed.
    pub fn push_windowed<F>(
        &mut self,
        samples: Vec<Sample>,
        now: SystemTime,
        window: Duration,
        write: F,
    ) -> Result<usize>
    where
        F: FnOnce(&[Sample]) -> Result<()>,
    {
        let flushed = if self.window_elapsed(now, window) {
            self.flush_with(write)
        } else {
            Ok(0)
        };
        self.append(samples, now);
        flushed
    }

    /// Writes the samples of a self-buffered feed immediately.
    ///
    /// Samples retained from an earlier failed flush are written first, in
    /// the same frame.
    ///
    /// # Errors
    ///
    /// Returns the writer's error; all samples stay buffered for retry.
    pub fn push_immediate<F>(&mut self, samples: Vec<Sample>, now: SystemTime, write: F) -> Result<usize>
    where
        F: FnOnce(&[Sample]) -> Result<()>,
    {
        self.append(samples, now);
        self.flush_with(write)
    }
}
