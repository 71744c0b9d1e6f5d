//! Segment files: time-bounded containers of frames.
//!
//! # File Layout
//!
//! ```text
//! data_dir/
//! ├── 17000/                       <- first five digits of the Unix start time
//! │   ├── 2023-11-14-22-13-20.seg  <- UTC start time of the segment
//! │   └── 2023-11-14-23-13-20.seg
//! └── 17001/
//!     └── ...
//! ```
//!
//! # File Format
//!
//! ```text
//! [0..4)   Magic bytes "TLAG"
//! [4..8)   Format version (u32 LE)
//! [8..)    Frames: u32 LE body length, then the frame as JSON
//! ```
//!
//! A cleanly closed segment ends with an [`Frame::EndProcessing`] frame.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use memmap2::Mmap;

use crate::error::{Result, SegmentError};
use crate::frame::Frame;

/// Magic bytes identifying a telagg segment file.
const SEGMENT_MAGIC: [u8; 4] = *b"TLAG";

/// Current segment format version.
const SEGMENT_VERSION: u32 = 1;

/// Size of the file header in bytes.
const HEADER_SIZE: usize = 8;

/// Size of the length prefix in front of every frame.
const LENGTH_SIZE: usize = 4;

/// Number of leading digits of the Unix timestamp used for the bucket directory.
const BUCKET_DIGITS: usize = 5;

/// File extension of segment files.
pub const SEGMENT_EXTENSION: &str = "seg";

/// Returns the bucket directory for a segment starting at `start`.
///
/// The bucket is the leading five digits of the Unix time in seconds, so a
/// new directory begins roughly every 28 hours.
pub fn bucket_dir(data_dir: &Path, start: SystemTime) -> PathBuf {
    let secs = start
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        .to_string();
    let bucket: String = secs.chars().take(BUCKET_DIGITS).collect();
    data_dir.join(bucket)
}

/// Returns the path of a segment starting at `start`.
pub fn segment_path(data_dir: &Path, start: SystemTime) -> PathBuf {
    let stamp = DateTime::<Utc>::from(start).format("%Y-%m-%d-%H-%M-%S");
    bucket_dir(data_dir, start).join(format!("{stamp}.{SEGMENT_EXTENSION}"))
}

/// Creates the bucket directory for `start` and returns a path that is not
/// yet taken.
///
/// Existing bucket directories are reused. If two segments start within the
/// same second, later ones get a `-1`, `-2`, ... suffix.
///
/// # Errors
///
/// Returns [`SegmentError::CreateDir`] if the directory cannot be created.
pub fn prepare_segment_path(data_dir: &Path, start: SystemTime) -> Result<PathBuf> {
    let path = segment_path(data_dir, start);
    let dir = bucket_dir(data_dir, start);
    std::fs::create_dir_all(&dir).map_err(|e| SegmentError::CreateDir {
        path: dir.clone(),
        source: e,
    })?;

    if !path.exists() {
        return Ok(path);
    }

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut n = 1u32;
    loop {
        let candidate = dir.join(format!("{stem}-{n}.{SEGMENT_EXTENSION}"));
        if !candidate.exists() {
            return Ok(candidate);
        }
        n += 1;
    }
}

/// Destination for frames of the currently open segment.
pub trait FrameSink: Send {
    /// Appends a frame.
    ///
    /// # Errors
    ///
    /// Returns [`SegmentError`] if the frame cannot be encoded or written.
    fn write_frame(&mut self, frame: &Frame) -> Result<()>;

    /// Writes the terminal marker and makes the segment durable.
    ///
    /// # Errors
    ///
    /// Returns [`SegmentError`] if the marker cannot be written or synced.
    fn finish(&mut self) -> Result<()>;

    /// Path of the segment.
    fn path(&self) -> &Path;
}

/// Opens frame sinks for new segments.
pub trait SinkFactory: Send + Sync {
    /// Opens a sink writing to `path`.
    ///
    /// # Errors
    ///
    /// Returns [`SegmentError`] if the segment cannot be created.
    fn open(&self, path: &Path) -> Result<Box<dyn FrameSink>>;
}

/// Opens [`SegmentWriter`]s on the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileSinkFactory;

impl SinkFactory for FileSinkFactory {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameSink>> {
        Ok(Box::new(SegmentWriter::create(path)?))
    }
}

/// Writes frames to a segment file.
pub struct SegmentWriter {
    path: PathBuf,
    file: Option<BufWriter<File>>,
    frames: u64,
}

impl SegmentWriter {
    /// Creates a new segment file and writes its header.
    ///
    /// # Errors
    ///
    /// Returns [`SegmentError::Open`] if the file exists or cannot be created,
    /// or [`SegmentError::Write`] if the header cannot be written.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| SegmentError::Open {
                path: path.clone(),
                source: e,
            })?;

        let mut file = BufWriter::new(file);
        let mut header = [0u8; HEADER_SIZE];
        header[..4].copy_from_slice(&SEGMENT_MAGIC);
        header[4..].copy_from_slice(&SEGMENT_VERSION.to_le_bytes());
        file.write_all(&header)
            .and_then(|()| file.flush())
            .map_err(|e| SegmentError::Write {
                path: path.clone(),
                source: e,
            })?;

        Ok(Self {
            path,
            file: Some(file),
            frames: 0,
        })
    }

    /// Number of frames written so far, including the terminal marker.
    pub fn frames_written(&self) -> u64 {
        self.frames
    }

    fn append(&mut self, frame: &Frame) -> Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Err(SegmentError::Closed {
                path: self.path.clone(),
            }
            .into());
        };

        let body = serde_json::to_vec(frame).map_err(|e| SegmentError::Encode {
            path: self.path.clone(),
            source: e,
        })?;
        let len = u32::try_from(body.len()).map_err(|_| SegmentError::Write {
            path: self.path.clone(),
            source: std::io::Error::other(format!("frame of {} bytes is too large", body.len())),
        })?;

        file.write_all(&len.to_le_bytes())
            .and_then(|()| file.write_all(&body))
            .and_then(|()| file.flush())
            .map_err(|e| SegmentError::Write {
                path: self.path.clone(),
                source: e,
            })?;

        self.frames += 1;
        Ok(())
    }
}

impl FrameSink for SegmentWriter {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.append(frame)
    }

    fn finish(&mut self) -> Result<()> {
        self.append(&Frame::EndProcessing)?;

        if let Some(file) = self.file.take() {
            let file = file.into_inner().map_err(|e| SegmentError::Sync {
                path: self.path.clone(),
                source: e.into_error(),
            })?;
            file.sync_all().map_err(|e| SegmentError::Sync {
                path: self.path.clone(),
                source: e,
            })?;
        }
        Ok(())
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

/// Reads frames from a segment file.
///
/// The file is memory-mapped read-only. Segments still being written can be
/// read; frames past the last complete one are reported as corruption.
pub struct SegmentReader {
    path: PathBuf,
    mmap: Mmap,
}

impl SegmentReader {
    /// Opens a segment and validates its header.
    ///
    /// # Errors
    ///
    /// Returns [`SegmentError::Open`] if the file cannot be opened or mapped,
    /// or [`SegmentError::Corrupted`] if the header is invalid.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| SegmentError::Open {
            path: path.clone(),
            source: e,
        })?;

        // SAFETY: the mapping is read-only and segments are append-only; bytes
        // already written are never rewritten while the mapping is alive.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| SegmentError::Open {
            path: path.clone(),
            source: e,
        })?;

        if mmap.len() < HEADER_SIZE {
            return Err(SegmentError::Corrupted {
                path,
                reason: format!("file is {} bytes, shorter than the header", mmap.len()),
            }
            .into());
        }
        if mmap[..4] != SEGMENT_MAGIC {
            return Err(SegmentError::Corrupted {
                path,
                reason: format!(
                    "invalid magic bytes: expected {:?}, found {:?}",
                    SEGMENT_MAGIC,
                    &mmap[..4]
                ),
            }
            .into());
        }
        let version = u32::from_le_bytes([mmap[4], mmap[5], mmap[6], mmap[7]]);
        if version != SEGMENT_VERSION {
            return Err(SegmentError::Corrupted {
                path,
                reason: format!("unsupported version: expected {SEGMENT_VERSION}, found {version}"),
            }
            .into());
        }

        Ok(Self { path, mmap })
    }

    /// Path of the segment.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Iterates the frames in file order.
    pub fn frames(&self) -> Frames<'_> {
        Frames {
            reader: self,
            offset: HEADER_SIZE,
            failed: false,
        }
    }

    /// Reads every frame.
    ///
    /// # Errors
    ///
    /// Returns the first decoding error encountered.
    pub fn read_all(&self) -> Result<Vec<Frame>> {
        self.frames().collect()
    }
}

/// Iterator over the frames of a [`SegmentReader`].
pub struct Frames<'a> {
    reader: &'a SegmentReader,
    offset: usize,
    failed: bool,
}

impl Frames<'_> {
    fn corrupted(&mut self, reason: String) -> Option<Result<Frame>> {
        self.failed = true;
        Some(Err(SegmentError::Corrupted {
            path: self.reader.path.clone(),
            reason,
        }
        .into()))
    }
}

impl Iterator for Frames<'_> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        let data = &self.reader.mmap[..];
        if self.failed || self.offset == data.len() {
            return None;
        }

        let Some(prefix) = data.get(self.offset..self.offset + LENGTH_SIZE) else {
            return self.corrupted(format!("truncated length prefix at offset {}", self.offset));
        };
        let len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        let start = self.offset + LENGTH_SIZE;

        let Some(body) = data.get(start..start + len) else {
            return self.corrupted(format!(
                "frame at offset {} claims {len} bytes, only {} remain",
                self.offset,
                data.len() - start
            ));
        };

        match serde_json::from_slice(body) {
            Ok(frame) => {
                self.offset = start + len;
                Some(Ok(frame))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(SegmentError::Encode {
                    path: self.reader.path.clone(),
                    source: e,
                }
                .into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{FeedAddress, Sample};
    use std::time::Duration;
    use tempfile::tempdir;

    /// 2023-11-14 22:13:20 UTC
    fn start_time() -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    }

    fn frame(value: f64) -> Frame {
        let address = FeedAddress::new("dev1", "therm").unwrap();
        Frame::housekeeping(&address, &[Sample::new("ch1", 1.0, value)]).unwrap()
    }

    #[test]
    fn test_segment_naming() {
        let path = segment_path(Path::new("data"), start_time());
        assert_eq!(path, PathBuf::from("data/17000/2023-11-14-22-13-20.seg"));
    }

    #[test]
    fn test_prepare_reuses_dir_and_avoids_collisions() {
        let temp_dir = tempdir().unwrap();
        let first = prepare_segment_path(temp_dir.path(), start_time()).unwrap();
        assert!(first.parent().unwrap().is_dir());
        SegmentWriter::create(&first).unwrap();

        let second = prepare_segment_path(temp_dir.path(), start_time()).unwrap();
        assert_ne!(first, second);
        assert!(second.ends_with("17000/2023-11-14-22-13-20-1.seg"));
    }

    #[test]
    fn test_write_and_read_back() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("a.seg");

        let mut writer = SegmentWriter::create(&path).unwrap();
        writer.write_frame(&frame(1.0)).unwrap();
        writer.write_frame(&frame(2.0)).unwrap();
        writer.finish().unwrap();
        assert_eq!(writer.frames_written(), 3);

        let frames = SegmentReader::open(&path).unwrap().read_all().unwrap();
        assert_eq!(frames, vec![frame(1.0), frame(2.0), Frame::EndProcessing]);
    }

    #[test]
    fn test_write_after_finish_fails() {
        let temp_dir = tempdir().unwrap();
        let mut writer = SegmentWriter::create(temp_dir.path().join("a.seg")).unwrap();
        writer.finish().unwrap();
        assert!(writer.write_frame(&frame(1.0)).is_err());
    }

    #[test]
    fn test_create_refuses_existing_file() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("a.seg");
        SegmentWriter::create(&path).unwrap();
        assert!(SegmentWriter::create(&path).is_err());
    }

    #[test]
    fn test_reader_detects_corruption() {
        let temp_dir = tempdir().unwrap();

        let bad_magic = temp_dir.path().join("magic.seg");
        std::fs::write(&bad_magic, b"NOPE\x01\x00\x00\x00").unwrap();
        assert!(SegmentReader::open(&bad_magic).is_err());

        let path = temp_dir.path().join("truncated.seg");
        let mut writer = SegmentWriter::create(&path).unwrap();
        writer.write_frame(&frame(1.0)).unwrap();
        drop(writer);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.truncate(bytes.len() - 3);
        std::fs::write(&path, bytes).unwrap();

        let reader = SegmentReader::open(&path).unwrap();
        let results: Vec<_> = reader.frames().collect();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());
    }
}
