//! Per-track HTTP replay cache.
//!
//! Renderers probe, pause, close and re-open the connection of a track they
//! are already playing (Sonos in particular). The cache keeps what the
//! output engine produced so those re-opens can be served without decoding
//! anything again. Three variants exist: a bounded ring holding the most
//! recent window, an unbounded in-memory store and an append-only temp
//! file with a small RAM scratch.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use tracing::warn;

const RING_DEFAULT: usize = 8 * 1024 * 1024;
const FILE_SCRATCH_DEFAULT: usize = 128 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheType {
    Ring,
    Infinite,
    File,
}

/// Replay store written once by the output engine and read back by the HTTP
/// connection. Offsets are absolute positions in the produced byte stream.
pub trait CacheBuffer: Send {
    /// Total bytes ever written.
    fn total(&self) -> u64;
    /// Bytes currently retrievable (the retained window).
    fn level(&self) -> u64;
    /// Bytes between the read offset and the write head.
    fn pending(&self) -> u64;
    /// Whether the whole resource stays available (no bounded window).
    fn infinite(&self) -> bool;
    /// 0 when `offset` is inside the retained window, the distance beyond
    /// the head when in the future, negative when already evicted.
    fn scope(&self, offset: u64) -> i64;
    /// Moves the read offset; out-of-window values clamp to the window.
    fn set_offset(&mut self, offset: u64);
    /// Reads up to `dst.len()` bytes at the read offset, or nothing when
    /// fewer than `min` are available.
    fn read(&mut self, dst: &mut [u8], min: usize) -> usize;
    /// Zero-copy-ish read: returns the next run of at most `size` bytes.
    /// The returned slice is consumed (the read offset advances).
    fn read_inner(&mut self, size: usize) -> Option<&[u8]>;
    fn write(&mut self, src: &[u8]);
    fn flush(&mut self);
}

/// Creates a cache of the requested type; `buffer_size` of 0 uses the
/// variant's default (8 MiB ring, 128 KiB file scratch).
pub fn cache_create(kind: CacheType, buffer_size: usize) -> Box<dyn CacheBuffer> {
    match kind {
        CacheType::Ring => Box::new(RingCache::new(if buffer_size == 0 {
            RING_DEFAULT
        } else {
            buffer_size
        })),
        CacheType::Infinite => Box::new(InfiniteCache::new()),
        CacheType::File => match FileCache::new(if buffer_size == 0 {
            FILE_SCRATCH_DEFAULT
        } else {
            buffer_size
        }) {
            Ok(cache) => Box::new(cache),
            Err(err) => {
                warn!("disk cache unavailable ({err}), using memory");
                Box::new(InfiniteCache::new())
            }
        },
    }
}

/// Bounded circular cache retaining the last `size - 1` bytes.
pub struct RingCache {
    buffer: Vec<u8>,
    read: usize,
    write: usize,
    total: u64,
}

impl RingCache {
    pub fn new(size: usize) -> Self {
        Self {
            buffer: vec![0; size.max(2)],
            read: 0,
            write: 0,
            total: 0,
        }
    }

    fn size(&self) -> usize {
        self.buffer.len()
    }
}

impl CacheBuffer for RingCache {
    fn total(&self) -> u64 {
        self.total
    }

    fn level(&self) -> u64 {
        self.total.min(self.size() as u64 - 1)
    }

    fn pending(&self) -> u64 {
        ((self.write + self.size() - self.read) % self.size()) as u64
    }

    fn infinite(&self) -> bool {
        false
    }

    fn scope(&self, offset: u64) -> i64 {
        if offset >= self.total {
            (offset - self.total) as i64 + 1
        } else if offset >= self.total - self.level() {
            0
        } else {
            offset as i64 - self.total as i64 + self.level() as i64
        }
    }

    fn set_offset(&mut self, offset: u64) {
        if offset >= self.total {
            self.read = self.write;
        } else if offset < self.total - self.level() {
            // evicted: oldest retained byte sits just after the write head
            self.read = (self.write + 1) % self.size();
        } else {
            self.read = (offset % self.size() as u64) as usize;
        }
    }

    fn read(&mut self, dst: &mut [u8], min: usize) -> usize {
        let size = dst.len().min(self.pending() as usize);
        if size < min {
            return 0;
        }
        let cont = size.min(self.size() - self.read);
        dst[..cont].copy_from_slice(&self.buffer[self.read..self.read + cont]);
        dst[cont..size].copy_from_slice(&self.buffer[..size - cont]);
        self.read = (self.read + size) % self.size();
        size
    }

    fn read_inner(&mut self, size: usize) -> Option<&[u8]> {
        let size = size
            .min(self.pending() as usize)
            .min(self.size() - self.read);
        if size == 0 {
            return None;
        }
        let start = self.read;
        self.read = (self.read + size) % self.size();
        Some(&self.buffer[start..start + size])
    }

    fn write(&mut self, src: &[u8]) {
        // chunking keeps absolute position == index modulo size
        for chunk in src.chunks(self.size() - 1) {
            let cont = chunk.len().min(self.size() - self.write);
            let write = self.write;
            self.buffer[write..write + cont].copy_from_slice(&chunk[..cont]);
            self.buffer[..chunk.len() - cont].copy_from_slice(&chunk[cont..]);
            self.write = (self.write + chunk.len()) % self.size();
            self.total += chunk.len() as u64;
            // once saturated, the read pointer tracks the oldest retained byte
            if self.level() == self.size() as u64 - 1 {
                self.read = (self.write + 1) % self.size();
            }
        }
    }

    fn flush(&mut self) {
        self.read = 0;
        self.write = 0;
        self.total = 0;
    }
}

/// Unbounded in-memory cache.
pub struct InfiniteCache {
    buffer: Vec<u8>,
    read: usize,
}

impl InfiniteCache {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            read: 0,
        }
    }
}

impl Default for InfiniteCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheBuffer for InfiniteCache {
    fn total(&self) -> u64 {
        self.buffer.len() as u64
    }

    fn level(&self) -> u64 {
        self.buffer.len() as u64
    }

    fn pending(&self) -> u64 {
        (self.buffer.len() - self.read) as u64
    }

    fn infinite(&self) -> bool {
        true
    }

    fn scope(&self, offset: u64) -> i64 {
        if offset >= self.total() {
            (offset - self.total()) as i64 + 1
        } else {
            0
        }
    }

    fn set_offset(&mut self, offset: u64) {
        self.read = offset.min(self.total()) as usize;
    }

    fn read(&mut self, dst: &mut [u8], min: usize) -> usize {
        let size = dst.len().min(self.pending() as usize);
        if size < min {
            return 0;
        }
        dst[..size].copy_from_slice(&self.buffer[self.read..self.read + size]);
        self.read += size;
        size
    }

    fn read_inner(&mut self, size: usize) -> Option<&[u8]> {
        let size = size.min(self.pending() as usize);
        if size == 0 {
            return None;
        }
        let start = self.read;
        self.read += size;
        Some(&self.buffer[start..start + size])
    }

    fn write(&mut self, src: &[u8]) {
        self.buffer.extend_from_slice(src);
    }

    fn flush(&mut self) {
        self.buffer.clear();
        self.read = 0;
    }
}

/// Append-only temp file cache with a RAM scratch for `read_inner`.
pub struct FileCache {
    file: File,
    scratch: Vec<u8>,
    read_offset: u64,
    total: u64,
}

impl FileCache {
    pub fn new(scratch_size: usize) -> std::io::Result<Self> {
        Ok(Self {
            file: tempfile::tempfile()?,
            scratch: vec![0; scratch_size.max(1)],
            read_offset: 0,
            total: 0,
        })
    }
}

impl CacheBuffer for FileCache {
    fn total(&self) -> u64 {
        self.total
    }

    fn level(&self) -> u64 {
        self.total
    }

    fn pending(&self) -> u64 {
        self.total - self.read_offset
    }

    fn infinite(&self) -> bool {
        true
    }

    fn scope(&self, offset: u64) -> i64 {
        if offset >= self.total {
            (offset - self.total) as i64 + 1
        } else {
            0
        }
    }

    fn set_offset(&mut self, offset: u64) {
        self.read_offset = offset.min(self.total);
    }

    fn read(&mut self, dst: &mut [u8], min: usize) -> usize {
        let size = dst.len().min(self.pending() as usize);
        if size < min {
            return 0;
        }
        if self.file.seek(SeekFrom::Start(self.read_offset)).is_err() {
            return 0;
        }
        match self.file.read(&mut dst[..size]) {
            Ok(bytes) => {
                self.read_offset += bytes as u64;
                bytes
            }
            Err(err) => {
                warn!("disk cache read failed: {err}");
                0
            }
        }
    }

    fn read_inner(&mut self, size: usize) -> Option<&[u8]> {
        if size > self.scratch.len() {
            self.scratch.resize(size, 0);
        }
        let size = size.min(self.pending() as usize);
        if size == 0 {
            return None;
        }
        self.file.seek(SeekFrom::Start(self.read_offset)).ok()?;
        let bytes = self.file.read(&mut self.scratch[..size]).ok()?;
        if bytes == 0 {
            return None;
        }
        self.read_offset += bytes as u64;
        Some(&self.scratch[..bytes])
    }

    fn write(&mut self, src: &[u8]) {
        if self.file.seek(SeekFrom::End(0)).is_err() {
            return;
        }
        match self.file.write_all(src) {
            Ok(()) => self.total += src.len() as u64,
            Err(err) => warn!("disk cache write failed: {err}"),
        }
    }

    fn flush(&mut self) {
        self.read_offset = 0;
        self.total = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(cache: &mut dyn CacheBuffer, len: usize) -> Vec<u8> {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        cache.write(&data);
        data
    }

    #[test]
    fn infinite_absolute_offsets() {
        let mut cache = InfiniteCache::new();
        let data = fill(&mut cache, 10_000);

        assert_eq!(cache.scope(5_000), 0);
        cache.set_offset(5_000);
        let mut out = vec![0; 100];
        assert_eq!(cache.read(&mut out, 1), 100);
        assert_eq!(&out[..], &data[5_000..5_100]);

        assert_eq!(cache.scope(10_000), 1);
        assert_eq!(cache.scope(12_345), 2_346);
    }

    #[test]
    fn ring_retains_most_recent_window() {
        let mut cache = RingCache::new(1024);
        let data = fill(&mut cache, 10_000);

        assert_eq!(cache.total(), 10_000);
        assert_eq!(cache.level(), 1023);
        // oldest retained byte
        let oldest = cache.total() - cache.level();
        assert_eq!(cache.scope(oldest), 0);
        assert!(cache.scope(oldest - 1) < 0);

        cache.set_offset(oldest);
        let mut out = vec![0; cache.level() as usize];
        assert_eq!(cache.read(&mut out, 1), 1023);
        assert_eq!(&out[..], &data[oldest as usize..]);
    }

    #[test]
    fn ring_full_range_request_from_zero() {
        // Range: bytes=0- on a saturated ring serves the retained level
        let mut cache = RingCache::new(256);
        let data = fill(&mut cache, 1000);
        cache.set_offset(0); // clamps to oldest retained
        let mut out = vec![0; 1024];
        let got = cache.read(&mut out, 1);
        assert_eq!(got as u64, cache.level());
        assert_eq!(&out[..got], &data[1000 - got..]);
    }

    #[test]
    fn ring_read_inner_consumes_all() {
        let mut cache = RingCache::new(64);
        let data = fill(&mut cache, 40);
        cache.set_offset(0);
        let mut collected = Vec::new();
        while let Some(chunk) = cache.read_inner(16) {
            collected.extend_from_slice(chunk);
        }
        assert_eq!(collected, data);
    }

    #[test]
    fn file_cache_round_trip() {
        let mut cache = FileCache::new(64).unwrap();
        let data = fill(&mut cache, 5_000);
        assert_eq!(cache.total(), 5_000);
        assert_eq!(cache.scope(4_999), 0);
        assert_eq!(cache.scope(5_000), 1);

        cache.set_offset(1_000);
        let mut out = vec![0; 512];
        assert_eq!(cache.read(&mut out, 1), 512);
        assert_eq!(&out[..], &data[1_000..1_512]);

        cache.set_offset(4_990);
        let chunk = cache.read_inner(100).unwrap();
        assert_eq!(chunk, &data[4_990..]);
    }

    #[test]
    fn min_gate_returns_nothing() {
        let mut cache = InfiniteCache::new();
        fill(&mut cache, 10);
        cache.set_offset(0);
        let mut out = vec![0; 64];
        assert_eq!(cache.read(&mut out, 32), 0);
        assert_eq!(cache.read(&mut out, 10), 10);
    }
}
