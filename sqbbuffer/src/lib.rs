//! Byte ring buffer shared between pipeline stages.
//!
//! One byte of capacity is always kept free so that `read == write` means
//! empty, never full: `used + space + 1 == size`. The buffer itself carries
//! no lock; each pipeline zone wraps buffer and companion state in a single
//! mutex so a state check and a cursor move stay atomic.

/// Fixed-capacity byte ring with separate read/write cursors.
#[derive(Debug)]
pub struct RingBuffer {
    data: Vec<u8>,
    read: usize,
    write: usize,
    base_size: usize,
}

impl RingBuffer {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size.max(2)],
            read: 0,
            write: 0,
            base_size: size.max(2),
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Bytes available for reading.
    #[inline]
    pub fn used(&self) -> usize {
        (self.write + self.size() - self.read) % self.size()
    }

    /// Bytes available for writing (one slot is always reserved).
    #[inline]
    pub fn space(&self) -> usize {
        self.size() - self.used() - 1
    }

    /// Readable bytes before the read cursor would wrap.
    #[inline]
    pub fn cont_read(&self) -> usize {
        if self.write >= self.read {
            self.write - self.read
        } else {
            self.size() - self.read
        }
    }

    /// Writable bytes before the write cursor would wrap.
    #[inline]
    pub fn cont_write(&self) -> usize {
        if self.write >= self.read {
            (self.size() - self.write).min(self.space())
        } else {
            self.read - self.write - 1
        }
    }

    #[inline]
    pub fn read_pos(&self) -> usize {
        self.read
    }

    #[inline]
    pub fn write_pos(&self) -> usize {
        self.write
    }

    /// Contiguous readable slice starting at the read cursor.
    pub fn readable(&self) -> &[u8] {
        let len = self.cont_read();
        &self.data[self.read..self.read + len]
    }

    /// Contiguous writable slice starting at the write cursor.
    pub fn writable(&mut self) -> &mut [u8] {
        let len = self.cont_write();
        let start = self.write;
        &mut self.data[start..start + len]
    }

    /// Slice of the underlying storage, used together with cursor positions
    /// by the fade engine which inspects data it has not consumed yet.
    pub fn slice(&self, pos: usize, len: usize) -> &[u8] {
        debug_assert!(pos < self.size() && pos + len <= self.size());
        &self.data[pos..pos + len]
    }

    pub fn slice_mut(&mut self, pos: usize, len: usize) -> &mut [u8] {
        debug_assert!(pos < self.size() && pos + len <= self.size());
        &mut self.data[pos..pos + len]
    }

    /// Byte at an absolute position, for wrapped single-byte access.
    #[inline]
    pub fn at(&self, pos: usize) -> u8 {
        self.data[pos % self.size()]
    }

    pub fn inc_readp(&mut self, by: usize) {
        debug_assert!(by <= self.used());
        self.read = (self.read + by) % self.size();
    }

    pub fn inc_writep(&mut self, by: usize) {
        debug_assert!(by <= self.space());
        self.write = (self.write + by) % self.size();
    }

    /// Copies up to `dst.len()` bytes out, handling the wrap, and advances
    /// the read cursor. Returns the number of bytes copied.
    pub fn read_into(&mut self, dst: &mut [u8]) -> usize {
        let bytes = dst.len().min(self.used());
        let cont = bytes.min(self.cont_read());
        dst[..cont].copy_from_slice(&self.data[self.read..self.read + cont]);
        dst[cont..bytes].copy_from_slice(&self.data[..bytes - cont]);
        self.inc_readp(bytes);
        bytes
    }

    /// Copies up to `space()` bytes in, handling the wrap, and advances the
    /// write cursor. Returns the number of bytes copied.
    pub fn write_from(&mut self, src: &[u8]) -> usize {
        let bytes = src.len().min(self.space());
        let cont = bytes.min(self.size() - self.write);
        let write = self.write;
        self.data[write..write + cont].copy_from_slice(&src[..cont]);
        self.data[..bytes - cont].copy_from_slice(&src[cont..bytes]);
        self.inc_writep(bytes);
        bytes
    }

    pub fn flush(&mut self) {
        self.read = 0;
        self.write = 0;
    }

    /// Resizes the buffer, dropping any content. The output buffer shrinks
    /// to an idle size between tracks and grows again on a new one.
    pub fn resize(&mut self, size: usize) {
        let size = size.max(2);
        if size != self.data.len() {
            self.data = vec![0; size];
        }
        self.read = 0;
        self.write = 0;
    }

    pub fn base_size(&self) -> usize {
        self.base_size
    }

    /// Returns false when the buffer is not empty, after emptying it.
    pub fn reset(&mut self) -> bool {
        let was_empty = self.used() == 0;
        self.flush();
        was_empty
    }

    /// Rotates the content so that at least `cont` readable bytes become
    /// contiguous. Used by the MP4 walker when an atom straddles the wrap.
    pub fn unwrap_to(&mut self, cont: usize) {
        if self.cont_read() >= cont.min(self.used()) {
            return;
        }
        let used = self.used();
        let mut linear = Vec::with_capacity(used);
        linear.extend_from_slice(&self.data[self.read..]);
        linear.extend_from_slice(&self.data[..self.write]);
        linear.truncate(used);
        self.data[..used].copy_from_slice(&linear);
        self.read = 0;
        self.write = used;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn used_space_invariant() {
        let mut buf = RingBuffer::new(64);
        assert_eq!(buf.used() + buf.space() + 1, buf.size());
        buf.write_from(&[1; 20]);
        assert_eq!(buf.used() + buf.space() + 1, buf.size());
        let mut out = [0u8; 13];
        buf.read_into(&mut out);
        assert_eq!(buf.used() + buf.space() + 1, buf.size());
        buf.write_from(&[2; 50]);
        assert_eq!(buf.used() + buf.space() + 1, buf.size());
    }

    #[test]
    fn never_accepts_more_than_space() {
        let mut buf = RingBuffer::new(16);
        let written = buf.write_from(&[7; 32]);
        assert_eq!(written, 15);
        assert_eq!(buf.space(), 0);
        assert_eq!(buf.write_from(&[7; 4]), 0);
    }

    #[test]
    fn wrapped_read_write_round_trip() {
        let mut buf = RingBuffer::new(16);
        // push the cursors toward the end so the next write wraps
        buf.write_from(&[0; 12]);
        let mut sink = [0u8; 12];
        buf.read_into(&mut sink);

        let data: Vec<u8> = (0u8..10).collect();
        assert_eq!(buf.write_from(&data), 10);
        assert!(buf.cont_read() < 10, "expected the write to wrap");

        let mut out = [0u8; 10];
        assert_eq!(buf.read_into(&mut out), 10);
        assert_eq!(&out[..], &data[..]);
    }

    #[test]
    fn cont_write_stops_at_read_cursor() {
        let mut buf = RingBuffer::new(16);
        buf.write_from(&[1; 10]);
        let mut out = [0u8; 4];
        buf.read_into(&mut out);
        // write cursor at 10, read at 4: contiguous run is to end of storage
        assert_eq!(buf.cont_write(), 6);
        buf.write_from(&[1; 6]);
        // now wrapped: must stop one short of the read cursor
        assert_eq!(buf.cont_write(), 3);
    }

    #[test]
    fn unwrap_makes_content_contiguous() {
        let mut buf = RingBuffer::new(16);
        buf.write_from(&[0; 12]);
        let mut sink = [0u8; 12];
        buf.read_into(&mut sink);
        let data: Vec<u8> = (1u8..=10).collect();
        buf.write_from(&data);
        assert!(buf.cont_read() < buf.used());

        buf.unwrap_to(10);
        assert_eq!(buf.cont_read(), 10);
        assert_eq!(buf.readable(), &data[..]);
    }

    #[test]
    fn flush_on_empty_is_noop() {
        let mut buf = RingBuffer::new(8);
        buf.flush();
        assert_eq!(buf.used(), 0);
        assert!(buf.reset());
    }
}
