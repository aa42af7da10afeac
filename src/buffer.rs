/// Fixed-capacity byte staging area with independent read and write cursors.
///
/// Valid data lives in `data[read..write]`. Writers fill the free tail
/// (`data[write..]`) and advance `write`; readers drain from `read`. Space is
/// never reclaimed implicitly: call [`ByteBuffer::reset`] once a logical chunk
/// has been fully consumed.
pub struct ByteBuffer {
    data: Box<[u8]>,
    read: usize,
    write: usize,
}

impl ByteBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            read: 0,
            write: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes written but not yet read.
    pub fn readable(&self) -> usize {
        self.write - self.read
    }

    /// Free slots left after the write cursor.
    pub fn writable(&self) -> usize {
        self.data.len() - self.write
    }

    pub fn can_read(&self) -> bool {
        self.read < self.write
    }

    pub fn can_write(&self) -> bool {
        self.write < self.data.len()
    }

    /// Unread bytes, for a partial drain (e.g. a socket send).
    pub fn read_slice(&self) -> &[u8] {
        &self.data[self.read..self.write]
    }

    pub fn read_adv(&mut self, n: usize) {
        debug_assert!(n <= self.readable());
        self.read = (self.read + n).min(self.write);
    }

    /// Free tail, for a partial fill (e.g. a socket recv).
    pub fn write_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.write..]
    }

    pub fn write_adv(&mut self, n: usize) {
        debug_assert!(n <= self.writable());
        self.write = (self.write + n).min(self.data.len());
    }

    pub fn read_byte(&mut self) -> Option<u8> {
        if !self.can_read() {
            return None;
        }
        let c = self.data[self.read];
        self.read += 1;
        Some(c)
    }

    /// Returns false, leaving the buffer untouched, when it is full.
    pub fn write_byte(&mut self, c: u8) -> bool {
        if !self.can_write() {
            return false;
        }
        self.data[self.write] = c;
        self.write += 1;
        true
    }

    /// Copies as much of `bytes` as fits and returns how many were taken.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.writable());
        self.data[self.write..self.write + n].copy_from_slice(&bytes[..n]);
        self.write += n;
        n
    }

    /// Collapses both cursors to zero. Unread bytes are dropped.
    pub fn reset(&mut self) {
        self.read = 0;
        self.write = 0;
    }
}

impl std::fmt::Debug for ByteBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteBuffer")
            .field("capacity", &self.data.len())
            .field("read", &self.read)
            .field("write", &self.write)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_fill_and_drain() {
        let mut buffer = ByteBuffer::new(8);
        assert!(!buffer.can_read());
        assert_eq!(buffer.writable(), 8);

        buffer.write_slice()[..3].copy_from_slice(b"abc");
        buffer.write_adv(3);
        assert_eq!(buffer.readable(), 3);
        assert_eq!(buffer.writable(), 5);

        assert_eq!(buffer.read_slice(), b"abc");
        buffer.read_adv(2);
        assert_eq!(buffer.read_slice(), b"c");
        assert_eq!(buffer.read_byte(), Some(b'c'));
        assert_eq!(buffer.read_byte(), None);

        // Lire ne libère pas d'espace
        assert_eq!(buffer.writable(), 5);
        buffer.reset();
        assert_eq!(buffer.writable(), 8);
    }

    #[test]
    fn test_write_stops_at_capacity() {
        let mut buffer = ByteBuffer::new(4);
        assert_eq!(buffer.write_bytes(b"hello"), 4);
        assert!(!buffer.can_write());
        assert!(!buffer.write_byte(b'!'));
        assert_eq!(buffer.read_slice(), b"hell");
    }

    #[test]
    fn test_cursor_invariant_holds_after_mixed_ops() {
        let mut buffer = ByteBuffer::new(6);
        buffer.write_byte(b'x');
        buffer.write_bytes(b"yz");
        buffer.read_adv(1);
        buffer.read_byte();
        assert_eq!(buffer.readable(), 1);
        assert_eq!(buffer.writable(), 3);
        assert_eq!(buffer.readable() + buffer.writable() + 2, buffer.capacity());
    }
}
