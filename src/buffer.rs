//! Byte buffer with a write cursor, used for frame pixel data and for input
//! bytes carried between packet chunks.

use bytes::{Bytes, BytesMut};

use crate::error::{Result, SdkError};

/// A zero-filled byte region plus a write cursor.
///
/// A fixed buffer refuses writes past its capacity; a growable one resizes.
#[derive(Debug, Clone, Default)]
pub struct ByteBuffer {
    data: BytesMut,
    len: usize,
    growable: bool,
}

impl ByteBuffer {
    /// Fixed-capacity buffer.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::zeroed(capacity),
            len: 0,
            growable: false,
        }
    }

    /// Buffer that grows on demand.
    pub fn growable(initial: usize) -> Self {
        Self {
            growable: true,
            ..Self::with_capacity(initial)
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn free_space(&self) -> usize {
        self.capacity() - self.len
    }

    /// Written bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Written bytes, mutable.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }

    /// Rewinds the cursor. Capacity is kept.
    pub fn reset(&mut self) {
        self.len = 0;
    }

    /// Makes sure at least `capacity` bytes are available in total, growing
    /// regardless of the growable flag. Used when recycling frames for a
    /// larger resolution.
    pub fn ensure_capacity(&mut self, capacity: usize) {
        if self.data.len() < capacity {
            self.data.resize(capacity, 0);
        }
    }

    /// Appends `bytes` at the cursor.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.free_space() {
            if !self.growable {
                return Err(SdkError::BufferTooSmall {
                    need: self.len + bytes.len(),
                    have: self.capacity(),
                });
            }
            let target = (self.len + bytes.len()).max(self.capacity() * 2);
            self.data.resize(target, 0);
        }
        self.data[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        Ok(())
    }

    /// The unwritten tail, for producers that write directly (codecs).
    /// Follow with [`ByteBuffer::commit`].
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.len..]
    }

    /// Moves the cursor forward by `count` bytes written through
    /// [`ByteBuffer::spare_mut`].
    pub fn commit(&mut self, count: usize) -> Result<()> {
        if count > self.free_space() {
            return Err(SdkError::InvalidArgument(format!(
                "commit of {count} bytes exceeds free space {}",
                self.free_space()
            )));
        }
        self.len += count;
        Ok(())
    }

    /// Drops the first `count` written bytes, moving the rest to the front.
    pub fn shift_left(&mut self, count: usize) {
        let count = count.min(self.len);
        self.data.copy_within(count..self.len, 0);
        self.len -= count;
    }

    /// Copies the written bytes into an immutable, shareable buffer.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_buffer_rejects_overflow() {
        let mut buf = ByteBuffer::with_capacity(4);
        buf.write(&[1, 2, 3]).unwrap();
        let err = buf.write(&[4, 5]).unwrap_err();
        assert!(matches!(err, SdkError::BufferTooSmall { need: 5, have: 4 }));
        assert_eq!(buf.as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn growable_buffer_resizes() {
        let mut buf = ByteBuffer::growable(2);
        buf.write(&[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(buf.as_slice(), &[1, 2, 3, 4, 5]);
        assert!(buf.capacity() >= 5);
    }

    #[test]
    fn shift_left_keeps_tail() {
        let mut buf = ByteBuffer::with_capacity(8);
        buf.write(&[9, 8, 7, 6]).unwrap();
        buf.shift_left(3);
        assert_eq!(buf.as_slice(), &[6]);
        buf.write(&[5]).unwrap();
        assert_eq!(buf.as_slice(), &[6, 5]);
    }

    #[test]
    fn spare_and_commit() {
        let mut buf = ByteBuffer::with_capacity(4);
        buf.spare_mut()[..2].copy_from_slice(&[0xAA, 0xBB]);
        buf.commit(2).unwrap();
        assert_eq!(buf.as_slice(), &[0xAA, 0xBB]);
        assert!(buf.commit(3).is_err());
        buf.reset();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), 4);
    }
}
