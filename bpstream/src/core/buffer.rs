/// Growable byte region whose position only moves forward until it is reset.
#[derive(Debug, Default)]
pub(crate) struct SerializedBuffer {
    data: Vec<u8>,
}

impl SerializedBuffer {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        SerializedBuffer {
            data: Vec::with_capacity(capacity),
        }
    }

    #[inline]
    pub(crate) fn position(&self) -> u64 {
        self.data.len() as u64
    }

    /// Appends `bytes` and returns the position they start at.
    pub(crate) fn append(&mut self, bytes: &[u8]) -> u64 {
        let offset = self.position();
        self.data.extend_from_slice(bytes);
        offset
    }

    #[inline]
    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Hands the bytes out and starts over at position 0, keeping the allocation size.
    pub(crate) fn take(&mut self) -> Vec<u8> {
        let capacity = self.data.capacity();
        std::mem::replace(&mut self.data, Vec::with_capacity(capacity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_advance() {
        let mut buffer = SerializedBuffer::with_capacity(4);
        assert_eq!(buffer.append(b"abc"), 0);
        assert_eq!(buffer.append(b"defgh"), 3);
        assert_eq!(buffer.position(), 8);
        assert_eq!(buffer.take(), b"abcdefgh");
        assert_eq!(buffer.position(), 0);
        assert_eq!(buffer.append(b"x"), 0);
    }
}
