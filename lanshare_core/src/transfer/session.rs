/// Byte accounting for one connection. Owned by the routine that opened or
/// accepted the connection and dropped with it.
#[derive(Debug)]
pub struct TransferSession<S> {
    stream: S,
    file_size: u64,
    bytes_moved: u64,
}

impl<S> TransferSession<S> {
    pub fn new(stream: S, file_size: u64) -> Self {
        Self {
            stream,
            file_size,
            bytes_moved: 0,
        }
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn bytes_moved(&self) -> u64 {
        self.bytes_moved
    }

    pub fn remaining(&self) -> u64 {
        self.file_size - self.bytes_moved
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_moved == self.file_size
    }

    /// Size of the next chunk: never more than `max`, never past the declared size
    pub fn next_chunk_len(&self, max: usize) -> usize {
        std::cmp::min(max as u64, self.remaining()) as usize
    }

    /// Account for `n` moved bytes. Returns the new total, or `None` if that
    /// would exceed the declared size (the counter is left unchanged).
    pub fn record(&mut self, n: usize) -> Option<u64> {
        let next = self.bytes_moved.checked_add(n as u64)?;
        if next > self.file_size {
            return None;
        }
        self.bytes_moved = next;
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunks_never_pass_declared_size() {
        let mut session = TransferSession::new((), 10_000);
        let mut chunks = Vec::new();
        while !session.is_complete() {
            let n = session.next_chunk_len(4096);
            chunks.push(n);
            session.record(n).unwrap();
        }
        assert_eq!(chunks, vec![4096, 4096, 1808]);
        assert_eq!(session.bytes_moved(), 10_000);
    }

    #[test]
    fn test_record_refuses_overrun() {
        let mut session = TransferSession::new((), 10);
        assert_eq!(session.record(8), Some(8));
        assert_eq!(session.record(3), None);
        assert_eq!(session.bytes_moved(), 8);
        assert_eq!(session.remaining(), 2);
    }

    #[test]
    fn test_empty_file_is_complete_immediately() {
        let session = TransferSession::new((), 0);
        assert!(session.is_complete());
        assert_eq!(session.next_chunk_len(4096), 0);
    }
}
