//! Byte queues between paired sockets.
//!
//! Data read from one socket is queued for its peer. The queue keeps the
//! unwritten tail of partial writes and tells the producer when to stop
//! reading: above the high watermark the producer pauses, and it resumes
//! once the queue drains to the low watermark.

use std::collections::VecDeque;
use std::io::{self, Write};

use crate::error::{CrusherError, Result};

/// Size of a single socket read.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Queue size at which the producing side stops reading.
pub const DEFAULT_HIGH_WATERMARK: usize = 256 * 1024;

/// Queue size at which the producing side resumes reading.
pub const DEFAULT_LOW_WATERMARK: usize = 64 * 1024;

/// Backpressure thresholds of a transfer queue, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    low: usize,
    high: usize,
}

impl Watermarks {
    /// Thresholds with `low < high`.
    pub fn new(low: usize, high: usize) -> Result<Self> {
        if high == 0 || low >= high {
            return Err(CrusherError::Config(format!(
                "watermarks must satisfy low < high (low={low}, high={high})"
            )));
        }
        Ok(Self { low, high })
    }

    pub fn low(&self) -> usize {
        self.low
    }

    pub fn high(&self) -> usize {
        self.high
    }
}

impl Default for Watermarks {
    fn default() -> Self {
        Self {
            low: DEFAULT_LOW_WATERMARK,
            high: DEFAULT_HIGH_WATERMARK,
        }
    }
}

/// FIFO of byte chunks waiting to be written to a socket.
#[derive(Debug)]
pub(crate) struct TransferQueue {
    chunks: VecDeque<Vec<u8>>,
    /// Bytes of the front chunk already written
    offset: usize,
    len: usize,
    limits: Watermarks,
    saturated: bool,
}

impl TransferQueue {
    pub(crate) fn new(limits: Watermarks) -> Self {
        Self {
            chunks: VecDeque::new(),
            offset: 0,
            len: 0,
            limits,
            saturated: false,
        }
    }

    /// Bytes waiting to be written.
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True from crossing the high watermark until drained to the low one.
    pub(crate) fn is_saturated(&self) -> bool {
        self.saturated
    }

    pub(crate) fn push(&mut self, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        self.len += data.len();
        self.chunks.push_back(data);
        self.update_saturation();
    }

    /// Write as much as `sink` accepts without blocking.
    ///
    /// Returns the number of bytes written; a partial write keeps the
    /// remainder queued.
    pub(crate) fn write_to<W: Write + ?Sized>(&mut self, sink: &mut W) -> io::Result<usize> {
        let mut written = 0;

        let result = loop {
            let Some(front) = self.chunks.front() else {
                break Ok(written);
            };
            let chunk_len = front.len();

            match sink.write(&front[self.offset..]) {
                Ok(0) => break Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => {
                    written += n;
                    self.offset += n;
                    self.len -= n;
                    if self.offset == chunk_len {
                        self.chunks.pop_front();
                        self.offset = 0;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(written),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Err(e),
            }
        };

        self.update_saturation();
        result
    }

    fn update_saturation(&mut self) {
        if self.len >= self.limits.high {
            self.saturated = true;
        } else if self.len <= self.limits.low {
            self.saturated = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Sink accepting at most `chunk` bytes per call and `capacity` in total
    /// before reporting `WouldBlock`.
    struct Throttled {
        data: Vec<u8>,
        chunk: usize,
        capacity: usize,
    }

    impl Write for Throttled {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.capacity == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.chunk).min(self.capacity);
            self.data.extend_from_slice(&buf[..n]);
            self.capacity -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn limits(low: usize, high: usize) -> Watermarks {
        Watermarks::new(low, high).unwrap()
    }

    #[test]
    fn test_watermarks_validation() {
        assert!(Watermarks::new(10, 10).is_err());
        assert!(Watermarks::new(20, 10).is_err());
        assert!(Watermarks::new(0, 0).is_err());
        assert!(Watermarks::new(0, 1).is_ok());
    }

    #[test]
    fn test_partial_writes_keep_remainder() {
        let mut queue = TransferQueue::new(Watermarks::default());
        queue.push(b"hello ".to_vec());
        queue.push(b"world".to_vec());

        let mut sink = Throttled {
            data: Vec::new(),
            chunk: 4,
            capacity: 7,
        };
        assert_eq!(queue.write_to(&mut sink).unwrap(), 7);
        assert_eq!(queue.len(), 4);

        sink.capacity = usize::MAX;
        assert_eq!(queue.write_to(&mut sink).unwrap(), 4);
        assert!(queue.is_empty());
        assert_eq!(sink.data, b"hello world");
    }

    #[test]
    fn test_saturation_hysteresis() {
        let mut queue = TransferQueue::new(limits(4, 10));
        queue.push(vec![0; 6]);
        assert!(!queue.is_saturated());
        queue.push(vec![0; 6]);
        assert!(queue.is_saturated());

        // Draining to 6 bytes is still above the low watermark
        let mut sink = Throttled {
            data: Vec::new(),
            chunk: 100,
            capacity: 6,
        };
        queue.write_to(&mut sink).unwrap();
        assert_eq!(queue.len(), 6);
        assert!(queue.is_saturated());

        sink.capacity = 2;
        queue.write_to(&mut sink).unwrap();
        assert_eq!(queue.len(), 4);
        assert!(!queue.is_saturated());
    }

    #[test]
    fn test_empty_push_is_ignored() {
        let mut queue = TransferQueue::new(Watermarks::default());
        queue.push(Vec::new());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_write_zero_is_an_error() {
        struct Zero;
        impl Write for Zero {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Ok(0)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut queue = TransferQueue::new(Watermarks::default());
        queue.push(b"x".to_vec());
        let err = queue.write_to(&mut Zero).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
        assert_eq!(queue.len(), 1);
    }
}
