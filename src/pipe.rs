//! Pipes: bounded in-memory byte queues exposed as files.
//!
//! A pipe is a [`Queue`] of bytes plus a closed flag. Readers and writers
//! block byte-by-byte; closing the writing side poisons the queue so readers
//! drain what is left and then observe end-of-file.

use std::sync::Arc;

use crate::errno::{Errno, KResult};
use crate::sync::{MAX_DELAY_MS, Queue};

/// Default capacity of a pipe's byte queue.
pub const DEFAULT_PIPE_CAPACITY: usize = 128;

/// A bounded byte pipe.
#[derive(Debug, Clone)]
pub struct Pipe {
    queue: Arc<Queue<u8>>,
}

impl Pipe {
    /// Create a pipe buffering at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Pipe {
            queue: Arc::new(Queue::new(capacity)),
        }
    }

    /// Write `buf` into the pipe, blocking until every byte is queued.
    ///
    /// Returns [`Errno::Pipe`] once the pipe is closed; bytes queued before
    /// the close stay readable.
    pub fn write(&self, buf: &[u8]) -> KResult<usize> {
        for (i, byte) in buf.iter().enumerate() {
            match self.queue.send(*byte, MAX_DELAY_MS) {
                Ok(()) => {}
                Err(Errno::Pipe) if i > 0 => return Ok(i),
                Err(err) => return Err(err),
            }
        }
        Ok(buf.len())
    }

    /// Read up to `buf.len()` bytes, blocking for at least the first byte.
    ///
    /// Returns 0 at end-of-file (pipe closed and drained).
    pub fn read(&self, buf: &mut [u8]) -> KResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        for (i, slot) in buf.iter_mut().enumerate() {
            match self.queue.receive(MAX_DELAY_MS) {
                Ok(byte) => *slot = byte,
                Err(Errno::Pipe) => return Ok(i),
                Err(err) => return Err(err),
            }
        }
        Ok(buf.len())
    }

    /// Non-blocking read: drain whatever is buffered.
    ///
    /// Returns [`Errno::Again`] when nothing is buffered and the pipe is
    /// still open; 0 at end-of-file.
    pub fn read_nonblocking(&self, buf: &mut [u8]) -> KResult<usize> {
        let mut n = 0;
        for slot in buf.iter_mut() {
            match self.queue.try_receive() {
                Ok(byte) => {
                    *slot = byte;
                    n += 1;
                }
                Err(Errno::Pipe) => return Ok(n),
                Err(Errno::Again) if n == 0 && !buf.is_empty() => return Err(Errno::Again),
                Err(Errno::Again) => break,
                Err(err) => return Err(err),
            }
        }
        Ok(n)
    }

    /// Non-blocking write: queue as many bytes as fit right now.
    ///
    /// Returns [`Errno::Again`] when the queue is full and nothing at all
    /// could be written.
    pub fn write_nonblocking(&self, buf: &[u8]) -> KResult<usize> {
        let mut n = 0;
        for byte in buf {
            match self.queue.try_send(*byte) {
                Ok(()) => n += 1,
                Err(Errno::Again) if n == 0 => return Err(Errno::Again),
                Err(Errno::Again) => break,
                Err(Errno::Pipe) if n > 0 => break,
                Err(err) => return Err(err),
            }
        }
        Ok(n)
    }

    /// Close the pipe: wake blocked peers, fail further writes.
    pub fn close(&self) {
        self.queue.poison();
    }

    /// Whether the pipe has been closed.
    pub fn is_closed(&self) -> bool {
        self.queue.is_poisoned()
    }

    /// Bytes currently buffered; pipe `fstat` reports this as the size.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether the pipe buffers no bytes.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl Default for Pipe {
    fn default() -> Self {
        Pipe::new(DEFAULT_PIPE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn write_then_read_round_trips() {
        let pipe = Pipe::new(8);
        assert_eq!(pipe.write(b"hello").unwrap(), 5);
        assert_eq!(pipe.len(), 5);
        let mut buf = [0u8; 5];
        assert_eq!(pipe.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn close_surfaces_eof_after_drain() {
        let pipe = Pipe::new(8);
        pipe.write(b"xy").unwrap();
        pipe.close();
        let mut buf = [0u8; 4];
        assert_eq!(pipe.read(&mut buf).unwrap(), 2);
        assert_eq!(pipe.read(&mut buf).unwrap(), 0);
        assert_eq!(pipe.write(b"z").unwrap_err(), Errno::Pipe);
    }

    #[test]
    fn blocked_reader_wakes_on_close() {
        let pipe = Pipe::new(4);
        let reader = {
            let pipe = pipe.clone();
            thread::spawn(move || {
                let mut buf = [0u8; 1];
                pipe.read(&mut buf).unwrap()
            })
        };
        thread::sleep(std::time::Duration::from_millis(20));
        pipe.close();
        assert_eq!(reader.join().unwrap(), 0);
    }
}
