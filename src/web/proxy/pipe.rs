// Bounded single-producer/single-consumer pipe with cooperative cancellation

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};

/// How often a blocked reader or writer re-checks for cancellation.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default number of messages buffered between writer and reader.
pub const PIPE_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("pipe broken: reader closed")]
pub struct PipeClosed;

struct Shared {
    reader_closed: AtomicBool,
}

/// Producer side. Dropping it ends the stream.
pub struct PipeWriter<T> {
    tx: Sender<T>,
    shared: Arc<Shared>,
    poll: Duration,
}

/// Consumer side. Dropping it (or calling `close`) breaks the pipe for the
/// writer.
pub struct PipeReader<T> {
    rx: Receiver<T>,
    shared: Arc<Shared>,
    poll: Duration,
}

pub fn pipe<T>(capacity: usize) -> (PipeWriter<T>, PipeReader<T>) {
    pipe_with_poll(capacity, POLL_INTERVAL)
}

pub fn pipe_with_poll<T>(capacity: usize, poll: Duration) -> (PipeWriter<T>, PipeReader<T>) {
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    let shared = Arc::new(Shared {
        reader_closed: AtomicBool::new(false),
    });
    (
        PipeWriter {
            tx,
            shared: Arc::clone(&shared),
            poll,
        },
        PipeReader { rx, shared, poll },
    )
}

impl<T> PipeWriter<T> {
    /// Queue one message, blocking while the pipe is full. Fails once the
    /// reader is gone.
    pub fn write(&self, item: T) -> Result<(), PipeClosed> {
        let mut item = item;
        loop {
            if self.is_reader_closed() {
                return Err(PipeClosed);
            }
            match self.tx.send_timeout(item, self.poll) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(back)) => item = back,
                Err(SendTimeoutError::Disconnected(_)) => return Err(PipeClosed),
            }
        }
    }

    pub fn is_reader_closed(&self) -> bool {
        self.shared.reader_closed.load(Ordering::Acquire)
    }
}

impl<T> PipeReader<T> {
    /// Next message, or `None` at end of stream or once `should_stop`
    /// returns true (which also closes the pipe).
    pub fn read(&self, should_stop: &dyn Fn() -> bool) -> Option<T> {
        loop {
            if should_stop() {
                self.close();
                return None;
            }
            match self.rx.recv_timeout(self.poll) {
                Ok(item) => return Some(item),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    pub fn close(&self) {
        self.shared.reader_closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.reader_closed.load(Ordering::Acquire)
    }
}

impl<T> Drop for PipeReader<T> {
    fn drop(&mut self) {
        self.close();
    }
}
