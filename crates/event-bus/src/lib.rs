//! Page event fan-out.
//!
//! A page produces one ordered stream of embedder-visible events (frame
//! attachments, navigations, request lifecycle, console output). Emission is
//! fire-and-forget: the producing event handler never blocks on listeners,
//! and a page with nobody listening is not an error. A listener that falls
//! behind the ring buffer skips the overwritten events and keeps going; the
//! skip count is surfaced so diagnostics can tell silence from loss.

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

/// Fan-out sender for one page's event stream.
///
/// Cheap to clone; all clones feed the same ring buffer.
pub struct EventBus<E> {
    sender: broadcast::Sender<E>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<E: Clone> EventBus<E> {
    /// `capacity` bounds how far a slow listener may lag before it starts
    /// missing events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes to every current listener. Never blocks, never fails.
    pub fn emit(&self, event: E) {
        let _ = self.sender.send(event);
    }

    /// Opens a stream positioned at the next event to be emitted.
    pub fn listen(&self) -> EventStream<E> {
        EventStream {
            rx: self.sender.subscribe(),
            missed: 0,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// One listener's view of the event stream.
pub struct EventStream<E> {
    rx: broadcast::Receiver<E>,
    missed: u64,
}

impl<E: Clone> EventStream<E> {
    /// Next event, in emission order. Yields `None` once every bus handle is
    /// gone. Events lost to lag are skipped, not surfaced as errors.
    pub async fn next(&mut self) -> Option<E> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    self.missed += skipped;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`EventStream::next`]; `None` means no event
    /// is currently buffered (or the bus is gone).
    pub fn try_next(&mut self) -> Option<E> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    self.missed += skipped;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Events this listener lost to ring-buffer lag so far.
    pub fn missed(&self) -> u64 {
        self.missed
    }
}
