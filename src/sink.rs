//! Event sink abstraction.
//!
//! A sink is a non-owning handle to some subscriber's event consumer. The
//! coordinator pushes typed events into it and must keep working when the
//! consumer has gone away, so `push` reports delivery as a bool instead of
//! an error.

use tokio::sync::mpsc;

/// An abstract destination for a stream of asynchronously produced events.
///
/// Implementations must be cheap to call from the coordinator's event loop;
/// `push` must not block.
pub trait EventSink<T>: Send {
    /// Delivers one event. Returns false when the consumer is no longer
    /// listening, in which case the coordinator drops the event.
    fn push(&self, event: T) -> bool;
}

/// The in-process consumer: the subscriber holds the receiver, the
/// coordinator holds this sender.
impl<T: Send> EventSink<T> for mpsc::UnboundedSender<T> {
    fn push(&self, event: T) -> bool {
        self.send(event).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_sender_push_reports_receiver_liveness() {
        let (tx, mut rx) = mpsc::unbounded_channel::<u32>();
        assert!(tx.push(7));
        assert_eq!(rx.try_recv().unwrap(), 7);

        drop(rx);
        assert!(!tx.push(8));
    }
}
