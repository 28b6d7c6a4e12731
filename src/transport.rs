//! Retrying transport and the bounded producer/consumer queue that decouples the CAN receive
//! loop from outbound I/O.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::TransportError;
use crate::metrics::Metrics;

/// Capacity of the bounded queue between the monitor's receive loop and the transport worker.
pub const QUEUE_CAPACITY: usize = 1000;

/// A sink capable of sending one serialized record. Implementations are expected to be
/// blocking; [`RetryingTransport`] wraps one with retry/backoff.
pub trait Transport: Send {
    /// Attempts a single send. Returning `Err` triggers a retry (up to the configured count).
    fn send_once(&mut self, payload: &str) -> Result<(), String>;
}

/// Wraps a [`Transport`] with a fixed retry count and inter-attempt delay.
pub struct RetryingTransport<T: Transport> {
    inner: T,
    retries: u32,
    delay: Duration,
}

impl<T: Transport> RetryingTransport<T> {
    /// Wraps `inner`, retrying up to `retries` times with `delay` between attempts.
    pub fn new(inner: T, retries: u32, delay: Duration) -> Self {
        Self {
            inner,
            retries,
            delay,
        }
    }

    /// Sends `payload`, retrying on failure. Returns the last error once retries are exhausted.
    pub fn send(&mut self, payload: &str) -> Result<(), TransportError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.inner.send_once(payload) {
                Ok(()) => return Ok(()),
                Err(e) if attempts > self.retries => {
                    return Err(TransportError::RetriesExhausted {
                        attempts,
                        source: e,
                    });
                }
                Err(_) => std::thread::sleep(self.delay),
            }
        }
    }
}

/// An in-memory [`Transport`] double that records every payload it was asked to send.
/// Optionally fails the first `fail_n` attempts, to exercise [`RetryingTransport`]'s retry path.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Vec<String>,
    fail_next: usize,
}

impl RecordingTransport {
    /// A transport that always succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport whose first `fail_next` sends fail before succeeding.
    pub fn failing(fail_next: usize) -> Self {
        Self {
            sent: Vec::new(),
            fail_next,
        }
    }

    /// Every payload accepted so far.
    pub fn sent(&self) -> &[String] {
        &self.sent
    }
}

impl Transport for RecordingTransport {
    fn send_once(&mut self, payload: &str) -> Result<(), String> {
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err("simulated transport failure".to_string());
        }
        self.sent.push(payload.to_string());
        Ok(())
    }
}

/// Handle to the background worker thread draining the transport queue. Dropping the handle
/// does not stop the worker; call [`TransportHandle::shutdown`] to close the queue and join it,
/// ensuring every record already enqueued is attempted before the process exits.
pub struct TransportHandle {
    sender: Option<SyncSender<String>>,
    worker: Option<JoinHandle<()>>,
}

impl TransportHandle {
    /// Spawns a worker thread draining a bounded queue of [`QUEUE_CAPACITY`] through `transport`.
    pub fn spawn<T: Transport + 'static>(
        mut transport: RetryingTransport<T>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (sender, receiver): (SyncSender<String>, Receiver<String>) =
            sync_channel(QUEUE_CAPACITY);
        let worker = std::thread::spawn(move || {
            while let Ok(payload) = receiver.recv() {
                if transport.send(&payload).is_err() {
                    metrics.record_decoding_failure();
                }
            }
        });
        Self {
            sender: Some(sender),
            worker: Some(worker),
        }
    }

    /// Enqueues a record for transmission. Non-blocking: if the queue is full, the record is
    /// dropped and `false` is returned so the caller can log a warning and keep the CAN receive
    /// loop moving.
    pub fn try_enqueue(&self, payload: String) -> bool {
        let Some(sender) = &self.sender else {
            return false;
        };
        match sender.try_send(payload) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => false,
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Closes the queue and blocks until the worker has drained and attempted every record that
    /// was already enqueued.
    pub fn shutdown(mut self) {
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retrying_transport_gives_up_after_retries_exhausted() {
        let mut rt = RetryingTransport::new(
            RecordingTransport::failing(10),
            2,
            Duration::from_millis(1),
        );
        let err = rt.send("x").unwrap_err();
        assert!(matches!(err, TransportError::RetriesExhausted { attempts: 3, .. }));
    }

    #[test]
    fn retrying_transport_succeeds_after_transient_failures() {
        let mut rt = RetryingTransport::new(
            RecordingTransport::failing(2),
            5,
            Duration::from_millis(1),
        );
        rt.send("payload").unwrap();
    }

    #[test]
    fn handle_enqueues_and_delivers_in_order() {
        let metrics = Arc::new(Metrics::new());
        let handle = TransportHandle::spawn(
            RetryingTransport::new(RecordingTransport::new(), 0, Duration::from_millis(1)),
            metrics,
        );
        assert!(handle.try_enqueue("a".to_string()));
        assert!(handle.try_enqueue("b".to_string()));
        handle.shutdown();
    }
}
