//! Monotonic counters, optional JSON snapshot sink, and a minimal HTTP exposition endpoint.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use serde::Serialize;

/// Point-in-time snapshot of all counters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MetricsSnapshot {
    /// Count of bus-error / I/O failures observed by the monitor loop.
    pub bus_errors: u64,
    /// Count of monitor restarts (reconnect-loop re-entries).
    pub restarts: u64,
    /// Count of frames that failed to decode against the signal database.
    pub decoding_failures: u64,
}

/// Process-wide counter set. The only shared mutable state in this crate; every field is an
/// independent atomic so readers (the HTTP handler) never block writers (the monitor loop).
#[derive(Debug, Default)]
pub struct Metrics {
    bus_errors: AtomicU64,
    restarts: AtomicU64,
    decoding_failures: AtomicU64,
    sink: Mutex<Option<PathBuf>>,
}

impl Metrics {
    /// Creates a zeroed counter set with no JSON sink configured.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures a path that gets overwritten with the current JSON snapshot on every mutation.
    pub fn set_output_file(&self, path: Option<PathBuf>) {
        *self.sink.lock().unwrap() = path;
    }

    /// Increments `bus_errors` and rewrites the JSON sink, if configured.
    pub fn record_bus_error(&self) {
        self.bus_errors.fetch_add(1, Ordering::Relaxed);
        self.write_sink();
    }

    /// Increments `restarts` and rewrites the JSON sink, if configured.
    pub fn record_restart(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
        self.write_sink();
    }

    /// Increments `decoding_failures` and rewrites the JSON sink, if configured.
    pub fn record_decoding_failure(&self) {
        self.decoding_failures.fetch_add(1, Ordering::Relaxed);
        self.write_sink();
    }

    /// Reads the current values without mutating them.
    pub fn get_snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            bus_errors: self.bus_errors.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            decoding_failures: self.decoding_failures.load(Ordering::Relaxed),
        }
    }

    /// Zeroes every counter and rewrites the JSON sink, if configured.
    pub fn reset(&self) {
        self.bus_errors.store(0, Ordering::Relaxed);
        self.restarts.store(0, Ordering::Relaxed);
        self.decoding_failures.store(0, Ordering::Relaxed);
        self.write_sink();
    }

    fn write_sink(&self) {
        let guard = self.sink.lock().unwrap();
        if let Some(path) = guard.as_ref() {
            if let Ok(json) = serde_json::to_vec(&self.get_snapshot()) {
                let _ = std::fs::write(path, json);
            }
        }
    }

    /// Starts the HTTP exposition endpoint on `addr` (e.g. `"127.0.0.1:8000"`). Every `GET`
    /// request receives the current snapshot as a JSON body.
    pub fn start_http_server(
        self: &Arc<Self>,
        addr: &str,
    ) -> std::io::Result<MetricsServerHandle> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let metrics = self.clone();
        let shutdown = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let shutdown_flag = shutdown.clone();
        let worker = std::thread::spawn(move || {
            while !shutdown_flag.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, _)) => handle_connection(stream, &metrics),
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(std::time::Duration::from_millis(20));
                    }
                    Err(_) => break,
                }
            }
        });
        Ok(MetricsServerHandle {
            shutdown,
            worker: Some(worker),
        })
    }
}

fn handle_connection(mut stream: TcpStream, metrics: &Arc<Metrics>) {
    let mut buf = [0u8; 512];
    let _ = stream.read(&mut buf);
    let body = serde_json::to_string(&metrics.get_snapshot()).unwrap_or_default();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes());
}

/// Lifecycle handle for the metrics HTTP endpoint, replacing an ad-hoc module-level server
/// global with an explicit start/shutdown pair.
pub struct MetricsServerHandle {
    shutdown: Arc<std::sync::atomic::AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl MetricsServerHandle {
    /// Signals the accept loop to stop and waits for it to exit.
    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(w) = self.worker.take() {
            let _ = w.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_monotonic_until_reset() {
        let m = Metrics::new();
        m.record_bus_error();
        m.record_bus_error();
        m.record_restart();
        let snap = m.get_snapshot();
        assert_eq!(snap.bus_errors, 2);
        assert_eq!(snap.restarts, 1);
        m.reset();
        assert_eq!(m.get_snapshot().bus_errors, 0);
    }

    #[test]
    fn json_sink_is_rewritten_on_mutation() {
        let m = Metrics::new();
        let f = tempfile::NamedTempFile::new().unwrap();
        m.set_output_file(Some(f.path().to_path_buf()));
        m.record_decoding_failure();
        let contents = std::fs::read_to_string(f.path()).unwrap();
        assert!(contents.contains("\"decoding_failures\":1"));
    }

    #[test]
    fn http_endpoint_starts_and_shuts_down_cleanly() {
        let metrics = Arc::new(Metrics::new());
        metrics.record_bus_error();
        let handle = metrics.start_http_server("127.0.0.1:0").unwrap();
        handle.shutdown();
    }
}
