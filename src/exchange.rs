//! The transport seam.
//!
//! The container never touches sockets. A transport (the hyper adapter in
//! [`server`](crate::Server), or [`RecordingExchange`] in tests) hands each
//! request over together with an [`Exchange`]: the write side of that one
//! HTTP exchange.

use std::io;
use std::sync::Arc;

use http::{HeaderMap, StatusCode};
use parking_lot::Mutex;

/// How the body following the head is delimited.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Framing {
    /// No body at all (`Content-Length: 0`).
    Empty,
    /// Exactly this many bytes follow.
    Fixed(u64),
    /// Length unknown up front; chunked (HTTP/1.1) or streamed (HTTP/2).
    Chunked,
}

/// Write side of one HTTP exchange, as provided by the transport.
///
/// The container calls `send_head` at most once, then any number of
/// `write_body`, then `close` (possibly more than once; the transport
/// should ignore repeats).
pub trait Exchange: Send {
    fn send_head(&mut self, status: StatusCode, headers: &HeaderMap, framing: Framing) -> io::Result<()>;
    fn write_body(&mut self, chunk: &[u8]) -> io::Result<()>;
    fn close(&mut self) -> io::Result<()>;
}

/// Everything an exchange received, as seen by a [`RecordingExchange`].
#[derive(Clone, Debug, Default)]
pub struct Recorded {
    pub status: Option<StatusCode>,
    pub headers: HeaderMap,
    pub framing: Option<Framing>,
    pub body: Vec<u8>,
    /// Number of `send_head` calls; a correct response commits exactly once.
    pub heads_sent: usize,
    pub closed: bool,
}

impl Recorded {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn header_all(&self, name: &str) -> Vec<&str> {
        self.headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect()
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// In-memory [`Exchange`] that records what the container sent.
///
/// Cloning shares the record, so a test keeps one clone and hands the other
/// to the container.
#[derive(Clone, Debug, Default)]
pub struct RecordingExchange {
    record: Arc<Mutex<Recorded>>,
}

impl RecordingExchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of everything recorded so far.
    pub fn snapshot(&self) -> Recorded {
        self.record.lock().clone()
    }
}

impl Exchange for RecordingExchange {
    fn send_head(&mut self, status: StatusCode, headers: &HeaderMap, framing: Framing) -> io::Result<()> {
        let mut record = self.record.lock();
        record.heads_sent += 1;
        record.status = Some(status);
        record.headers = headers.clone();
        record.framing = Some(framing);
        Ok(())
    }

    fn write_body(&mut self, chunk: &[u8]) -> io::Result<()> {
        let mut record = self.record.lock();
        if record.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "exchange closed"));
        }
        record.body.extend_from_slice(chunk);
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.record.lock().closed = true;
        Ok(())
    }
}
