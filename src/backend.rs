//! Backend connection abstraction for NBD-mode devices
//!
//! A device engine never talks to a raw socket directly: it goes through
//! a `BackendConnection`, so tests can swap in an in-memory double
//! without opening real TCP connections.

use crate::error::{AdapterError, AdapterResult};
use crate::nbd::{self, NbdReplyHeader, NbdRequest};
use std::io::Write;
use std::net::TcpStream;
use std::sync::Mutex;

/// What a device engine needs from its NBD transport: send one request,
/// receive one reply, and close cleanly on teardown. Read/write/flush/
/// unmap all funnel through `send_request` — the engine builds the
/// `NbdRequest`, the connection just moves bytes.
///
/// The reply side is split into header and payload because the payload
/// length isn't known until the header's handle is matched against the
/// Submitted queue: `receive_reply_header` blocks for the next 16-byte
/// reply, `receive_reply_payload` then reads exactly the read-payload
/// the matched request expects.
pub trait BackendConnection: Send + Sync {
    fn send_request(&self, request: &NbdRequest) -> AdapterResult<()>;
    fn receive_reply_header(&self) -> AdapterResult<NbdReplyHeader>;
    fn receive_reply_payload(&self, len: usize) -> AdapterResult<Vec<u8>>;
    fn close(&self);
}

/// A `BackendConnection` backed by a real TCP socket to an NBD server.
pub struct NbdBackendConnection {
    stream: Mutex<TcpStream>,
}

impl NbdBackendConnection {
    /// Connects and performs the old-style handshake. `skip_negotiation`
    /// bypasses the handshake read entirely, trusting the caller-supplied
    /// export size/flags instead (used when a connection property says
    /// the export is already known-good).
    pub fn connect(
        hostname: &str,
        port: u16,
        skip_negotiation: bool,
    ) -> AdapterResult<(Self, Option<nbd::NbdHandshakeResult>)> {
        let stream = TcpStream::connect((hostname, port))
            .map_err(|e| AdapterError::ConnectionRefused(e.to_string()))?;
        let mut handshake_stream = stream
            .try_clone()
            .map_err(|e| AdapterError::ConnectionRefused(e.to_string()))?;

        let handshake = if skip_negotiation {
            None
        } else {
            Some(
                nbd::negotiate(&mut handshake_stream)
                    .map_err(|e| AdapterError::NegotiationFailed(e.to_string()))?,
            )
        };

        Ok((
            NbdBackendConnection {
                stream: Mutex::new(stream),
            },
            handshake,
        ))
    }
}

impl BackendConnection for NbdBackendConnection {
    fn send_request(&self, request: &NbdRequest) -> AdapterResult<()> {
        let mut stream = self.stream.lock().unwrap();
        let bytes = request.encode();
        stream
            .write_all(&bytes)
            .map_err(|e| AdapterError::ConnectionLost(e.to_string()))
    }

    fn receive_reply_header(&self) -> AdapterResult<NbdReplyHeader> {
        let mut stream = self.stream.lock().unwrap();
        NbdReplyHeader::decode(&mut *stream).map_err(|e| AdapterError::ConnectionLost(e.to_string()))
    }

    fn receive_reply_payload(&self, len: usize) -> AdapterResult<Vec<u8>> {
        let mut stream = self.stream.lock().unwrap();
        nbd::read_payload(&mut *stream, len).map_err(|e| AdapterError::ConnectionLost(e.to_string()))
    }

    fn close(&self) {
        if let Ok(stream) = self.stream.lock() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }
}

/// A reply queued onto a `LoopbackBackendConnection`, split the same way
/// a real reply ends up on the wire: a header available immediately, and
/// a payload that `receive_reply_payload` yields separately.
#[cfg(test)]
#[derive(Debug, Clone)]
pub struct QueuedReply {
    pub error: u32,
    pub handle: u64,
    pub payload: Vec<u8>,
}

/// Reads and writes against in-memory queues, for tests that need a
/// `BackendConnection` without a real socket. Not used outside tests.
#[cfg(test)]
pub struct LoopbackBackendConnection {
    pub sent: Mutex<Vec<NbdRequest>>,
    replies: Mutex<std::collections::VecDeque<QueuedReply>>,
    current: Mutex<Option<QueuedReply>>,
}

#[cfg(test)]
impl LoopbackBackendConnection {
    pub fn new() -> Self {
        LoopbackBackendConnection {
            sent: Mutex::new(Vec::new()),
            replies: Mutex::new(std::collections::VecDeque::new()),
            current: Mutex::new(None),
        }
    }

    pub fn queue_reply(&self, reply: QueuedReply) {
        self.replies.lock().unwrap().push_back(reply);
    }
}

#[cfg(test)]
impl BackendConnection for LoopbackBackendConnection {
    fn send_request(&self, request: &NbdRequest) -> AdapterResult<()> {
        self.sent.lock().unwrap().push(request.clone());
        Ok(())
    }

    fn receive_reply_header(&self) -> AdapterResult<NbdReplyHeader> {
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| AdapterError::ConnectionLost("no reply queued".into()))?;
        let header = NbdReplyHeader {
            error: reply.error,
            handle: reply.handle,
        };
        *self.current.lock().unwrap() = Some(reply);
        Ok(header)
    }

    fn receive_reply_payload(&self, len: usize) -> AdapterResult<Vec<u8>> {
        let reply = self
            .current
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| AdapterError::ConnectionLost("no reply header read yet".into()))?;
        let mut payload = reply.payload;
        payload.truncate(len);
        Ok(payload)
    }

    fn close(&self) {}
}
