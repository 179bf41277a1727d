//! Shared helpers for the integration test suite: a minimal in-process
//! NBD server good enough to exercise the real `NbdBackendConnection`
//! over a real TCP socket, the way `demos/nbd_backend.rs` does.

use byteorder::{BigEndian, WriteBytesExt};
use once_cell::sync::Lazy;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU16, Ordering};
use vscsi_adapter::nbd::{self, NBD_MAGIC, NBD_OLD_STYLE_MAGIC};

/// Hands out distinct localhost ports across test threads so concurrently
/// running tests never race for the same listener.
static NEXT_PORT: Lazy<AtomicU16> = Lazy::new(|| AtomicU16::new(17_000));

pub fn reserve_port() -> u16 {
    NEXT_PORT.fetch_add(1, Ordering::Relaxed)
}

/// What the mock server does once the handshake completes, per test.
pub enum MockBehavior {
    /// Fills every read reply's payload with `fill_byte` and acks every
    /// write/flush/trim with error = 0.
    EchoFill(u8),
    /// Replies to the very first request with a handle nobody asked for,
    /// to exercise the unknown-tag hard-termination path.
    UnknownTagOnce,
}

/// Starts a one-shot mock NBD server on `port`, advertising `export_size`
/// bytes, and returns once it has started listening (so the caller's
/// `Create` can connect immediately after).
pub fn spawn_mock_server(port: u16, export_size: u64, behavior: MockBehavior) {
    let listener = TcpListener::bind(("127.0.0.1", port)).expect("bind mock NBD server");
    std::thread::spawn(move || {
        let (mut stream, _) = match listener.accept() {
            Ok(pair) => pair,
            Err(_) => return,
        };

        let mut handshake = Vec::with_capacity(nbd::HANDSHAKE_SIZE);
        handshake.write_u64::<BigEndian>(NBD_MAGIC).unwrap();
        handshake.write_u64::<BigEndian>(NBD_OLD_STYLE_MAGIC).unwrap();
        handshake.write_u64::<BigEndian>(export_size).unwrap();
        handshake
            .write_u16::<BigEndian>(
                nbd::handshake_flags::HAS_FLAGS | nbd::handshake_flags::SEND_FLUSH,
            )
            .unwrap();
        handshake.extend_from_slice(&[0u8; 124]);
        if stream.write_all(&handshake).is_err() {
            return;
        }

        let mut first = true;
        loop {
            let mut header = [0u8; nbd::REQUEST_HEADER_SIZE];
            if stream.read_exact(&mut header).is_err() {
                return;
            }
            let request_type = u16::from_be_bytes([header[6], header[7]]);
            let handle = u64::from_be_bytes(header[8..16].try_into().unwrap());
            let length = u32::from_be_bytes(header[24..28].try_into().unwrap());

            if request_type == nbd::request_type::WRITE {
                let mut payload = vec![0u8; length as usize];
                if stream.read_exact(&mut payload).is_err() {
                    return;
                }
            }

            let reply_handle = match behavior {
                MockBehavior::UnknownTagOnce if first => handle.wrapping_add(0xDEAD_BEEF),
                _ => handle,
            };
            first = false;

            let mut reply = Vec::with_capacity(nbd::REPLY_HEADER_SIZE + length as usize);
            reply.write_u32::<BigEndian>(nbd::NBD_REPLY_MAGIC).unwrap();
            reply.write_u32::<BigEndian>(0).unwrap();
            reply.write_u64::<BigEndian>(reply_handle).unwrap();
            if request_type == nbd::request_type::READ {
                if let MockBehavior::EchoFill(fill) = behavior {
                    reply.extend(std::iter::repeat(fill).take(length as usize));
                } else {
                    reply.extend(std::iter::repeat(0u8).take(length as usize));
                }
            }
            if stream.write_all(&reply).is_err() {
                return;
            }
        }
    });
    // Give the listener a moment to come up before the caller dials out.
    std::thread::sleep(std::time::Duration::from_millis(20));
}

/// Connects and immediately drops a TCP stream, only used to confirm a
/// port is free before reuse across tests (best effort; not required for
/// correctness since ports are never reused within a test run).
#[allow(dead_code)]
pub fn port_is_free(port: u16) -> bool {
    TcpStream::connect(("127.0.0.1", port)).is_err()
}
