//! NBD (Network Block Device) old-style wire protocol
//!
//! Covers just enough of the protocol for this core to act as an NBD
//! client: the fixed-newstyle-free old handshake, and the request/reply
//! frame pair used for every I/O once the handshake completes. Byte
//! layouts follow the NBD protocol document; field order and sizes below
//! are exact, not approximate.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};

/// First 8 bytes of every old-style handshake.
pub const NBD_MAGIC: u64 = 0x4e42444d41474943;
/// Second 8 bytes, identifying the (non fixed-newstyle) old handshake.
pub const NBD_OLD_STYLE_MAGIC: u64 = 0x00420281861253;
/// Request frame magic (`NBD_REQUEST_MAGIC`).
pub const NBD_REQUEST_MAGIC: u32 = 0x25609513;
/// Reply frame magic (`NBD_REPLY_MAGIC`).
pub const NBD_REPLY_MAGIC: u32 = 0x67446698;

/// Bytes of zero padding after the handshake's flags field.
const HANDSHAKE_RESERVED_LEN: usize = 124;
/// Total on-wire size of the old-style handshake.
pub const HANDSHAKE_SIZE: usize = 8 + 8 + 8 + 2 + HANDSHAKE_RESERVED_LEN;
/// On-wire size of a request header, not counting a write's payload.
pub const REQUEST_HEADER_SIZE: usize = 28;
/// On-wire size of a reply header, not counting a read's payload.
pub const REPLY_HEADER_SIZE: usize = 16;

pub mod handshake_flags {
    pub const HAS_FLAGS: u16 = 1 << 0;
    pub const READ_ONLY: u16 = 1 << 1;
    pub const SEND_FLUSH: u16 = 1 << 2;
    pub const SEND_FUA: u16 = 1 << 3;
    pub const ROTATIONAL: u16 = 1 << 4;
    pub const SEND_TRIM: u16 = 1 << 5;
}

pub mod request_type {
    pub const READ: u16 = 0;
    pub const WRITE: u16 = 1;
    pub const DISCONNECT: u16 = 2;
    pub const FLUSH: u16 = 3;
    pub const TRIM: u16 = 4;
}

/// Negotiated parameters an NBD old-style handshake hands back: export
/// size and the flags the server advertises (read-only, flush/FUA/trim
/// support).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NbdHandshakeResult {
    pub size: u64,
    pub flags: u16,
}

impl NbdHandshakeResult {
    pub fn is_read_only(&self) -> bool {
        self.flags & handshake_flags::READ_ONLY != 0
    }

    pub fn supports_flush(&self) -> bool {
        self.flags & handshake_flags::SEND_FLUSH != 0
    }

    pub fn supports_fua(&self) -> bool {
        self.flags & handshake_flags::SEND_FUA != 0
    }

    pub fn supports_trim(&self) -> bool {
        self.flags & handshake_flags::SEND_TRIM != 0
    }
}

/// Reads exactly `buf.len()` bytes, retrying across short reads. NBD
/// sockets are ordinary TCP streams: a single `read()` may return fewer
/// bytes than requested even though more are on the way.
pub fn read_exact_retrying<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<()> {
    reader.read_exact(buf)
}

/// Writes the full buffer, retrying across short writes.
pub fn write_all_retrying<W: Write>(writer: &mut W, buf: &[u8]) -> io::Result<()> {
    writer.write_all(buf)
}

/// Performs the NBD old-style handshake as a client and returns the
/// negotiated export size and flags. Skips straight past negotiation
/// (returning a handshake of the caller-supplied size/flags) when
/// `skip_negotiation` is set, matching the connection-property flag
/// that lets a known-good export bypass the exchange entirely.
pub fn negotiate<S: Read + Write>(stream: &mut S) -> io::Result<NbdHandshakeResult> {
    let mut buf = [0u8; HANDSHAKE_SIZE];
    read_exact_retrying(stream, &mut buf)?;
    let mut cursor = Cursor::new(&buf[..]);

    let magic = cursor.read_u64::<BigEndian>()?;
    if magic != NBD_MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "bad NBD magic in handshake",
        ));
    }
    let old_style_magic = cursor.read_u64::<BigEndian>()?;
    if old_style_magic != NBD_OLD_STYLE_MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "server does not speak old-style NBD negotiation",
        ));
    }
    let size = cursor.read_u64::<BigEndian>()?;
    let flags = cursor.read_u16::<BigEndian>()?;
    Ok(NbdHandshakeResult { size, flags })
}

/// One outbound request frame.
#[derive(Debug, Clone)]
pub struct NbdRequest {
    pub flags: u16,
    pub request_type: u16,
    pub handle: u64,
    pub offset: u64,
    pub length: u32,
    pub payload: Option<Vec<u8>>,
}

impl NbdRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(REQUEST_HEADER_SIZE + self.payload_len());
        out.write_u32::<BigEndian>(NBD_REQUEST_MAGIC).unwrap();
        out.write_u16::<BigEndian>(self.flags).unwrap();
        out.write_u16::<BigEndian>(self.request_type).unwrap();
        out.write_u64::<BigEndian>(self.handle).unwrap();
        out.write_u64::<BigEndian>(self.offset).unwrap();
        out.write_u32::<BigEndian>(self.length).unwrap();
        if let Some(payload) = &self.payload {
            out.extend_from_slice(payload);
        }
        out
    }

    fn payload_len(&self) -> usize {
        self.payload.as_ref().map(|p| p.len()).unwrap_or(0)
    }

    pub fn read(handle: u64, offset: u64, length: u32) -> Self {
        NbdRequest {
            flags: 0,
            request_type: request_type::READ,
            handle,
            offset,
            length,
            payload: None,
        }
    }

    pub fn write(handle: u64, offset: u64, data: Vec<u8>, fua: bool) -> Self {
        let length = data.len() as u32;
        NbdRequest {
            flags: if fua { handshake_flags::SEND_FUA } else { 0 },
            request_type: request_type::WRITE,
            handle,
            offset,
            length,
            payload: Some(data),
        }
    }

    pub fn flush(handle: u64) -> Self {
        NbdRequest {
            flags: 0,
            request_type: request_type::FLUSH,
            handle,
            offset: 0,
            length: 0,
            payload: None,
        }
    }

    pub fn trim(handle: u64, offset: u64, length: u32) -> Self {
        NbdRequest {
            flags: 0,
            request_type: request_type::TRIM,
            handle,
            offset,
            length,
            payload: None,
        }
    }
}

/// One inbound reply frame, with its read payload (if any) attached.
#[derive(Debug, Clone)]
pub struct NbdReply {
    pub error: u32,
    pub handle: u64,
    pub payload: Vec<u8>,
}

impl NbdReply {
    /// Reads one reply header off the wire, then `expected_payload_len`
    /// bytes of payload if the header indicates success. The caller
    /// supplies the expected length because the reply header itself
    /// carries no length field; it is implied by the outstanding
    /// request the handle is matched against.
    pub fn decode<R: Read>(reader: &mut R, expected_payload_len: usize) -> io::Result<Self> {
        let header = NbdReplyHeader::decode(reader)?;
        let payload = if header.error == 0 && expected_payload_len > 0 {
            read_payload(reader, expected_payload_len)?
        } else {
            Vec::new()
        };
        Ok(NbdReply {
            error: header.error,
            handle: header.handle,
            payload,
        })
    }
}

/// Just the fixed-size part of a reply: magic, error and handle. Decoded
/// on its own because the payload length isn't known until the handle is
/// matched against the Submitted queue, which can only happen after the
/// header is in hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NbdReplyHeader {
    pub error: u32,
    pub handle: u64,
}

impl NbdReplyHeader {
    pub fn decode<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut header = [0u8; REPLY_HEADER_SIZE];
        read_exact_retrying(reader, &mut header)?;
        let mut cursor = Cursor::new(&header[..]);
        let magic = cursor.read_u32::<BigEndian>()?;
        if magic != NBD_REPLY_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "bad NBD reply magic",
            ));
        }
        let error = cursor.read_u32::<BigEndian>()?;
        let handle = cursor.read_u64::<BigEndian>()?;
        Ok(NbdReplyHeader { error, handle })
    }
}

/// Reads a reply's read-payload once its length is known from the
/// matched request.
pub fn read_payload<R: Read>(reader: &mut R, len: usize) -> io::Result<Vec<u8>> {
    let mut payload = vec![0u8; len];
    read_exact_retrying(reader, &mut payload)?;
    Ok(payload)
}
