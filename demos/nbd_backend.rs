//! Example of an NBD-backed device: the demo spins up a tiny in-process
//! NBD server (old-style handshake, one export) on localhost so the
//! example runs without any external dependency, then creates a device
//! that dials out to it.
//!
//! Point `Create`'s NBD properties at a real server (qemu-nbd, nbdkit,
//! ...) instead of `mock_nbd_server` to exercise this against the real
//! thing.

use byteorder::{BigEndian, WriteBytesExt};
use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;
use vscsi_adapter::nbd::{self, NBD_MAGIC, NBD_OLD_STYLE_MAGIC};
use vscsi_adapter::{
    AdapterConfig, CleanerThread, ControlPlane, DeviceIdentifier, DeviceProperties,
    NbdConnectionProperties,
};

const EXPORT_SIZE: u64 = 1024 * 1024;

/// Serves exactly one client connection: the old-style handshake
/// advertising `EXPORT_SIZE`, then answers every read with `0xAB` bytes
/// and every write/flush/trim with success (error = 0).
fn mock_nbd_server(listener: TcpListener) {
    let (mut stream, _) = listener.accept().expect("accept");

    let mut handshake = Vec::with_capacity(nbd::HANDSHAKE_SIZE);
    handshake.write_u64::<BigEndian>(NBD_MAGIC).unwrap();
    handshake.write_u64::<BigEndian>(NBD_OLD_STYLE_MAGIC).unwrap();
    handshake.write_u64::<BigEndian>(EXPORT_SIZE).unwrap();
    handshake
        .write_u16::<BigEndian>(nbd::handshake_flags::HAS_FLAGS | nbd::handshake_flags::SEND_FLUSH)
        .unwrap();
    handshake.extend_from_slice(&[0u8; 124]);
    stream.write_all(&handshake).unwrap();

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

        let mut reply = Vec::with_capacity(nbd::REPLY_HEADER_SIZE + length as usize);
        reply.write_u32::<BigEndian>(nbd::NBD_REPLY_MAGIC).unwrap();
        reply.write_u32::<BigEndian>(0).unwrap(); // error
        reply.write_u64::<BigEndian>(handle).unwrap();
        if request_type == nbd::request_type::READ {
            reply.extend(std::iter::repeat(0xABu8).take(length as usize));
        }
        if stream.write_all(&reply).is_err() {
            return;
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    std::thread::spawn(move || mock_nbd_server(listener));

    let control = Arc::new(ControlPlane::new(AdapterConfig::default(), None));
    let cleaner = CleanerThread::start(Arc::clone(&control), Duration::from_secs(5));

    let properties = DeviceProperties {
        instance_name: "nbd-disk0".into(),
        serial_number: String::new(),
        owner: "nbd_backend demo".into(),
        flags: vscsi_adapter::DeviceFlags::default(),
        block_count: EXPORT_SIZE / 512,
        block_size: 512,
        max_unmap_descriptor_count: 1,
        max_transfer_length: 2 * 1024 * 1024,
        max_outstanding_io: 1024,
        pid: None,
    };
    let nbd_properties = NbdConnectionProperties {
        hostname: "127.0.0.1".into(),
        port,
        export_name: "demo".into(),
        skip_negotiation: false,
    };

    let info = control.create(properties, Some(nbd_properties))?;
    println!(
        "created nbd-disk0 at bus {} target {} lun {}, negotiated {} bytes",
        info.bus_number,
        info.target_id,
        info.lun,
        info.properties.capacity_bytes()
    );

    let id = DeviceIdentifier::InstanceName("nbd-disk0".to_string());
    let read_cdb = [0x28, 0, 0, 0, 0, 0, 0, 0, 1, 0]; // READ(10) lba=0, 1 block
    let rx = control.submit_cdb(&id, &read_cdb, None)?;
    let result = rx.recv()?;
    println!(
        "read completed: {:?}, first byte {:#x}",
        result.status, result.data[0]
    );

    control.remove(&id, false)?;
    cleaner.stop();
    // The mock server thread unblocks from its read once `remove` closes
    // the socket; it isn't joined, since the process is about to exit.
    Ok(())
}
