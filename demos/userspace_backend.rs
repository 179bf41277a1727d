//! Example of a user-space back-end device driven entirely through the
//! fetch-request / send-response control surface.
//!
//! This demonstrates how the optional counterpart process behind a
//! `use_nbd = false` device is meant to work: it loops calling
//! `ControlPlane::fetch_request`, serves each request out of its own
//! in-memory storage, and calls `ControlPlane::send_response` with the
//! outcome. No NBD server, no TCP socket — the whole back end lives in
//! this process.

use std::sync::Arc;
use std::time::Duration;
use vscsi_adapter::{
    AdapterConfig, CleanerThread, ControlPlane, DeviceFlags, DeviceIdentifier, DeviceProperties,
    RequestType, ScsiCompletionStatus,
};

/// In-memory storage the demo back end serves fetch-request calls from.
struct MemoryStorage {
    data: Vec<u8>,
    block_size: u32,
}

impl MemoryStorage {
    fn new(size_mb: usize, block_size: u32) -> Self {
        MemoryStorage {
            data: vec![0u8; size_mb * 1024 * 1024],
            block_size,
        }
    }

    fn read(&self, lba: u64, blocks: u32) -> Vec<u8> {
        let offset = (lba * self.block_size as u64) as usize;
        let len = (blocks * self.block_size) as usize;
        self.data[offset..offset + len].to_vec()
    }

    fn write(&mut self, lba: u64, data: &[u8]) {
        let offset = (lba * self.block_size as u64) as usize;
        self.data[offset..offset + data.len()].copy_from_slice(data);
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let control = Arc::new(ControlPlane::new(AdapterConfig::default(), None));
    let cleaner = CleanerThread::start(Arc::clone(&control), Duration::from_secs(5));

    control.create(
        DeviceProperties {
            instance_name: "userspace-disk0".into(),
            serial_number: String::new(),
            owner: "userspace_backend demo".into(),
            flags: DeviceFlags::default(),
            block_count: 100 * 1024 * 1024 / 512,
            block_size: 512,
            max_unmap_descriptor_count: 1,
            max_transfer_length: 2 * 1024 * 1024,
            max_outstanding_io: 1024,
            pid: std::process::id().into(),
        },
        None,
    )?;
    println!("created userspace-disk0 (100 MiB, 512-byte blocks)");

    let id = DeviceIdentifier::InstanceName("userspace-disk0".to_string());
    let mut storage = MemoryStorage::new(100, 512);

    // A real deployment has an external SCSI front end submitting CDBs;
    // this demo plays that role itself on a background thread so the
    // fetch-request/send-response loop below has something to serve.
    let submitter_control = Arc::clone(&control);
    let submitter_id = id.clone();
    let submitter = std::thread::spawn(move || {
        let write_cdb = [0x2A, 0, 0, 0, 0, 8, 0, 0, 1, 0]; // WRITE(10) lba=8, 1 block
        let write_data = vec![0x11u8; 512];
        let write_rx = submitter_control
            .submit_cdb(&submitter_id, &write_cdb, Some(&write_data))
            .expect("submit write");
        println!("write completed: {:?}", write_rx.recv().unwrap().status);

        let read_cdb = [0x28, 0, 0, 0, 0, 8, 0, 0, 1, 0]; // READ(10) lba=8, 1 block
        let read_rx = submitter_control
            .submit_cdb(&submitter_id, &read_cdb, None)
            .expect("submit read");
        let result = read_rx.recv().unwrap();
        println!("read completed: {:?}, first byte {:#x}", result.status, result.data[0]);
    });

    // The back end's own loop: fetch what the front end submitted, serve
    // it from local storage, report the outcome.
    for _ in 0..2 {
        let element = match control.fetch_request(&id, 4 * 1024 * 1024) {
            Ok(element) => element,
            Err(e) => {
                println!("fetch_request stopped: {e}");
                break;
            }
        };

        match element.request_type {
            RequestType::Read => {
                let data = storage.read(element.lba, element.blocks);
                control.send_response(&id, element.tag, ScsiCompletionStatus::Success, &data)?;
            }
            RequestType::Write => {
                let data = element.write_data.clone().unwrap_or_default();
                storage.write(element.lba, &data);
                control.send_response(&id, element.tag, ScsiCompletionStatus::Success, &[])?;
            }
            RequestType::Flush | RequestType::Unmap => {
                control.send_response(&id, element.tag, ScsiCompletionStatus::Success, &[])?;
            }
            RequestType::Unknown | RequestType::Disconnect => break,
        }
    }

    submitter.join().expect("submitter thread panicked");
    control.remove(&id, false)?;
    cleaner.stop();
    Ok(())
}
