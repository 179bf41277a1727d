//! End-to-end exercises of `ControlPlane`'s public surface against a real
//! TCP-backed NBD server and a simulated user-space back end.

mod common;

use common::{spawn_mock_server, MockBehavior};
use std::sync::Arc;
use std::time::Duration;
use vscsi_adapter::{
    AdapterConfig, AdapterError, ControlPlane, DeviceFlags, DeviceIdentifier, DeviceProperties,
    NbdConnectionProperties, RequestType, ScsiCompletionStatus,
};

fn sample_properties(name: &str, block_count: u64) -> DeviceProperties {
    DeviceProperties {
        instance_name: name.to_string(),
        serial_number: "SN1".into(),
        owner: "itest".into(),
        flags: DeviceFlags::default(),
        block_count,
        block_size: 512,
        max_unmap_descriptor_count: 16,
        max_transfer_length: 1 << 20,
        max_outstanding_io: 64,
        pid: None,
    }
}

#[test]
fn nbd_read_happy_path() {
    let port = common::reserve_port();
    let export_size = 1024 * 1024;
    spawn_mock_server(port, export_size, MockBehavior::EchoFill(0x5A));

    let control = Arc::new(ControlPlane::new(AdapterConfig::default(), None));
    let nbd = NbdConnectionProperties {
        hostname: "127.0.0.1".into(),
        port,
        export_name: "demo".into(),
        skip_negotiation: false,
    };
    let info = control
        .create(sample_properties("nbd-disk", export_size / 512), Some(nbd))
        .unwrap();
    assert!(info.properties.flags.use_nbd);
    assert!(info.properties.flags.flush_supported);

    let id = DeviceIdentifier::InstanceName("nbd-disk".to_string());
    let read_cdb = [0x28, 0, 0, 0, 0, 0, 0, 0, 1, 0];
    let rx = control.submit_cdb(&id, &read_cdb, None).unwrap();
    let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(result.status, ScsiCompletionStatus::Success);
    assert_eq!(result.data, vec![0x5Au8; 512]);

    control.remove(&id, false).unwrap();
}

#[test]
fn userspace_write_then_hard_remove_aborts_it() {
    let control = ControlPlane::new(AdapterConfig::default(), None);
    control.create(sample_properties("disk0", 2048), None).unwrap();
    let id = DeviceIdentifier::InstanceName("disk0".to_string());

    let write_cdb = [0x2A, 0, 0, 0, 0, 1, 0, 0, 1, 0];
    let write_data = vec![0x42u8; 512];
    let rx = control
        .submit_cdb(&id, &write_cdb, Some(&write_data))
        .unwrap();

    let stats_before = control.stats(&id).unwrap();
    assert_eq!(stats_before.unsubmitted_requests, 1);

    control.remove(&id, true).unwrap();

    let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(result.status, ScsiCompletionStatus::Aborted);
}

#[test]
fn userspace_fetch_send_response_round_trip_survives_alongside_other_traffic() {
    let control = ControlPlane::new(AdapterConfig::default(), None);
    control.create(sample_properties("disk0", 2048), None).unwrap();
    let id = DeviceIdentifier::InstanceName("disk0".to_string());

    let write_cdb = [0x2A, 0, 0, 0, 0, 4, 0, 0, 1, 0];
    let write_data = vec![0x99u8; 512];
    let rx = control
        .submit_cdb(&id, &write_cdb, Some(&write_data))
        .unwrap();

    let element = control.fetch_request(&id, 4096).unwrap();
    assert_eq!(element.request_type, RequestType::Write);
    control
        .send_response(&id, element.tag, ScsiCompletionStatus::Success, &[])
        .unwrap();
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).unwrap().status,
        ScsiCompletionStatus::Success
    );

    control.remove(&id, false).unwrap();
}

#[test]
fn duplicate_create_leaves_exactly_one_device_registered() {
    let control = ControlPlane::new(AdapterConfig::default(), None);
    control.create(sample_properties("disk0", 2048), None).unwrap();
    let err = control
        .create(sample_properties("disk0", 2048), None)
        .unwrap_err();
    assert!(matches!(err, AdapterError::NameCollision(_)));
    assert_eq!(control.list().len(), 1);
}

#[test]
fn graceful_teardown_under_load_completes_every_request_exactly_once() {
    let control = Arc::new(ControlPlane::new(AdapterConfig::default(), None));
    control.create(sample_properties("disk0", 4096), None).unwrap();
    let id = DeviceIdentifier::InstanceName("disk0".to_string());

    const REQUEST_COUNT: usize = 1000;
    let mut receivers = Vec::with_capacity(REQUEST_COUNT);
    for i in 0..REQUEST_COUNT {
        let lba = (i % 1000) as u32;
        let cdb = [0x28, 0, 0, 0, 0, lba.to_be_bytes()[3], 0, 0, 1, 0];
        receivers.push(control.submit_cdb(&id, &cdb, None).unwrap());
    }

    let serving_control = Arc::clone(&control);
    let serving_id = id.clone();
    let server = std::thread::spawn(move || {
        let mut served = 0usize;
        while served < REQUEST_COUNT {
            match serving_control.fetch_request(&serving_id, 4096) {
                Ok(element) => {
                    let data = vec![0x11u8; element.read_length as usize];
                    let _ = serving_control.send_response(
                        &serving_id,
                        element.tag,
                        ScsiCompletionStatus::Success,
                        &data,
                    );
                    served += 1;
                }
                Err(_) => break,
            }
        }
    });

    server.join().expect("server thread panicked");

    let mut completed = 0;
    for rx in receivers {
        if rx.recv_timeout(Duration::from_secs(5)).is_ok() {
            completed += 1;
        }
    }
    assert_eq!(completed, REQUEST_COUNT);

    // Non-hard remove: nothing left in flight, so this returns promptly.
    control.remove(&id, false).unwrap();
}

#[test]
fn nbd_reply_with_unknown_tag_hard_terminates_the_device() {
    let port = common::reserve_port();
    let export_size = 1024 * 1024;
    spawn_mock_server(port, export_size, MockBehavior::UnknownTagOnce);

    let control = Arc::new(ControlPlane::new(AdapterConfig::default(), None));
    let nbd = NbdConnectionProperties {
        hostname: "127.0.0.1".into(),
        port,
        export_name: "demo".into(),
        skip_negotiation: false,
    };
    control
        .create(sample_properties("nbd-disk", export_size / 512), Some(nbd))
        .unwrap();
    let id = DeviceIdentifier::InstanceName("nbd-disk".to_string());

    let read_cdb = [0x28, 0, 0, 0, 0, 0, 0, 0, 1, 0];
    let rx = control.submit_cdb(&id, &read_cdb, None).unwrap();

    // The reply loop never completes this request: the unmatched tag
    // closes the connection and hard-terminates the device instead.
    assert!(rx.recv_timeout(Duration::from_secs(2)).is_err());

    // The request/reply loops have already exited on their own by now, so
    // a hard remove joins them well within its 120s bound instead of
    // hanging on a still-running loop.
    control.remove(&id, true).unwrap();
}

#[test]
fn list_reports_every_created_device_with_no_removes() {
    let control = ControlPlane::new(AdapterConfig::default(), None);
    for i in 0..5 {
        control
            .create(sample_properties(&format!("disk{i}"), 2048), None)
            .unwrap();
    }
    let listed = control.list();
    assert_eq!(listed.len(), 5);
    for i in 0..5 {
        assert!(listed
            .iter()
            .any(|info| info.properties.instance_name == format!("disk{i}")));
    }
}
