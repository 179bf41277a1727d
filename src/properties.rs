//! Device property structs exchanged across the control-plane boundary
//!
//! Field names and sizes here are the Rust-native counterparts of the
//! wire-level property structs a virtual SCSI adapter driver exposes to
//! user space: device identity and capacity (`DeviceProperties`), the
//! flags a device advertises to the SCSI front (`DeviceFlags`), the NBD
//! dial-out parameters for NBD-backed devices (`NbdConnectionProperties`),
//! and the per-connection bus/target/lun addressing plus reported
//! statistics (`ConnectionInfo`, `AdapterStats`).

pub const MAX_NAME_LENGTH: usize = 256;
pub const MAX_OWNER_LENGTH: usize = 16;

/// Flags a device advertises about itself to the SCSI front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceFlags {
    pub read_only: bool,
    pub flush_supported: bool,
    pub fua_supported: bool,
    pub unmap_supported: bool,
    pub unmap_anchor_supported: bool,
    pub use_nbd: bool,
}

/// Identity, capacity and negotiated capability set for one virtual disk.
#[derive(Debug, Clone)]
pub struct DeviceProperties {
    pub instance_name: String,
    pub serial_number: String,
    pub owner: String,
    pub flags: DeviceFlags,
    pub block_count: u64,
    pub block_size: u32,
    pub max_unmap_descriptor_count: u32,
    pub max_transfer_length: u32,
    pub max_outstanding_io: u32,
    pub pid: Option<u32>,
}

impl DeviceProperties {
    pub fn validate(&self) -> Result<(), String> {
        if self.instance_name.is_empty() {
            return Err("instance name must not be empty".into());
        }
        if self.instance_name.len() >= MAX_NAME_LENGTH {
            return Err(format!(
                "instance name exceeds {} bytes",
                MAX_NAME_LENGTH - 1
            ));
        }
        if self.owner.len() >= MAX_OWNER_LENGTH {
            return Err(format!("owner exceeds {} bytes", MAX_OWNER_LENGTH - 1));
        }
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err("block size must be a nonzero power of two".into());
        }
        if self.block_count == 0 {
            return Err("block count must be nonzero".into());
        }
        if self.block_count > u64::MAX / self.block_size as u64 {
            return Err("block_count * block_size overflows u64".into());
        }
        if self.max_transfer_length == 0 {
            return Err("max transfer length must be nonzero".into());
        }
        Ok(())
    }

    /// Total device capacity in bytes. Only meaningful once `validate`
    /// has confirmed `block_count * block_size` does not overflow.
    pub fn capacity_bytes(&self) -> u64 {
        self.block_count.saturating_mul(self.block_size as u64)
    }
}

/// Dial-out parameters for an NBD-backed device.
#[derive(Debug, Clone)]
pub struct NbdConnectionProperties {
    pub hostname: String,
    pub port: u16,
    pub export_name: String,
    pub skip_negotiation: bool,
}

impl NbdConnectionProperties {
    pub fn validate(&self) -> Result<(), String> {
        if self.hostname.is_empty() {
            return Err("hostname must not be empty".into());
        }
        if self.hostname.len() >= MAX_NAME_LENGTH {
            return Err(format!("hostname exceeds {} bytes", MAX_NAME_LENGTH - 1));
        }
        if self.export_name.len() >= MAX_NAME_LENGTH {
            return Err(format!(
                "export name exceeds {} bytes",
                MAX_NAME_LENGTH - 1
            ));
        }
        if self.port == 0 {
            return Err("port must be nonzero".into());
        }
        Ok(())
    }
}

/// Bus/target/lun address plus per-connection state, as reported by List.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub properties: DeviceProperties,
    pub nbd: Option<NbdConnectionProperties>,
    pub bus_number: u16,
    pub target_id: u16,
    pub lun: u16,
    pub disconnecting: bool,
}

/// Cumulative I/O counters for one device, reported by Stats.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdapterStats {
    pub total_received_requests: i64,
    pub total_submitted_requests: i64,
    pub total_received_replies: i64,
    pub unsubmitted_requests: i64,
    pub pending_submitted_requests: i64,
    pub aborted_submitted_requests: i64,
    pub aborted_unsubmitted_requests: i64,
    pub completed_aborted_requests: i64,
}
