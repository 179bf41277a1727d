//! SCSI CDB parsing and opcode-to-request-type translation
//!
//! The adapter never interprets a CDB beyond deciding which `RequestType`
//! it represents and, for Read/Write, which LBA range it touches. Everything
//! else (INQUIRY, MODE SENSE, REPORT LUNS, ...) is answered by the SCSI
//! front end this core plugs into and never reaches the request queue.

use byteorder::{BigEndian, ByteOrder};

/// SCSI command opcodes this core must recognize in order to route a CDB
/// to the right `RequestType`. Opcodes outside this set translate to
/// `RequestType::Unknown` and are rejected before they ever reach a device
/// engine.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScsiOpcode {
    TestUnitReady = 0x00,
    RequestSense = 0x03,
    Inquiry = 0x12,
    ModeSense6 = 0x1A,
    StartStopUnit = 0x1B,
    ReadCapacity10 = 0x25,
    Read6 = 0x08,
    Read10 = 0x28,
    Write6 = 0x0A,
    Write10 = 0x2A,
    Verify10 = 0x2F,
    SynchronizeCache10 = 0x35,
    WriteSame10 = 0x41,
    Unmap = 0x42,
    ModeSense10 = 0x5A,
    Read12 = 0xA8,
    Write12 = 0xAA,
    Read16 = 0x88,
    Write16 = 0x8A,
    Verify16 = 0x8F,
    SynchronizeCache16 = 0x91,
    ServiceActionIn16 = 0x9E,
    ReportLuns = 0xA0,
}

impl ScsiOpcode {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            0x00 => Some(ScsiOpcode::TestUnitReady),
            0x03 => Some(ScsiOpcode::RequestSense),
            0x08 => Some(ScsiOpcode::Read6),
            0x0A => Some(ScsiOpcode::Write6),
            0x12 => Some(ScsiOpcode::Inquiry),
            0x1A => Some(ScsiOpcode::ModeSense6),
            0x1B => Some(ScsiOpcode::StartStopUnit),
            0x25 => Some(ScsiOpcode::ReadCapacity10),
            0x28 => Some(ScsiOpcode::Read10),
            0x2A => Some(ScsiOpcode::Write10),
            0x2F => Some(ScsiOpcode::Verify10),
            0x35 => Some(ScsiOpcode::SynchronizeCache10),
            0x41 => Some(ScsiOpcode::WriteSame10),
            0x42 => Some(ScsiOpcode::Unmap),
            0x5A => Some(ScsiOpcode::ModeSense10),
            0x88 => Some(ScsiOpcode::Read16),
            0x8A => Some(ScsiOpcode::Write16),
            0x8F => Some(ScsiOpcode::Verify16),
            0x91 => Some(ScsiOpcode::SynchronizeCache16),
            0x9E => Some(ScsiOpcode::ServiceActionIn16),
            0xA0 => Some(ScsiOpcode::ReportLuns),
            0xA8 => Some(ScsiOpcode::Read12),
            0xAA => Some(ScsiOpcode::Write12),
            _ => None,
        }
    }
}

/// The request kinds a device engine ever queues. Mirrors the closed set
/// a backend connection has to implement; every CDB collapses to one of
/// these before it is ever put on the Pending queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    Unknown,
    Read,
    Write,
    Flush,
    Unmap,
    Disconnect,
}

/// Translates a SCSI CDB opcode byte into the `RequestType` a device
/// engine understands. Read/Write variants at every CDB length (6, 10, 12,
/// 16) collapse to the same two request types; SYNCHRONIZE CACHE (10/16)
/// becomes `Flush`; UNMAP becomes `Unmap`; everything else is `Unknown`
/// and must be failed with an illegal-request sense before it reaches a
/// queue.
pub fn scsi_op_to_request_type(opcode: u8) -> RequestType {
    match ScsiOpcode::from_u8(opcode) {
        Some(ScsiOpcode::Read6)
        | Some(ScsiOpcode::Read10)
        | Some(ScsiOpcode::Read12)
        | Some(ScsiOpcode::Read16) => RequestType::Read,
        Some(ScsiOpcode::Write6)
        | Some(ScsiOpcode::Write10)
        | Some(ScsiOpcode::Write12)
        | Some(ScsiOpcode::Write16)
        | Some(ScsiOpcode::WriteSame10) => RequestType::Write,
        Some(ScsiOpcode::SynchronizeCache10) | Some(ScsiOpcode::SynchronizeCache16) => {
            RequestType::Flush
        }
        Some(ScsiOpcode::Unmap) => RequestType::Unmap,
        _ => RequestType::Unknown,
    }
}

/// SCSI status codes
pub mod scsi_status {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
    pub const BUSY: u8 = 0x08;
    pub const RESERVATION_CONFLICT: u8 = 0x18;
    pub const TASK_SET_FULL: u8 = 0x28;
    pub const TASK_ABORTED: u8 = 0x40;
}

/// SCSI sense key codes
pub mod sense_key {
    pub const NO_SENSE: u8 = 0x00;
    pub const NOT_READY: u8 = 0x02;
    pub const MEDIUM_ERROR: u8 = 0x03;
    pub const HARDWARE_ERROR: u8 = 0x04;
    pub const ILLEGAL_REQUEST: u8 = 0x05;
    pub const UNIT_ATTENTION: u8 = 0x06;
    pub const ABORTED_COMMAND: u8 = 0x0B;
}

/// Additional Sense Code (ASC) values
pub mod asc {
    pub const NO_ADDITIONAL_SENSE: u8 = 0x00;
    pub const INVALID_COMMAND_OPERATION_CODE: u8 = 0x20;
    pub const LBA_OUT_OF_RANGE: u8 = 0x21;
    pub const INVALID_FIELD_IN_CDB: u8 = 0x24;
    pub const LOGICAL_UNIT_NOT_SUPPORTED: u8 = 0x25;
    pub const INTERNAL_TARGET_FAILURE: u8 = 0x44;
}

/// Fixed-format SCSI sense data, as handed back to the SCSI front on a
/// CHECK CONDITION completion.
#[derive(Debug, Clone)]
pub struct SenseData {
    pub sense_key: u8,
    pub asc: u8,
    pub ascq: u8,
    pub information: u32,
}

impl SenseData {
    pub fn new(sense_key: u8, asc: u8, ascq: u8) -> Self {
        SenseData {
            sense_key,
            asc,
            ascq,
            information: 0,
        }
    }

    pub fn with_info(mut self, info: u32) -> Self {
        self.information = info;
        self
    }

    /// Serializes to fixed-format sense data (18 bytes).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = vec![0u8; 18];
        data[0] = 0x70;
        data[2] = self.sense_key & 0x0F;
        BigEndian::write_u32(&mut data[3..7], self.information);
        data[7] = 10;
        data[12] = self.asc;
        data[13] = self.ascq;
        data
    }

    pub fn invalid_command() -> Self {
        SenseData::new(
            sense_key::ILLEGAL_REQUEST,
            asc::INVALID_COMMAND_OPERATION_CODE,
            0,
        )
    }

    pub fn lba_out_of_range(lba: u32) -> Self {
        SenseData::new(sense_key::ILLEGAL_REQUEST, asc::LBA_OUT_OF_RANGE, 0).with_info(lba)
    }

    pub fn medium_error() -> Self {
        SenseData::new(sense_key::MEDIUM_ERROR, 0x11, 0x00)
    }

    pub fn internal_target_failure() -> Self {
        SenseData::new(sense_key::HARDWARE_ERROR, asc::INTERNAL_TARGET_FAILURE, 0)
    }

    /// Sense attached to a `Timeout` completion: the backend connection
    /// was lost before a reply for this request ever arrived.
    pub fn command_timeout() -> Self {
        SenseData::new(sense_key::ABORTED_COMMAND, asc::NO_ADDITIONAL_SENSE, 0)
    }
}

/// Parsed LBA / block-count pair common to every Read/Write/Unmap CDB
/// shape the core supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CdbRange {
    pub lba: u64,
    pub blocks: u32,
}

/// Extracts `(lba, blocks)` from a CDB, dispatching on its length/opcode.
/// Returns `None` for CDBs too short for their own opcode, or opcodes this
/// core doesn't move data for (callers should have already filtered via
/// `scsi_op_to_request_type`).
pub fn parse_cdb_range(cdb: &[u8]) -> Option<CdbRange> {
    if cdb.is_empty() {
        return None;
    }
    match ScsiOpcode::from_u8(cdb[0]) {
        Some(ScsiOpcode::Read6) | Some(ScsiOpcode::Write6) => parse_rw6_cdb(cdb),
        Some(ScsiOpcode::Read10)
        | Some(ScsiOpcode::Write10)
        | Some(ScsiOpcode::WriteSame10) => parse_rw10_cdb(cdb),
        Some(ScsiOpcode::Read12) | Some(ScsiOpcode::Write12) => parse_rw12_cdb(cdb),
        Some(ScsiOpcode::Read16) | Some(ScsiOpcode::Write16) => parse_rw16_cdb(cdb),
        _ => None,
    }
    .map(|(lba, blocks)| CdbRange { lba, blocks })
}

/// Parses LBA/block-count from a 6-byte READ/WRITE CDB.
pub fn parse_rw6_cdb(cdb: &[u8]) -> Option<(u64, u32)> {
    if cdb.len() < 6 {
        return None;
    }
    let lba = (((cdb[1] & 0x1F) as u64) << 16) | ((cdb[2] as u64) << 8) | cdb[3] as u64;
    let blocks = if cdb[4] == 0 { 256 } else { cdb[4] as u32 };
    Some((lba, blocks))
}

/// Parses LBA/block-count from a 10-byte READ/WRITE CDB.
pub fn parse_rw10_cdb(cdb: &[u8]) -> Option<(u64, u32)> {
    if cdb.len() < 10 {
        return None;
    }
    let lba = BigEndian::read_u32(&cdb[2..6]) as u64;
    let length = BigEndian::read_u16(&cdb[7..9]) as u32;
    Some((lba, length))
}

/// Parses LBA/block-count from a 12-byte READ/WRITE CDB.
pub fn parse_rw12_cdb(cdb: &[u8]) -> Option<(u64, u32)> {
    if cdb.len() < 12 {
        return None;
    }
    let lba = BigEndian::read_u32(&cdb[2..6]) as u64;
    let length = BigEndian::read_u32(&cdb[6..10]);
    Some((lba, length))
}

/// Parses LBA/block-count from a 16-byte READ/WRITE CDB.
pub fn parse_rw16_cdb(cdb: &[u8]) -> Option<(u64, u32)> {
    if cdb.len() < 16 {
        return None;
    }
    let lba = BigEndian::read_u64(&cdb[2..10]);
    let length = BigEndian::read_u32(&cdb[10..14]);
    Some((lba, length))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_variants_translate_to_read() {
        assert_eq!(scsi_op_to_request_type(0x08), RequestType::Read);
        assert_eq!(scsi_op_to_request_type(0x28), RequestType::Read);
        assert_eq!(scsi_op_to_request_type(0xA8), RequestType::Read);
        assert_eq!(scsi_op_to_request_type(0x88), RequestType::Read);
    }

    #[test]
    fn write_variants_translate_to_write() {
        assert_eq!(scsi_op_to_request_type(0x0A), RequestType::Write);
        assert_eq!(scsi_op_to_request_type(0x2A), RequestType::Write);
        assert_eq!(scsi_op_to_request_type(0xAA), RequestType::Write);
        assert_eq!(scsi_op_to_request_type(0x8A), RequestType::Write);
    }

    #[test]
    fn synchronize_cache_is_flush_not_unmap() {
        assert_eq!(scsi_op_to_request_type(0x35), RequestType::Flush);
        assert_eq!(scsi_op_to_request_type(0x91), RequestType::Flush);
    }

    #[test]
    fn unmap_is_its_own_distinct_type() {
        assert_eq!(scsi_op_to_request_type(0x42), RequestType::Unmap);
    }

    #[test]
    fn inquiry_and_unrecognized_opcodes_are_unknown() {
        assert_eq!(scsi_op_to_request_type(0x12), RequestType::Unknown);
        assert_eq!(scsi_op_to_request_type(0xFF), RequestType::Unknown);
    }

    #[test]
    fn parse_cdb_range_handles_every_rw_length() {
        let cdb10 = [0x28, 0, 0, 0, 0, 100, 0, 0, 10, 0];
        assert_eq!(
            parse_cdb_range(&cdb10),
            Some(CdbRange { lba: 100, blocks: 10 })
        );

        let cdb16 = [
            0x88, 0, 0, 0, 0, 0, 0, 0, 0, 100, 0, 0, 0, 10, 0, 0,
        ];
        assert_eq!(
            parse_cdb_range(&cdb16),
            Some(CdbRange { lba: 100, blocks: 10 })
        );
    }

    #[test]
    fn parse_rw6_cdb_zero_length_means_256_blocks() {
        let cdb = [0x08, 0, 0, 0, 0, 0];
        assert_eq!(parse_rw6_cdb(&cdb), Some((0, 256)));
    }

    #[test]
    fn sense_data_round_trips_key_and_asc() {
        let sense = SenseData::lba_out_of_range(42);
        let bytes = sense.to_bytes();
        assert_eq!(bytes.len(), 18);
        assert_eq!(bytes[2], sense_key::ILLEGAL_REQUEST);
        assert_eq!(bytes[12], asc::LBA_OUT_OF_RANGE);
        assert_eq!(BigEndian::read_u32(&bytes[3..7]), 42);
    }
}
