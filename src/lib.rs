//! Virtual SCSI adapter core: the per-device request/response engine and
//! the device-lifecycle machinery around it.
//!
//! This crate is the data-plane and control-plane core of a virtual SCSI
//! miniport: it owns the two pending-request queues and their state
//! machine, an NBD client back end, the user-space fetch-request/
//! send-response dispatch protocol, the device registry with rundown
//! protection, and the housekeeping cleaner that reaps devices whose
//! loops have already exited. The platform SCSI miniport shim, the
//! command-line front end, and the raw socket transport are external
//! collaborators this core only talks to through the narrow interfaces
//! `backend::BackendConnection` and `engine::DeviceEngine::submit_cdb`
//! describe; none of them live in this crate.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use vscsi_adapter::{AdapterConfig, CleanerThread, ControlPlane, DeviceFlags, DeviceProperties};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let control = Arc::new(ControlPlane::new(AdapterConfig::default(), None));
//! let cleaner = CleanerThread::start(Arc::clone(&control), Duration::from_secs(5));
//!
//! control.create(
//!     DeviceProperties {
//!         instance_name: "disk0".into(),
//!         serial_number: String::new(),
//!         owner: "demo".into(),
//!         flags: DeviceFlags::default(),
//!         block_count: 2048,
//!         block_size: 512,
//!         max_unmap_descriptor_count: 1,
//!         max_transfer_length: 2 * 1024 * 1024,
//!         max_outstanding_io: 1024,
//!         pid: None,
//!     },
//!     None,
//! )?;
//!
//! cleaner.stop();
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod cleaner;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod nbd;
pub mod properties;
pub mod queue;
pub mod registry;
pub mod rundown;
pub mod scsi;

pub use backend::{BackendConnection, NbdBackendConnection};
pub use cleaner::CleanerThread;
pub use config::AdapterConfig;
pub use control::{ControlPlane, DeviceIdentifier};
pub use engine::{Backend, CompletionResult, DeviceEngine, DeviceState};
pub use error::{AdapterError, AdapterResult, ScsiCompletionStatus};
pub use properties::{
    AdapterStats, ConnectionInfo, DeviceFlags, DeviceProperties, NbdConnectionProperties,
};
pub use queue::RequestElement;
pub use registry::Address;
pub use scsi::RequestType;

/// Version of this crate, reported by the control plane's `Version`
/// command.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
