//! Control-plane command dispatch: Create/Remove/List/Stats/Ping/
//! FetchRequest/SendResponse/ReloadConfig/Version.
//!
//! Every command validates its input strictly before touching any shared
//! state: names are forced null-terminated by overwriting the last byte
//! of a fixed buffer rather than trusting the caller, zero-length buffers
//! are rejected outright, and any length used to index a slice is bounds
//! checked before the read happens.

use crate::backend::{BackendConnection, NbdBackendConnection};
use crate::config::AdapterConfig;
use crate::engine::{Backend, CompletionResult, DeviceEngine, DeviceState};
use crate::error::{AdapterError, AdapterResult, ScsiCompletionStatus};
use crate::properties::{AdapterStats, ConnectionInfo, DeviceProperties, NbdConnectionProperties};
use crate::queue::RequestElement;
use crate::registry::{Address, DeviceRegistry, RegisteredDevice};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::mpsc::{channel, Receiver};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Either a connection id or an instance name; every command that
/// targets an existing device accepts whichever the caller has at hand.
#[derive(Debug, Clone)]
pub enum DeviceIdentifier {
    ConnectionId(u64),
    InstanceName(String),
}

/// Forces `name` to be non-empty, to fit in `max_len - 1` bytes (leaving
/// room for a null terminator the way a fixed ioctl buffer would), and
/// truncates instead of overflowing if it doesn't: the last usable byte
/// is always a forced terminator, mirroring a fixed-size ioctl buffer
/// that never reads past its own end even if the caller forgot to
/// terminate their string.
fn validate_and_truncate_name(name: &str, max_len: usize) -> AdapterResult<String> {
    if name.is_empty() {
        return Err(AdapterError::InvalidParameter(
            "name must not be empty".into(),
        ));
    }
    if name.len() >= max_len {
        let mut truncated: String = name.chars().take(max_len - 1).collect();
        while truncated.len() >= max_len {
            truncated.pop();
        }
        return Ok(truncated);
    }
    Ok(name.to_string())
}

/// Joins a set of background threads, giving up after `timeout` rather
/// than blocking Remove forever on a loop that never exits. Implemented
/// with a monitor thread + channel because `JoinHandle::join` has no
/// timeout of its own.
fn join_with_timeout(handles: Vec<JoinHandle<()>>, timeout: Duration) -> bool {
    let (tx, rx): (_, Receiver<()>) = channel();
    thread::spawn(move || {
        for handle in handles {
            let _ = handle.join();
        }
        let _ = tx.send(());
    });
    rx.recv_timeout(timeout).is_ok()
}

/// The adapter-wide control plane: one registry, one reloadable config,
/// and the background-thread handles spawned for NBD-backed devices.
pub struct ControlPlane {
    registry: Mutex<DeviceRegistry<DeviceEngine>>,
    config: Mutex<AdapterConfig>,
    config_path: Option<PathBuf>,
    thread_handles: Mutex<std::collections::HashMap<u64, Vec<JoinHandle<()>>>>,
}

impl ControlPlane {
    pub fn new(config: AdapterConfig, config_path: Option<PathBuf>) -> Self {
        ControlPlane {
            registry: Mutex::new(DeviceRegistry::new()),
            config: Mutex::new(config),
            config_path,
            thread_handles: Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Ping: liveness check, proves the control channel itself works.
    pub fn ping(&self) -> AdapterResult<()> {
        Ok(())
    }

    /// Version: the adapter core's own semantic version.
    pub fn version(&self) -> &'static str {
        crate::VERSION
    }

    /// ReloadConfig: re-reads the on-disk config file into the process-
    /// wide defaults. Never touches a live device's negotiated
    /// properties — only the defaults newly-created devices would use.
    pub fn reload_config(&self) -> AdapterResult<()> {
        let path = self
            .config_path
            .clone()
            .ok_or_else(|| AdapterError::Config("no config file path configured".into()))?;
        let new_config = AdapterConfig::from_file(&path)?;
        *self.config.lock().unwrap() = new_config;
        info!("configuration reloaded from {}", path.display());
        Ok(())
    }

    pub fn config(&self) -> AdapterConfig {
        self.config.lock().unwrap().clone()
    }

    /// Create: validates properties, allocates a connection id and bus
    /// address, wires up the right backend, registers the device and
    /// (for NBD-backed devices) spawns its request/reply loops.
    pub fn create(
        &self,
        mut properties: DeviceProperties,
        nbd: Option<NbdConnectionProperties>,
    ) -> AdapterResult<ConnectionInfo> {
        properties.instance_name =
            validate_and_truncate_name(&properties.instance_name, crate::properties::MAX_NAME_LENGTH)?;
        properties
            .validate()
            .map_err(AdapterError::InvalidParameter)?;

        let backend = match &nbd {
            Some(nbd_props) => {
                nbd_props
                    .validate()
                    .map_err(AdapterError::InvalidParameter)?;
                let (connection, handshake) = NbdBackendConnection::connect(
                    &nbd_props.hostname,
                    nbd_props.port,
                    nbd_props.skip_negotiation,
                )?;
                if let Some(handshake) = handshake {
                    if handshake.size < properties.capacity_bytes() {
                        return Err(AdapterError::InvalidParameter(
                            "NBD export smaller than requested device capacity".into(),
                        ));
                    }
                    properties.flags.read_only = handshake.is_read_only();
                    properties.flags.flush_supported = handshake.supports_flush();
                    properties.flags.fua_supported = handshake.supports_fua();
                    properties.flags.unmap_supported = handshake.supports_trim();
                }
                properties.flags.use_nbd = true;
                Backend::Nbd {
                    connection: Arc::new(connection),
                    properties: nbd_props.clone(),
                }
            }
            None => Backend::Userspace,
        };

        let mut registry = self.registry.lock().unwrap();
        let connection_id = registry.allocate_connection_id();
        let address = registry.allocate_address()?;

        let engine = Arc::new(DeviceEngine::new(
            connection_id,
            address,
            properties.clone(),
            backend,
        ));
        registry.insert(Arc::clone(&engine))?;
        engine.set_state(DeviceState::Active);
        drop(registry);

        if nbd.is_some() {
            let request_engine = Arc::clone(&engine);
            let reply_engine = Arc::clone(&engine);
            let request_handle = thread::spawn(move || request_engine.run_nbd_request_loop());
            let reply_handle = thread::spawn(move || reply_engine.run_nbd_reply_loop());
            self.thread_handles
                .lock()
                .unwrap()
                .insert(connection_id, vec![request_handle, reply_handle]);
        }

        Ok(ConnectionInfo {
            properties,
            nbd,
            bus_number: address.bus,
            target_id: address.target,
            lun: address.lun,
            disconnecting: false,
        })
    }

    #[cfg(test)]
    pub(crate) fn resolve_for_test(&self, id: &DeviceIdentifier) -> Arc<DeviceEngine> {
        self.resolve(id).unwrap()
    }

    fn resolve(&self, id: &DeviceIdentifier) -> AdapterResult<Arc<DeviceEngine>> {
        let registry = self.registry.lock().unwrap();
        let device = match id {
            DeviceIdentifier::ConnectionId(connection_id) => {
                registry.get_by_connection_id(*connection_id)
            }
            DeviceIdentifier::InstanceName(name) => registry.get_by_name(name),
        };
        device.ok_or_else(|| AdapterError::NotFound(format!("{id:?}")))
    }

    /// Remove: latches rundown so no new operation can start against the
    /// device, fails everything in flight, waits for in-flight work to
    /// actually drain, stops the background loops, joins them within a
    /// bounded window, then removes the device from the registry.
    pub fn remove(&self, id: &DeviceIdentifier, hard: bool) -> AdapterResult<()> {
        let device = self.resolve(id)?;

        {
            let registry = self.registry.lock().unwrap();
            device.rundown.begin_rundown();
            drop(registry);
        }

        if hard {
            device.abort_all();
        }
        device.rundown.wait_for_rundown();

        device.request_soft_terminate();
        device.request_hard_terminate();

        if let Some(handles) = self
            .thread_handles
            .lock()
            .unwrap()
            .remove(&device.connection_id())
        {
            if !join_with_timeout(handles, Duration::from_secs(120)) {
                warn!(
                    "device {} loops did not exit within the 120s teardown bound",
                    device.instance_name()
                );
            }
        }

        // Loops have exited; anything left on Submitted will never see a
        // reply now and must still be completed exactly once.
        device.fail_all_submitted_as_aborted();

        let mut registry = self.registry.lock().unwrap();
        registry
            .remove_by_connection_id(device.connection_id())
            .ok_or_else(|| AdapterError::NotFound(format!("{id:?}")))?;
        device.set_state(DeviceState::Reaped);
        Ok(())
    }

    /// List: a snapshot of every currently-registered device's identity
    /// and address.
    pub fn list(&self) -> Vec<ConnectionInfo> {
        let registry = self.registry.lock().unwrap();
        registry
            .list()
            .into_iter()
            .map(|engine| {
                let properties = engine.properties.lock().unwrap().clone();
                let address = engine.address();
                ConnectionInfo {
                    properties,
                    nbd: None,
                    bus_number: address.bus,
                    target_id: address.target,
                    lun: address.lun,
                    disconnecting: engine.rundown.is_rundown_initiated(),
                }
            })
            .collect()
    }

    pub fn stats(&self, id: &DeviceIdentifier) -> AdapterResult<AdapterStats> {
        let device = self.resolve(id)?;
        Ok(*device.stats.lock().unwrap())
    }

    /// FetchRequest: blocks on behalf of a user-space dispatch client
    /// waiting for the next pending request on the named device.
    pub fn fetch_request(
        &self,
        id: &DeviceIdentifier,
        buffer_len: usize,
    ) -> AdapterResult<RequestElement> {
        let device = self.resolve(id)?;
        if !device.rundown.acquire() {
            return Err(AdapterError::NotFound("device is being removed".into()));
        }
        let result = device.fetch_request(buffer_len);
        device.rundown.release();
        result
    }

    /// SendResponse: completes a previously fetched request.
    pub fn send_response(
        &self,
        id: &DeviceIdentifier,
        tag: u64,
        status: ScsiCompletionStatus,
        response_data: &[u8],
    ) -> AdapterResult<()> {
        let device = self.resolve(id)?;
        if !device.rundown.acquire() {
            return Err(AdapterError::NotFound("device is being removed".into()));
        }
        let result = device.send_response(tag, status, response_data);
        device.rundown.release();
        result
    }

    /// Submits a CDB to the named device on behalf of the SCSI front
    /// end; not one of the external ioctl commands, but the data-plane
    /// entry point every Read/Write/Flush/Unmap CDB goes through before
    /// it ever reaches Pending.
    pub fn submit_cdb(
        &self,
        id: &DeviceIdentifier,
        cdb: &[u8],
        write_data: Option<&[u8]>,
    ) -> AdapterResult<std::sync::mpsc::Receiver<CompletionResult>> {
        let device = self.resolve(id)?;
        if !device.rundown.acquire() {
            return Err(AdapterError::NotFound("device is being removed".into()));
        }
        let (tx, rx) = channel();
        let result = device.submit_cdb(cdb, write_data, tx);
        device.rundown.release();
        result?;
        Ok(rx)
    }

    pub fn device_count(&self) -> usize {
        self.registry.lock().unwrap().len()
    }

    /// Removes every device whose backend loops have already exited on
    /// their own (a dead NBD connection hard-terminated the device
    /// without anyone calling Remove). Returns how many were reaped.
    /// Called periodically by `cleaner::CleanerThread` and once more,
    /// unconditionally, during adapter shutdown.
    pub fn reap_orphaned(&self, reap_all: bool) -> usize {
        let orphaned: Vec<u64> = {
            let registry = self.registry.lock().unwrap();
            registry
                .list()
                .into_iter()
                .filter(|engine| {
                    reap_all
                        || matches!(
                            engine.state(),
                            DeviceState::HardTerminating | DeviceState::LoopsExited
                        )
                })
                .map(|engine| engine.connection_id())
                .collect()
        };

        let mut reaped = 0;
        for connection_id in orphaned {
            let id = DeviceIdentifier::ConnectionId(connection_id);
            if self.remove(&id, true).is_ok() {
                reaped += 1;
            }
        }
        reaped
    }
}
