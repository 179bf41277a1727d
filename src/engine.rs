//! Per-device engine: request/reply loops, abort semantics and the
//! device lifecycle state machine.

use crate::backend::BackendConnection;
use crate::error::{AdapterError, ScsiCompletionStatus};
use crate::nbd::{NbdReplyHeader, NbdRequest};
use crate::properties::{AdapterStats, DeviceProperties, NbdConnectionProperties};
use crate::queue::{PendingQueue, RequestElement, SubmittedQueue, TagAllocator};
use crate::registry::{Address, RegisteredDevice};
use crate::rundown::RundownProtection;
use crate::scsi::{self, RequestType, SenseData};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Lifecycle of one device, from creation through final reap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Creating,
    Active,
    SoftTerminating,
    HardTerminating,
    LoopsExited,
    RundownDrained,
    QueuesDrained,
    Reaped,
}

/// Where a device's I/O is ultimately served from.
pub enum Backend {
    Nbd {
        connection: Arc<dyn BackendConnection>,
        properties: NbdConnectionProperties,
    },
    Userspace,
}

/// Outcome of one completed request, handed back through the channel a
/// caller supplied at submission time.
#[derive(Debug, Clone)]
pub struct CompletionResult {
    pub status: ScsiCompletionStatus,
    pub data: Vec<u8>,
    pub sense: Option<SenseData>,
}

impl CompletionResult {
    pub fn success(data: Vec<u8>) -> Self {
        CompletionResult {
            status: ScsiCompletionStatus::Success,
            data,
            sense: None,
        }
    }

    pub fn aborted() -> Self {
        CompletionResult {
            status: ScsiCompletionStatus::Aborted,
            data: Vec::new(),
            sense: None,
        }
    }

    pub fn failed(status: ScsiCompletionStatus, sense: SenseData) -> Self {
        CompletionResult {
            status,
            data: Vec::new(),
            sense: Some(sense),
        }
    }
}

/// A single-permit-at-a-time wake signal: releasing bumps a counter and
/// wakes one waiter, acquiring blocks until the counter is nonzero. Plays
/// the role the device event/semaphore plays in a kernel-mode miniport:
/// the request loop blocks on it between an empty Pending queue and the
/// next submission or terminate latch.
#[derive(Debug, Default)]
struct WorkSignal {
    permits: Mutex<usize>,
    cv: Condvar,
}

impl WorkSignal {
    fn new() -> Self {
        WorkSignal {
            permits: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    fn release(&self) {
        let mut permits = self.permits.lock().unwrap();
        *permits += 1;
        self.cv.notify_all();
    }

    fn wait_timeout(&self, timeout: Duration) {
        let mut permits = self.permits.lock().unwrap();
        if *permits == 0 {
            let (guard, _) = self.cv.wait_timeout(permits, timeout).unwrap();
            permits = guard;
        }
        if *permits > 0 {
            *permits -= 1;
        }
    }
}

/// Everything one virtual disk needs: identity, queues, rundown
/// protection, backend, and the latches that drive its shutdown.
pub struct DeviceEngine {
    connection_id: u64,
    address: Address,
    instance_name: String,
    pub properties: Mutex<DeviceProperties>,
    pub rundown: RundownProtection,
    pending: Mutex<PendingQueue>,
    submitted: Mutex<SubmittedQueue>,
    completions: Mutex<HashMap<u64, Sender<CompletionResult>>>,
    tags: TagAllocator,
    state: Mutex<DeviceState>,
    hard_terminate: AtomicBool,
    soft_terminate: AtomicBool,
    work: WorkSignal,
    pub stats: Mutex<AdapterStats>,
    backend: Mutex<Backend>,
}

impl RegisteredDevice for DeviceEngine {
    fn connection_id(&self) -> u64 {
        self.connection_id
    }
    fn address(&self) -> Address {
        self.address
    }
    fn instance_name(&self) -> &str {
        &self.instance_name
    }
}

impl DeviceEngine {
    pub fn new(
        connection_id: u64,
        address: Address,
        properties: DeviceProperties,
        backend: Backend,
    ) -> Self {
        let instance_name = properties.instance_name.clone();
        DeviceEngine {
            connection_id,
            address,
            instance_name,
            properties: Mutex::new(properties),
            rundown: RundownProtection::new(),
            pending: Mutex::new(PendingQueue::new()),
            submitted: Mutex::new(SubmittedQueue::new()),
            completions: Mutex::new(HashMap::new()),
            tags: TagAllocator::new(),
            state: Mutex::new(DeviceState::Creating),
            hard_terminate: AtomicBool::new(false),
            soft_terminate: AtomicBool::new(false),
            work: WorkSignal::new(),
            stats: Mutex::new(AdapterStats::default()),
            backend: Mutex::new(backend),
        }
    }

    pub fn state(&self) -> DeviceState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, state: DeviceState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn is_hard_terminating(&self) -> bool {
        self.hard_terminate.load(Ordering::Acquire)
    }

    pub fn is_soft_terminating(&self) -> bool {
        self.soft_terminate.load(Ordering::Acquire)
    }

    pub fn request_soft_terminate(&self) {
        self.soft_terminate.store(true, Ordering::Release);
        self.work.release();
    }

    /// Latches hard termination. Never clears once set. Releases the
    /// work signal so a blocked request loop wakes to notice the latch
    /// instead of waiting out its full timeout.
    pub fn request_hard_terminate(&self) {
        self.hard_terminate.store(true, Ordering::Release);
        self.set_state(DeviceState::HardTerminating);
        self.work.release();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn submitted_len(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }

    /// Translates and queues one SCSI CDB. Returns the tag assigned to
    /// the resulting request element; the caller (SCSI front) keeps the
    /// receiving end of `completion` to learn the outcome.
    pub fn submit_cdb(
        &self,
        cdb: &[u8],
        write_data: Option<&[u8]>,
        completion: Sender<CompletionResult>,
    ) -> Result<u64, AdapterError> {
        if self.is_hard_terminating() {
            return Err(AdapterError::NotFound(
                "device is hard-terminating".to_string(),
            ));
        }
        let opcode = *cdb.first().ok_or_else(|| {
            AdapterError::InvalidParameter("empty CDB".to_string())
        })?;
        let request_type = scsi::scsi_op_to_request_type(opcode);
        let block_size = self.properties.lock().unwrap().block_size;
        let tag = self.tags.next_tag();

        let element = match request_type {
            RequestType::Read => {
                let range = scsi::parse_cdb_range(cdb).ok_or_else(|| {
                    AdapterError::InvalidParameter("malformed read CDB".to_string())
                })?;
                RequestElement::new_read(
                    tag,
                    range.lba,
                    range.blocks,
                    range.blocks * block_size,
                )
            }
            RequestType::Write => {
                let range = scsi::parse_cdb_range(cdb).ok_or_else(|| {
                    AdapterError::InvalidParameter("malformed write CDB".to_string())
                })?;
                let data = write_data.ok_or_else(|| {
                    AdapterError::InvalidParameter("write CDB with no data".to_string())
                })?;
                RequestElement::new_write(tag, range.lba, range.blocks, data.to_vec(), false)
            }
            RequestType::Flush => RequestElement::new_flush(tag),
            RequestType::Unmap => {
                let range = scsi::parse_cdb_range(cdb).unwrap_or(scsi::CdbRange {
                    lba: 0,
                    blocks: 0,
                });
                RequestElement::new_unmap(tag, range.lba, range.blocks)
            }
            RequestType::Unknown | RequestType::Disconnect => {
                return Err(AdapterError::InvalidParameter(format!(
                    "unsupported opcode {:#04x}",
                    opcode
                )));
            }
        };

        self.completions.lock().unwrap().insert(tag, completion);
        self.pending.lock().unwrap().push_back(element);
        {
            let mut stats = self.stats.lock().unwrap();
            stats.total_received_requests += 1;
            stats.unsubmitted_requests += 1;
        }
        self.work.release();
        Ok(tag)
    }

    /// Aborts every request currently queued or submitted for this
    /// device. Pending elements are removed and completed with `Aborted`
    /// right away. Submitted elements are marked `aborted` in place and
    /// completed with `Aborted` exactly once, but NOT removed: their
    /// backend reply is still in flight and must be allowed to arrive
    /// (and be discarded) rather than risk a double completion.
    pub fn abort_all(&self) {
        let mut pending_tags = Vec::new();
        {
            let mut pending = self.pending.lock().unwrap();
            pending.drain_into(|element| pending_tags.push(element.tag));
        }
        for tag in &pending_tags {
            self.complete(*tag, CompletionResult::aborted());
        }

        let newly_aborted_tags = self.submitted.lock().unwrap().mark_all_aborted();
        for tag in &newly_aborted_tags {
            self.complete(*tag, CompletionResult::aborted());
        }

        {
            let mut stats = self.stats.lock().unwrap();
            stats.aborted_unsubmitted_requests += pending_tags.len() as i64;
            stats.aborted_submitted_requests += newly_aborted_tags.len() as i64;
        }
        self.work.release();
    }

    /// Removes and returns every element still on Submitted, adjusting
    /// `pending_submitted_requests` for the whole batch at once.
    fn drain_submitted_for_teardown(&self) -> Vec<RequestElement> {
        let elements = self.submitted.lock().unwrap().drain_all();
        if !elements.is_empty() {
            let mut stats = self.stats.lock().unwrap();
            stats.pending_submitted_requests -= elements.len() as i64;
        }
        elements
    }

    /// Completes every element still on Submitted with `Aborted`. Called
    /// once a device's loops have exited during removal: nothing will ever
    /// reply to these now, so they are treated the same as an explicit
    /// abort.
    pub(crate) fn fail_all_submitted_as_aborted(&self) {
        for element in self.drain_submitted_for_teardown() {
            self.complete(element.tag, CompletionResult::aborted());
        }
    }

    /// Completes every element still on Submitted with `Timeout`. Called
    /// when the backend connection itself is lost mid-reply: these
    /// elements can never be matched to a reply again.
    fn fail_all_submitted_as_timed_out(&self) {
        for element in self.drain_submitted_for_teardown() {
            self.complete(
                element.tag,
                CompletionResult::failed(ScsiCompletionStatus::Timeout, SenseData::command_timeout()),
            );
        }
    }

    fn complete(&self, tag: u64, result: CompletionResult) {
        if let Some(sender) = self.completions.lock().unwrap().remove(&tag) {
            let _ = sender.send(result);
        }
    }

    /// Request loop body for an NBD-backed device: one iteration pops one
    /// Pending element (if any), sends it to the backend, and moves it to
    /// Submitted. Runs until `hard_terminate` latches; checks the latch
    /// both before and after doing work, matching the wait/check/work/
    /// check-again shape a kernel worker thread uses around its event
    /// wait.
    pub fn run_nbd_request_loop(&self) {
        loop {
            if self.is_hard_terminating() {
                return;
            }
            let element = self.pending.lock().unwrap().pop_front();
            match element {
                Some(element) => {
                    let request = self.build_nbd_request(&element);
                    let backend = self.backend.lock().unwrap();
                    if let Backend::Nbd { connection, .. } = &*backend {
                        if let Err(e) = connection.send_request(&request) {
                            warn!("NBD send failed, hard-terminating device: {e}");
                            drop(backend);
                            self.request_hard_terminate();
                            self.complete(
                                element.tag,
                                CompletionResult::failed(
                                    ScsiCompletionStatus::Timeout,
                                    SenseData::command_timeout(),
                                ),
                            );
                            continue;
                        }
                    }
                    drop(backend);
                    {
                        let mut stats = self.stats.lock().unwrap();
                        stats.total_submitted_requests += 1;
                        stats.unsubmitted_requests -= 1;
                        stats.pending_submitted_requests += 1;
                    }
                    self.submitted.lock().unwrap().push_back(element);
                }
                None => {
                    if self.is_hard_terminating() {
                        return;
                    }
                    if self.is_soft_terminating() && self.pending.lock().unwrap().is_empty() {
                        return;
                    }
                    self.work.wait_timeout(Duration::from_millis(250));
                }
            }
            if self.is_hard_terminating() {
                return;
            }
        }
    }

    fn build_nbd_request(&self, element: &RequestElement) -> NbdRequest {
        match element.request_type {
            RequestType::Read => NbdRequest::read(
                element.tag,
                element.lba * self.block_size() as u64,
                element.blocks * self.block_size(),
            ),
            RequestType::Write => NbdRequest::write(
                element.tag,
                element.lba * self.block_size() as u64,
                element.write_data.clone().unwrap_or_default(),
                element.fua,
            ),
            RequestType::Flush => NbdRequest::flush(element.tag),
            RequestType::Unmap => NbdRequest::trim(
                element.tag,
                element.lba * self.block_size() as u64,
                element.blocks * self.block_size(),
            ),
            RequestType::Unknown | RequestType::Disconnect => NbdRequest::flush(element.tag),
        }
    }

    fn block_size(&self) -> u32 {
        self.properties.lock().unwrap().block_size
    }

    /// Reply loop body for an NBD-backed device: reads one reply header,
    /// matches it to a Submitted element by tag, reads the read-payload
    /// (if any) only now that the expected length is known, and
    /// completes the waiting caller. An unmatched tag means the backend
    /// and this engine have desynchronized; the only safe response is to
    /// close the connection and hard-terminate the device.
    pub fn run_nbd_reply_loop(&self) {
        loop {
            if self.is_hard_terminating() {
                return;
            }
            let is_nbd = matches!(&*self.backend.lock().unwrap(), Backend::Nbd { .. });
            if !is_nbd {
                return;
            }
            let header = self.read_nbd_reply_header();
            let header = match header {
                Ok(h) => h,
                Err(_) => {
                    self.request_hard_terminate();
                    self.fail_all_submitted_as_timed_out();
                    return;
                }
            };

            let found = self.submitted.lock().unwrap().remove_by_tag(header.handle);
            let element = match found {
                Some(element) => element,
                None => {
                    warn!("NBD reply with unknown tag {:#x}, closing connection", header.handle);
                    let backend = self.backend.lock().unwrap();
                    if let Backend::Nbd { connection, .. } = &*backend {
                        connection.close();
                    }
                    drop(backend);
                    self.request_hard_terminate();
                    self.fail_all_submitted_as_timed_out();
                    return;
                }
            };

            {
                let mut stats = self.stats.lock().unwrap();
                stats.total_received_replies += 1;
                stats.pending_submitted_requests -= 1;
                if element.aborted {
                    stats.completed_aborted_requests += 1;
                }
            }

            let expects_payload = header.error == 0 && element.request_type == RequestType::Read;
            let payload = if expects_payload {
                match self.read_nbd_payload(element.read_length as usize) {
                    Ok(data) => Some(data),
                    Err(_) => {
                        self.request_hard_terminate();
                        self.complete(
                            element.tag,
                            CompletionResult::failed(
                                ScsiCompletionStatus::Timeout,
                                SenseData::command_timeout(),
                            ),
                        );
                        self.fail_all_submitted_as_timed_out();
                        return;
                    }
                }
            } else {
                None
            };

            if element.aborted {
                debug!("discarding late reply for aborted tag {:#x}", element.tag);
                continue;
            }

            if header.error != 0 {
                self.complete(
                    element.tag,
                    CompletionResult::failed(
                        ScsiCompletionStatus::InternalError,
                        SenseData::medium_error(),
                    ),
                );
                continue;
            }

            self.complete(element.tag, CompletionResult::success(payload.unwrap_or_default()));
        }
    }

    fn read_nbd_reply_header(&self) -> Result<NbdReplyHeader, AdapterError> {
        let backend = self.backend.lock().unwrap();
        match &*backend {
            Backend::Nbd { connection, .. } => connection.receive_reply_header(),
            Backend::Userspace => Err(AdapterError::InternalError("not an NBD backend".into())),
        }
    }

    fn read_nbd_payload(&self, len: usize) -> Result<Vec<u8>, AdapterError> {
        let backend = self.backend.lock().unwrap();
        match &*backend {
            Backend::Nbd { connection, .. } => connection.receive_reply_payload(len),
            Backend::Userspace => Err(AdapterError::InternalError("not an NBD backend".into())),
        }
    }

    /// Fetch-request for the user-space dispatch protocol: blocks until
    /// Pending is non-empty and the caller's buffer is large enough for
    /// the head element, or until `hard_terminate` latches. A
    /// too-small buffer re-inserts the element at the head of Pending
    /// and returns `BufferTooSmall` rather than dropping it.
    pub fn fetch_request(&self, buffer_len: usize) -> Result<RequestElement, AdapterError> {
        loop {
            if self.is_hard_terminating() {
                return Err(AdapterError::NotFound("device is terminating".into()));
            }
            let mut pending = self.pending.lock().unwrap();
            if let Some(element) = pending.pop_front() {
                let required = element.write_data.as_ref().map(|d| d.len()).unwrap_or(0);
                if required > buffer_len {
                    pending.push_front(element);
                    drop(pending);
                    return Err(AdapterError::BufferTooSmall { required });
                }
                drop(pending);
                {
                    let mut stats = self.stats.lock().unwrap();
                    stats.total_submitted_requests += 1;
                    stats.unsubmitted_requests -= 1;
                    stats.pending_submitted_requests += 1;
                }
                self.submitted.lock().unwrap().push_back(element.clone());
                return Ok(element);
            }
            drop(pending);
            self.work.wait_timeout(Duration::from_millis(250));
        }
    }

    /// Send-response for the user-space dispatch protocol: finds the
    /// Submitted element by handle. A response for an aborted element is
    /// dropped silently. For a read completion, `response_data` is
    /// copied FROM the caller-supplied response buffer INTO the
    /// completion the SCSI front receives.
    pub fn send_response(
        &self,
        tag: u64,
        status: ScsiCompletionStatus,
        response_data: &[u8],
    ) -> Result<(), AdapterError> {
        let found = self.submitted.lock().unwrap().remove_by_tag(tag);
        let element = match found {
            Some(element) => element,
            None => return Err(AdapterError::InvalidHandle(tag)),
        };

        {
            let mut stats = self.stats.lock().unwrap();
            stats.total_received_replies += 1;
            stats.pending_submitted_requests -= 1;
            if element.aborted {
                stats.completed_aborted_requests += 1;
            }
        }

        if element.aborted {
            return Ok(());
        }

        let result = match status {
            ScsiCompletionStatus::Success if element.request_type == RequestType::Read => {
                CompletionResult::success(response_data[..element.read_length as usize].to_vec())
            }
            ScsiCompletionStatus::Success => CompletionResult::success(Vec::new()),
            other => CompletionResult::failed(other, SenseData::internal_target_failure()),
        };
        self.complete(tag, result);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::DeviceFlags;
    use crate::registry::Address;
    use std::sync::mpsc::channel;

    fn sample_properties() -> DeviceProperties {
        DeviceProperties {
            instance_name: "disk0".into(),
            serial_number: "SN1".into(),
            owner: "test".into(),
            flags: DeviceFlags::default(),
            block_count: 2048,
            block_size: 512,
            max_unmap_descriptor_count: 16,
            max_transfer_length: 1 << 20,
            max_outstanding_io: 64,
            pid: None,
        }
    }

    fn userspace_engine() -> DeviceEngine {
        DeviceEngine::new(
            1,
            Address {
                bus: 0,
                target: 0,
                lun: 0,
            },
            sample_properties(),
            Backend::Userspace,
        )
    }

    #[test]
    fn submit_read_cdb_queues_a_pending_element() {
        let engine = userspace_engine();
        let (tx, _rx) = channel();
        let cdb = [0x28, 0, 0, 0, 0, 0, 0, 0, 1, 0];
        engine.submit_cdb(&cdb, None, tx).unwrap();
        assert_eq!(engine.pending_len(), 1);
    }

    #[test]
    fn submit_write_without_data_is_rejected() {
        let engine = userspace_engine();
        let (tx, _rx) = channel();
        let cdb = [0x2A, 0, 0, 0, 0, 0, 0, 0, 1, 0];
        let err = engine.submit_cdb(&cdb, None, tx).unwrap_err();
        assert!(matches!(err, AdapterError::InvalidParameter(_)));
    }

    #[test]
    fn fetch_request_moves_element_from_pending_to_submitted() {
        let engine = userspace_engine();
        let (tx, _rx) = channel();
        let cdb = [0x28, 0, 0, 0, 0, 0, 0, 0, 1, 0];
        engine.submit_cdb(&cdb, None, tx).unwrap();

        let element = engine.fetch_request(4096).unwrap();
        assert_eq!(element.request_type, RequestType::Read);
        assert_eq!(engine.pending_len(), 0);
        assert_eq!(engine.submitted_len(), 1);
    }

    #[test]
    fn fetch_request_too_small_buffer_reinserts_at_head() {
        let engine = userspace_engine();
        let (tx, _rx) = channel();
        let cdb = [0x2A, 0, 0, 0, 0, 0, 0, 0, 2, 0];
        let write_data = vec![0xAB; 1024];
        engine.submit_cdb(&cdb, Some(&write_data), tx).unwrap();

        let err = engine.fetch_request(10).unwrap_err();
        assert!(matches!(err, AdapterError::BufferTooSmall { required: 1024 }));
        assert_eq!(engine.pending_len(), 1);
        assert_eq!(engine.submitted_len(), 0);
    }

    #[test]
    fn send_response_completes_read_by_copying_into_completion() {
        let engine = userspace_engine();
        let (tx, rx) = channel();
        let cdb = [0x28, 0, 0, 0, 0, 0, 0, 0, 1, 0];
        engine.submit_cdb(&cdb, None, tx).unwrap();
        let element = engine.fetch_request(4096).unwrap();

        let response_data = vec![0x7Eu8; element.read_length as usize];
        engine
            .send_response(element.tag, ScsiCompletionStatus::Success, &response_data)
            .unwrap();

        let result = rx.recv().unwrap();
        assert_eq!(result.status, ScsiCompletionStatus::Success);
        assert_eq!(result.data, response_data);
    }

    #[test]
    fn send_response_for_unknown_tag_is_an_error() {
        let engine = userspace_engine();
        let err = engine
            .send_response(9999, ScsiCompletionStatus::Success, &[])
            .unwrap_err();
        assert!(matches!(err, AdapterError::InvalidHandle(9999)));
    }

    #[test]
    fn abort_all_completes_pending_elements_as_aborted() {
        let engine = userspace_engine();
        let (tx, rx) = channel();
        let cdb = [0x28, 0, 0, 0, 0, 0, 0, 0, 1, 0];
        engine.submit_cdb(&cdb, None, tx).unwrap();

        engine.abort_all();
        let result = rx.recv().unwrap();
        assert_eq!(result.status, ScsiCompletionStatus::Aborted);
    }

    #[test]
    fn abort_all_marks_submitted_elements_without_removing_them() {
        let engine = userspace_engine();
        let (tx, rx) = channel();
        let cdb = [0x28, 0, 0, 0, 0, 0, 0, 0, 1, 0];
        engine.submit_cdb(&cdb, None, tx).unwrap();
        let element = engine.fetch_request(4096).unwrap();

        engine.abort_all();
        assert_eq!(engine.submitted_len(), 1);

        let result = rx.recv().unwrap();
        assert_eq!(result.status, ScsiCompletionStatus::Aborted);

        // The late reply is discarded silently, not double-completed.
        let response_data = vec![0u8; element.read_length as usize];
        engine
            .send_response(element.tag, ScsiCompletionStatus::Success, &response_data)
            .unwrap();
        assert_eq!(engine.submitted_len(), 0);
    }

    #[test]
    fn abort_all_increments_pending_and_submitted_stats_independently() {
        let engine = userspace_engine();
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();
        let cdb = [0x28, 0, 0, 0, 0, 0, 0, 0, 1, 0];
        engine.submit_cdb(&cdb, None, tx1).unwrap();
        engine.submit_cdb(&cdb, None, tx2).unwrap();
        engine.fetch_request(4096).unwrap();

        engine.abort_all();

        let stats = engine.stats.lock().unwrap();
        assert_eq!(stats.aborted_unsubmitted_requests, 1);
        assert_eq!(stats.aborted_submitted_requests, 1);
    }

    #[test]
    fn hard_terminate_rejects_new_submissions() {
        let engine = userspace_engine();
        engine.request_hard_terminate();
        let (tx, _rx) = channel();
        let cdb = [0x28, 0, 0, 0, 0, 0, 0, 0, 1, 0];
        assert!(engine.submit_cdb(&cdb, None, tx).is_err());
    }

    #[test]
    fn flush_and_unmap_are_dispatched_as_distinct_request_types() {
        let engine = userspace_engine();
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();
        engine.submit_cdb(&[0x35, 0, 0, 0, 0, 0, 0, 0, 0, 0], None, tx1).unwrap();
        engine
            .submit_cdb(
                &[0x42, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 24, 0],
                None,
                tx2,
            )
            .unwrap();

        let first = engine.fetch_request(4096).unwrap();
        let second = engine.fetch_request(4096).unwrap();
        assert_eq!(first.request_type, RequestType::Flush);
        assert_eq!(second.request_type, RequestType::Unmap);
    }
}
