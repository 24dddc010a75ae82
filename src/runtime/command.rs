//! Asynchronous command submission to a [`DeviceChannel`].
//!
//! Every submitted command gets a channel-local [`CommandId`] drawn from a monotonic
//! counter and is tracked by its own record. A record is retired in two steps: the poller
//! that observes a terminal status marks it retired while holding the record lock, then
//! removes it from the table. A concurrent poller that already cloned the record sees
//! the mark and reports `UnknownCommand`, so a terminal status is delivered exactly once.
//!
//! `wait` gives up at its deadline but does not cancel the device operation; the command
//! keeps running and can still be polled afterwards.

use crate::driver::DeviceChannel;
use crate::driver::ioctl::{CommandPayload, CommandStatus};
use crate::error::{CxlError, CxlResult};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Identifier of a command submitted through a [`CommandChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CommandId(pub u64);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cmd#{}", self.0)
    }
}

/// Backoff bounds for [`CommandChannel::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Used by [`CommandChannel::wait_default`].
    pub timeout: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_micros(10),
            max_backoff: Duration::from_millis(1),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Outcome of a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandReport {
    status: CommandStatus,
    result: u64,
}

impl CommandReport {
    #[must_use]
    pub const fn status(&self) -> CommandStatus {
        self.status
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The device's result. Only a `Completed` command has one.
    #[must_use]
    pub const fn result(&self) -> Option<u64> {
        match self.status {
            CommandStatus::Completed => Some(self.result),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct CommandRecord {
    device_id: u64,
    opcode: u32,
    // Held across the device query so retirement cannot interleave with another poll.
    retired: Mutex<bool>,
}

pub struct CommandChannel {
    device: Arc<dyn DeviceChannel>,
    records: RwLock<HashMap<CommandId, Arc<CommandRecord>>>,
    next_id: AtomicU64,
    open: AtomicBool,
    policy: WaitPolicy,
}

impl fmt::Debug for CommandChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandChannel")
            .field("open", &self.is_open())
            .field("in_flight", &self.in_flight())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl CommandChannel {
    pub fn new(device: Arc<dyn DeviceChannel>) -> Self {
        Self::with_policy(device, WaitPolicy::default())
    }

    pub fn with_policy(device: Arc<dyn DeviceChannel>, policy: WaitPolicy) -> Self {
        tracing::info!("command channel opened");
        Self {
            device,
            records: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            open: AtomicBool::new(true),
            policy,
        }
    }

    #[must_use]
    pub const fn policy(&self) -> WaitPolicy {
        self.policy
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Commands submitted and not yet retired.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.records.read().len()
    }

    /// Queues `(opcode, address, data)` on the device.
    ///
    /// Only transport problems are reported here; what the device thinks of the command
    /// shows up as its status.
    ///
    /// # Errors
    /// `ChannelNotReady` after `close` or when the id space is exhausted; driver errors
    /// from the device.
    pub fn submit(&self, opcode: u32, address: u64, data: u64) -> CxlResult<CommandId> {
        if !self.is_open() {
            return Err(CxlError::ChannelNotReady("channel is closed".into()));
        }

        let raw = self
            .next_id
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| id.checked_add(1))
            .map_err(|_| CxlError::ChannelNotReady("command id space exhausted".into()))?;
        let id = CommandId(raw);

        let device_id = self.device.send(opcode, address, data)?;
        self.records.write().insert(
            id,
            Arc::new(CommandRecord {
                device_id,
                opcode,
                retired: Mutex::new(false),
            }),
        );

        tracing::debug!("submitted {id} (opcode {opcode:#x}, address {address:#x}, data {data:#x})");
        Ok(id)
    }

    /// Encodes and submits a typed payload.
    pub fn submit_payload(&self, payload: CommandPayload) -> CxlResult<CommandId> {
        let (opcode, address, data) = payload.encode()?;
        self.submit(opcode, address, data)
    }

    /// Checks the command once without blocking.
    ///
    /// A terminal status is returned to exactly one caller; the id is unknown afterwards.
    ///
    /// # Errors
    /// `UnknownCommand` for ids never submitted or already retired.
    pub fn poll(&self, id: CommandId) -> CxlResult<CommandReport> {
        let record = self
            .records
            .read()
            .get(&id)
            .cloned()
            .ok_or(CxlError::UnknownCommand { id: id.0 })?;

        let mut retired = record.retired.lock();
        if *retired {
            return Err(CxlError::UnknownCommand { id: id.0 });
        }

        let report = self.device.query(record.device_id)?;
        tracing::trace!("poll {id}: {:?}", report.status);

        if report.status.is_terminal() {
            *retired = true;
            drop(retired);
            self.records.write().remove(&id);
            tracing::debug!(
                "retired {id} (opcode {:#x}) with {:?}",
                record.opcode,
                report.status
            );
        }

        Ok(CommandReport {
            status: report.status,
            result: report.result,
        })
    }

    /// Polls until the command leaves `Active` or `timeout` has elapsed.
    ///
    /// Sleeps between polls with exponential backoff bounded by the policy and by the
    /// time left.
    ///
    /// # Errors
    /// `Timeout` once the deadline has passed with the command still active;
    /// `UnknownCommand` as for [`poll`](Self::poll).
    pub fn wait(&self, id: CommandId, timeout: Duration) -> CxlResult<CommandReport> {
        let start = Instant::now();
        let deadline = start.checked_add(timeout);
        let mut backoff = self.policy.initial_backoff;

        loop {
            let report = self.poll(id)?;
            if report.is_terminal() {
                return Ok(report);
            }

            let now = Instant::now();
            let sleep = match deadline {
                Some(deadline) if now >= deadline => {
                    let waited = now.duration_since(start);
                    tracing::warn!("{id} still active after {waited:?}");
                    return Err(CxlError::Timeout { id: id.0, waited });
                }
                Some(deadline) => backoff.min(deadline - now),
                None => backoff,
            };

            std::thread::sleep(sleep);
            backoff = backoff.saturating_mul(2).min(self.policy.max_backoff);
        }
    }

    /// [`wait`](Self::wait) with the policy's timeout.
    pub fn wait_default(&self, id: CommandId) -> CxlResult<CommandReport> {
        self.wait(id, self.policy.timeout)
    }

    /// Refuses further submissions. Commands already in flight can still be polled.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            tracing::info!(
                "command channel closed with {} command(s) in flight",
                self.in_flight()
            );
        }
    }
}
