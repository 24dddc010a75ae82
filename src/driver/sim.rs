//! An in-process stand-in for the FPGA.
//!
//! Commands are queued by [`DeviceChannel::send`] and executed in order by one worker
//! thread against the region through a [`RegionPtr`], so a closed region turns every
//! later command into an `Error` instead of a fault.

use crate::driver::ioctl::{CommandPayload, CommandStatus};
use crate::driver::{DeviceChannel, DeviceReport};
use crate::error::{CxlError, CxlResult};
use crate::runtime::region::RegionPtr;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct SimConfig {
    /// Time each command stays `Active` before it executes.
    pub latency: Duration,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            latency: Duration::from_micros(50),
        }
    }
}

#[derive(Debug)]
struct Job {
    id: u64,
    opcode: u32,
    address: u64,
    data: u64,
}

#[derive(Debug, Default)]
struct Shared {
    queue: Mutex<VecDeque<Job>>,
    ready: Condvar,
    reports: Mutex<HashMap<u64, DeviceReport>>,
    shutdown: AtomicBool,
}

#[derive(Debug)]
pub struct SimulatedDevice {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedDevice {
    /// Starts the worker thread executing commands against `region`.
    ///
    /// # Errors
    /// Returns `Io` if the thread cannot be spawned.
    pub fn new(region: RegionPtr, config: SimConfig) -> CxlResult<Self> {
        let shared = Arc::new(Shared::default());
        let worker_shared = shared.clone();

        let worker = std::thread::Builder::new()
            .name("cxl-sim".into())
            .spawn(move || run(&worker_shared, &region, config))?;

        tracing::info!(
            "simulated FPGA started (latency {:?})",
            config.latency
        );

        Ok(Self {
            shared,
            next_id: AtomicU64::new(1),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Number of commands queued but not yet picked up by the worker.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Stops the worker. Queued commands that have not started stay `Active`.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.ready.notify_all();

        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                tracing::error!("simulated FPGA worker panicked");
            } else {
                tracing::info!("simulated FPGA stopped");
            }
        }
    }
}

impl Drop for SimulatedDevice {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl DeviceChannel for SimulatedDevice {
    fn send(&self, opcode: u32, address: u64, data: u64) -> CxlResult<u64> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(CxlError::Driver("simulated FPGA is shut down".into()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.reports.lock().insert(
            id,
            DeviceReport {
                status: CommandStatus::Active,
                result: 0,
            },
        );
        self.shared.queue.lock().push_back(Job {
            id,
            opcode,
            address,
            data,
        });
        self.shared.ready.notify_one();
        Ok(id)
    }

    fn query(&self, id: u64) -> CxlResult<DeviceReport> {
        let mut reports = self.shared.reports.lock();
        let report = match reports.get(&id).copied() {
            Some(report) if report.status.is_terminal() => reports.remove(&id),
            other => other,
        };

        Ok(report.unwrap_or(DeviceReport {
            status: CommandStatus::Invalid,
            result: 0,
        }))
    }
}

fn run(shared: &Shared, region: &RegionPtr, config: SimConfig) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                if let Some(job) = queue.pop_front() {
                    break job;
                }
                shared.ready.wait(&mut queue);
            }
        };

        if !config.latency.is_zero() {
            std::thread::sleep(config.latency);
        }

        let report = execute(region, job.opcode, job.address, job.data);
        tracing::trace!(
            "simulated FPGA finished command {} (opcode {:#x}): {:?}",
            job.id,
            job.opcode,
            report.status
        );
        shared.reports.lock().insert(job.id, report);
    }
}

fn execute(region: &RegionPtr, opcode: u32, address: u64, data: u64) -> DeviceReport {
    let Some(payload) = CommandPayload::decode(opcode, address, data) else {
        return DeviceReport {
            status: CommandStatus::Invalid,
            result: 0,
        };
    };

    match apply(region, payload) {
        Ok(result) => DeviceReport {
            status: CommandStatus::Completed,
            result,
        },
        Err(e) => {
            tracing::debug!("simulated FPGA rejected {payload:?}: {e}");
            DeviceReport {
                status: CommandStatus::Error,
                result: 0,
            }
        }
    }
}

fn to_offset(value: u64) -> CxlResult<usize> {
    usize::try_from(value)
        .map_err(|_| CxlError::InvalidArgument(format!("offset {value:#x} exceeds address space")))
}

/// Runs one payload and returns the bytes or elements it processed.
fn apply(region: &RegionPtr, payload: CommandPayload) -> CxlResult<u64> {
    match payload {
        CommandPayload::Nop => Ok(0),
        CommandPayload::Copy { src, dst, len } => {
            region.copy_within(src as usize, to_offset(dst)?, len as usize)?;
            Ok(u64::from(len))
        }
        CommandPayload::Fill { offset, len, byte } => {
            region.fill(to_offset(offset)?, to_offset(len)?, byte)?;
            Ok(len)
        }
        CommandPayload::Scale {
            offset,
            count,
            factor,
        } => {
            let offset = to_offset(offset)?;
            let bytes = (count as usize)
                .checked_mul(size_of::<f32>())
                .ok_or_else(|| CxlError::InvalidArgument(format!("scale count {count} overflows")))?;
            let in_range = offset
                .checked_add(bytes)
                .and_then(|end| end.checked_add(region.offset()))
                .is_some_and(|end| end <= region.region_size());
            if !in_range {
                return Err(CxlError::OutOfBounds {
                    op: "scale",
                    offset,
                    len: bytes,
                    size: region.region_size(),
                });
            }

            let mut values = region.read(offset, bytes)?;
            for chunk in values.chunks_exact_mut(size_of::<f32>()) {
                let mut word = [0u8; 4];
                word.copy_from_slice(chunk);
                let scaled = f32::from_ne_bytes(word) * factor;
                chunk.copy_from_slice(&scaled.to_ne_bytes());
            }
            region.write(offset, &values)?;
            Ok(u64::from(count))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::ioctl::CMD_MEM_FILL;
    use crate::driver::source::AnonymousSource;
    use crate::runtime::region::MappedRegion;
    use std::time::Instant;

    fn setup(latency: Duration) -> (MappedRegion, SimulatedDevice) {
        let region = MappedRegion::open(AnonymousSource, 64 * 1024).unwrap();
        let device = SimulatedDevice::new(region.handle().unwrap(), SimConfig { latency }).unwrap();
        (region, device)
    }

    fn run_to_end(device: &SimulatedDevice, payload: CommandPayload) -> DeviceReport {
        let (opcode, address, data) = payload.encode().unwrap();
        let id = device.send(opcode, address, data).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let report = device.query(id).unwrap();
            if report.status.is_terminal() {
                return report;
            }
            assert!(Instant::now() < deadline, "command {id} never finished");
            std::thread::sleep(Duration::from_micros(100));
        }
    }

    #[test]
    fn copy_moves_bytes_inside_the_region() {
        let (region, device) = setup(Duration::ZERO);
        region.write(0x100, b"accelerated").unwrap();

        let report = run_to_end(
            &device,
            CommandPayload::Copy {
                src: 0x100,
                dst: 0x2000,
                len: 11,
            },
        );
        assert_eq!(report.status, CommandStatus::Completed);
        assert_eq!(report.result, 11);
        assert_eq!(region.read(0x2000, 11).unwrap(), b"accelerated");
    }

    #[test]
    fn fill_and_scale_report_work_done() {
        let (region, device) = setup(Duration::ZERO);

        let report = run_to_end(
            &device,
            CommandPayload::Fill {
                offset: 0,
                len: 256,
                byte: 0xAB,
            },
        );
        assert_eq!(report.result, 256);
        assert!(region.read(0, 256).unwrap().iter().all(|&b| b == 0xAB));

        let input: Vec<u8> = [1.0f32, 2.5, -4.0]
            .iter()
            .flat_map(|v| v.to_ne_bytes())
            .collect();
        region.write(0x1000, &input).unwrap();
        let report = run_to_end(
            &device,
            CommandPayload::Scale {
                offset: 0x1000,
                count: 3,
                factor: 2.0,
            },
        );
        assert_eq!(report.result, 3);

        let out = region.read(0x1000, 12).unwrap();
        let values: Vec<f32> = out
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(values, vec![2.0, 5.0, -8.0]);
    }

    #[test]
    fn unknown_opcode_is_invalid_and_bad_range_is_error() {
        let (_region, device) = setup(Duration::ZERO);

        let id = device.send(0x42, 0, 0).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let status = loop {
            let report = device.query(id).unwrap();
            if report.status.is_terminal() {
                break report.status;
            }
            assert!(Instant::now() < deadline);
            std::thread::yield_now();
        };
        assert_eq!(status, CommandStatus::Invalid);

        let report = run_to_end(
            &device,
            CommandPayload::Fill {
                offset: 60 * 1024,
                len: 8 * 1024,
                byte: 0,
            },
        );
        assert_eq!(report.status, CommandStatus::Error);
    }

    #[test]
    fn scale_count_beyond_the_region_is_an_error() {
        let (region, device) = setup(Duration::ZERO);
        let report = run_to_end(
            &device,
            CommandPayload::Scale {
                offset: 0,
                count: u32::MAX,
                factor: 1.0,
            },
        );
        assert_eq!(report.status, CommandStatus::Error);
        assert_eq!(report.result, 0);

        let report = run_to_end(
            &device,
            CommandPayload::Scale {
                offset: (region.size() - 8) as u64,
                count: 3,
                factor: 2.0,
            },
        );
        assert_eq!(report.status, CommandStatus::Error);
    }

    #[test]
    fn terminal_reports_are_forgotten_after_one_query() {
        let (_region, device) = setup(Duration::ZERO);
        let (opcode, address, data) = CommandPayload::Nop.encode().unwrap();
        let id = device.send(opcode, address, data).unwrap();

        let report = run_to_end_by_id(&device, id);
        assert_eq!(report.status, CommandStatus::Completed);
        assert_eq!(device.query(id).unwrap().status, CommandStatus::Invalid);
    }

    fn run_to_end_by_id(device: &SimulatedDevice, id: u64) -> DeviceReport {
        loop {
            let report = device.query(id).unwrap();
            if report.status.is_terminal() {
                return report;
            }
            std::thread::yield_now();
        }
    }

    #[test]
    fn latency_keeps_commands_active() {
        let (_region, device) = setup(Duration::from_millis(200));
        let id = device
            .send(CMD_MEM_FILL, 0, (16 << 8) | 0x11)
            .unwrap();
        assert_eq!(device.query(id).unwrap().status, CommandStatus::Active);
    }

    #[test]
    fn commands_against_a_closed_region_fail() {
        let (region, device) = setup(Duration::ZERO);
        region.close();
        let report = run_to_end(
            &device,
            CommandPayload::Fill {
                offset: 0,
                len: 16,
                byte: 1,
            },
        );
        assert_eq!(report.status, CommandStatus::Error);
    }

    #[test]
    fn send_after_shutdown_fails() {
        let (_region, device) = setup(Duration::ZERO);
        device.shutdown();
        assert!(matches!(device.send(0, 0, 0), Err(CxlError::Driver(_))));
    }
}
