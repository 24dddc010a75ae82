//! Timed workloads over the region.
//!
//! The harness reserves one arena from the [`MemoryManager`] and runs every workload
//! inside it, so measurements never trample blocks owned by other callers. Results are
//! typed: [`Bandwidth`], [`Latency`] and [`Throughput`].

use crate::driver::ioctl::CommandPayload;
use crate::error::{CxlError, CxlResult};
use crate::runtime::command::CommandChannel;
use crate::runtime::memory::{AllocFlags, Allocation, DEFAULT_ALIGNMENT, MemoryManager};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::fmt;
use std::hint::black_box;
use std::time::{Duration, Instant};

const NODE: usize = size_of::<u64>();
const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

// ===============================================================================================
// Reports
// ===============================================================================================

/// Transfer rate in bytes per second.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Bandwidth(f64);

impl Bandwidth {
    #[must_use]
    pub fn from_transfer(bytes: u64, elapsed: Duration) -> Self {
        Self(bytes as f64 / seconds(elapsed))
    }

    #[must_use]
    pub const fn bytes_per_second(self) -> f64 {
        self.0
    }

    #[must_use]
    pub fn gib_per_second(self) -> f64 {
        self.0 / GIB
    }
}

impl fmt::Display for Bandwidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} GiB/s", self.gib_per_second())
    }
}

/// Average time per dependent memory access.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Latency(f64);

impl Latency {
    #[must_use]
    pub fn per_access(elapsed: Duration, accesses: u64) -> Self {
        Self(elapsed.as_nanos() as f64 / accesses.max(1) as f64)
    }

    #[must_use]
    pub const fn nanos_per_access(self) -> f64 {
        self.0
    }
}

impl fmt::Display for Latency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1} ns/access", self.0)
    }
}

/// Operations per second.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Throughput(f64);

impl Throughput {
    #[must_use]
    pub fn from_ops(ops: u64, elapsed: Duration) -> Self {
        Self(ops as f64 / seconds(elapsed))
    }

    #[must_use]
    pub const fn ops_per_second(self) -> f64 {
        self.0
    }

    #[must_use]
    pub fn giga_ops_per_second(self) -> f64 {
        self.0 / 1e9
    }
}

impl fmt::Display for Throughput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3} Gop/s", self.giga_ops_per_second())
    }
}

fn seconds(elapsed: Duration) -> f64 {
    // A zero reading would divide by zero on coarse clocks.
    elapsed.max(Duration::from_nanos(1)).as_secs_f64()
}

/// Work done by `iterations` repetitions of `per_iteration` units, saturating at `u64::MAX`.
fn total_work(per_iteration: usize, iterations: usize) -> u64 {
    (per_iteration as u64).saturating_mul(iterations as u64)
}

// ===============================================================================================
// Workloads
// ===============================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

/// The FPGA test modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeOp {
    Memcpy = 1,
    Memfill = 2,
    Scale = 3,
}

impl TryFrom<u32> for ComputeOp {
    type Error = CxlError;

    fn try_from(value: u32) -> CxlResult<Self> {
        match value {
            1 => Ok(Self::Memcpy),
            2 => Ok(Self::Memfill),
            3 => Ok(Self::Scale),
            other => Err(CxlError::InvalidArgument(format!(
                "unknown compute operation {other} (expected 1=memcpy, 2=memfill, 3=scale)"
            ))),
        }
    }
}

/// Copy and fill are reported as bandwidth, scaling as element throughput.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ComputeReport {
    Bandwidth(Bandwidth),
    Throughput(Throughput),
}

impl fmt::Display for ComputeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bandwidth(b) => fmt::Display::fmt(b, f),
            Self::Throughput(t) => fmt::Display::fmt(t, f),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HarnessConfig {
    /// Arena size; `None` takes the largest free block.
    pub arena_size: Option<usize>,
    /// Shuffle seed for the pointer chase; `None` seeds from the OS.
    pub seed: Option<u64>,
    /// Nodes in the pointer chase, clamped to what fits in the arena.
    pub chase_nodes: usize,
    pub hops_per_iteration: usize,
    /// Working set of the compute workloads.
    pub compute_buffer: usize,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            arena_size: None,
            seed: None,
            chase_nodes: 1024 * 1024,
            hops_per_iteration: 1000,
            compute_buffer: 1024 * 1024,
        }
    }
}

/// Runs workloads inside an arena reserved from a [`MemoryManager`].
///
/// The arena is returned to the manager on drop.
#[derive(Debug)]
pub struct Harness<'m> {
    memory: &'m MemoryManager,
    arena: Option<Allocation>,
    config: HarnessConfig,
}

impl<'m> Harness<'m> {
    /// Reserves the arena.
    ///
    /// # Errors
    /// Allocator errors if the arena cannot be reserved.
    pub fn new(memory: &'m MemoryManager, config: HarnessConfig) -> CxlResult<Self> {
        let size = config
            .arena_size
            .unwrap_or_else(|| memory.allocator().largest_free() & !(DEFAULT_ALIGNMENT - 1));
        let arena = memory.allocate_with(size, AllocFlags::new())?;

        tracing::debug!(
            "harness arena at {:#x} ({:#x} bytes)",
            arena.offset(),
            arena.size()
        );

        Ok(Self {
            memory,
            arena: Some(arena),
            config,
        })
    }

    fn arena(&self) -> CxlResult<&Allocation> {
        self.arena
            .as_ref()
            .ok_or(CxlError::NotInitialized { op: "harness" })
    }

    #[must_use]
    pub fn arena_size(&self) -> usize {
        self.arena.as_ref().map_or(0, Allocation::size)
    }

    /// Offset of the `i`-th block, cycling through the arena.
    fn block_offset(&self, i: usize, block_size: usize) -> usize {
        let span = self.arena_size() - block_size;
        if span == 0 {
            0
        } else {
            i.wrapping_mul(block_size) % span
        }
    }

    fn check_block(&self, block_size: usize, iterations: usize) -> CxlResult<()> {
        if block_size == 0 || iterations == 0 {
            return Err(CxlError::InvalidArgument(
                "block size and iterations must be non-zero".into(),
            ));
        }
        if block_size > self.arena_size() {
            return Err(CxlError::InvalidArgument(format!(
                "block of {block_size:#x} bytes does not fit the {:#x} byte arena",
                self.arena_size()
            )));
        }
        Ok(())
    }

    /// Copies `block_size` bytes `iterations` times between host memory and the arena.
    ///
    /// # Errors
    /// `InvalidArgument` for zero sizes or blocks larger than the arena.
    pub fn measure_bandwidth(
        &self,
        block_size: usize,
        iterations: usize,
        mode: AccessMode,
    ) -> CxlResult<Bandwidth> {
        self.check_block(block_size, iterations)?;
        let arena = self.arena()?.ptr();
        let mut buffer = vec![0xA5u8; block_size];

        let start = Instant::now();
        for i in 0..iterations {
            let offset = self.block_offset(i, block_size);
            match mode {
                AccessMode::Read => arena.read_into(offset, &mut buffer)?,
                AccessMode::Write => arena.write(offset, &buffer)?,
            }
            black_box(&mut buffer);
        }
        let elapsed = start.elapsed();

        let bandwidth = Bandwidth::from_transfer(total_work(block_size, iterations), elapsed);
        tracing::debug!("{mode:?} bandwidth with {block_size:#x} byte blocks: {bandwidth}");
        Ok(bandwidth)
    }

    /// Walks a randomly ordered cyclic list built in the arena.
    ///
    /// # Errors
    /// `InvalidArgument` if the arena cannot hold two nodes or `iterations` is zero.
    pub fn measure_latency(&self, iterations: usize) -> CxlResult<Latency> {
        let nodes = self.config.chase_nodes.min(self.arena_size() / NODE);
        if nodes < 2 || iterations == 0 {
            return Err(CxlError::InvalidArgument(format!(
                "pointer chase needs at least 2 nodes and 1 iteration (got {nodes}, {iterations})"
            )));
        }

        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let chase = build_chase(nodes, &mut rng);
        let bytes: Vec<u8> = chase.iter().flat_map(|next| next.to_ne_bytes()).collect();

        let arena = self.arena()?.ptr();
        arena.write(0, &bytes)?;

        let hops = self.config.hops_per_iteration.max(1);
        // SAFETY: the arena is owned by this harness and no command has been handed its
        // address, so nothing writes to it during the walk.
        let elapsed = unsafe {
            arena.with_slice(0, bytes.len(), |list| -> CxlResult<Duration> {
                walk(list, 0, nodes)?;

                let start = Instant::now();
                let mut index = 0;
                for _ in 0..iterations {
                    index = walk(list, index, hops)?;
                }
                let elapsed = start.elapsed();
                black_box(index);
                Ok(elapsed)
            })?
        }?;

        let latency = Latency::per_access(elapsed, total_work(iterations, hops));
        tracing::debug!("pointer chase over {nodes} nodes: {latency}");
        Ok(latency)
    }

    /// Host-side versions of the FPGA test modes.
    ///
    /// # Errors
    /// `InvalidArgument` if `iterations` is zero.
    pub fn measure_compute(&self, op: ComputeOp, iterations: usize) -> CxlResult<ComputeReport> {
        let buffer = self.config.compute_buffer.min(self.arena_size());
        self.check_block(buffer, iterations)?;
        let arena = self.arena()?.ptr();

        let report = match op {
            ComputeOp::Memcpy => {
                let src = vec![0xAAu8; buffer];
                let start = Instant::now();
                for i in 0..iterations {
                    arena.write(self.block_offset(i, buffer), &src)?;
                }
                ComputeReport::Bandwidth(Bandwidth::from_transfer(
                    total_work(buffer, iterations),
                    start.elapsed(),
                ))
            }
            ComputeOp::Memfill => {
                let start = Instant::now();
                for i in 0..iterations {
                    arena.fill(self.block_offset(i, buffer), buffer, i as u8)?;
                }
                ComputeReport::Bandwidth(Bandwidth::from_transfer(
                    total_work(buffer, iterations),
                    start.elapsed(),
                ))
            }
            ComputeOp::Scale => {
                let elements = buffer / size_of::<f32>();
                let len = elements * size_of::<f32>();
                // SAFETY: exclusive arena, see `measure_latency`.
                let elapsed = unsafe {
                    arena.with_slice_mut(0, len, |data| {
                        for (i, chunk) in data.chunks_exact_mut(4).enumerate() {
                            chunk.copy_from_slice(&(i as f32).to_ne_bytes());
                        }

                        let start = Instant::now();
                        for i in 0..iterations {
                            let scalar = i as f32 * 0.01;
                            for chunk in data.chunks_exact_mut(4) {
                                let mut word = [0u8; 4];
                                word.copy_from_slice(chunk);
                                let value = f32::from_ne_bytes(word) * scalar;
                                chunk.copy_from_slice(&value.to_ne_bytes());
                            }
                        }
                        start.elapsed()
                    })?
                };
                ComputeReport::Throughput(Throughput::from_ops(
                    total_work(elements, iterations),
                    elapsed,
                ))
            }
        };

        tracing::debug!("{op:?} over {buffer:#x} bytes: {report}");
        Ok(report)
    }

    /// Runs a test mode on the device instead of the host, one command per iteration.
    ///
    /// Copy moves the first half of the working set onto the second half.
    ///
    /// # Errors
    /// Submission errors, `Timeout`, or `Driver` if the device fails a command.
    pub fn measure_offload(
        &self,
        channel: &CommandChannel,
        op: ComputeOp,
        iterations: usize,
        timeout: Duration,
    ) -> CxlResult<ComputeReport> {
        let buffer = self.config.compute_buffer.min(self.arena_size());
        self.check_block(buffer, iterations)?;
        let base = self.arena()?.address();
        let to_u32 = |v: u64| {
            u32::try_from(v).map_err(|_| {
                CxlError::InvalidArgument(format!("{v:#x} does not fit a 32-bit command field"))
            })
        };

        let payload = |i: usize| -> CxlResult<CommandPayload> {
            Ok(match op {
                ComputeOp::Memcpy => {
                    let half = (buffer / 2) as u64;
                    CommandPayload::Copy {
                        src: to_u32(base)?,
                        dst: base + half,
                        len: to_u32(half)?,
                    }
                }
                ComputeOp::Memfill => CommandPayload::Fill {
                    offset: base,
                    len: buffer as u64,
                    byte: i as u8,
                },
                ComputeOp::Scale => CommandPayload::Scale {
                    offset: base,
                    count: to_u32((buffer / size_of::<f32>()) as u64)?,
                    factor: i as f32 * 0.01,
                },
            })
        };

        let mut processed = 0u64;
        let start = Instant::now();
        for i in 0..iterations {
            let id = channel.submit_payload(payload(i)?)?;
            let report = channel.wait(id, timeout)?;
            processed += report.result().ok_or_else(|| {
                CxlError::Driver(format!("{id} finished with {:?}", report.status()))
            })?;
        }
        let elapsed = start.elapsed();

        Ok(match op {
            ComputeOp::Memcpy | ComputeOp::Memfill => {
                ComputeReport::Bandwidth(Bandwidth::from_transfer(processed, elapsed))
            }
            ComputeOp::Scale => ComputeReport::Throughput(Throughput::from_ops(processed, elapsed)),
        })
    }
}

impl Drop for Harness<'_> {
    fn drop(&mut self) {
        if let Some(arena) = self.arena.take()
            && let Err(e) = self.memory.free(arena)
        {
            tracing::warn!("failed to release harness arena: {e}");
        }
    }
}

/// Next-index table of a single cycle through all `nodes` in random order.
fn build_chase(nodes: usize, rng: &mut StdRng) -> Vec<u64> {
    let mut order: Vec<usize> = (0..nodes).collect();
    order.shuffle(rng);

    let mut next = vec![0u64; nodes];
    for pair in order.windows(2) {
        next[pair[0]] = pair[1] as u64;
    }
    next[order[nodes - 1]] = order[0] as u64;
    next
}

/// Follows `hops` links from `index` in a chase table stored as native-endian `u64`s.
fn walk(list: &[u8], mut index: usize, hops: usize) -> CxlResult<usize> {
    let nodes = list.len() / NODE;
    for _ in 0..hops {
        if index >= nodes {
            return Err(CxlError::Driver(format!(
                "pointer chase left the table at {index}"
            )));
        }
        let at = index * NODE;
        let word = &list[at..at + NODE];
        let mut raw = [0u8; NODE];
        raw.copy_from_slice(word);
        index = u64::from_ne_bytes(raw) as usize;
    }
    Ok(index)
}
