use cxl_rs::driver::ioctl::{CommandPayload, CommandStatus};
use cxl_rs::driver::source::DeviceFileSource;
use cxl_rs::runtime::memory::DEFAULT_ALIGNMENT;
use cxl_rs::runtime::{AccessMode, Context, Harness, HarnessConfig};
use cxl_rs::{CxlConfig, CxlError, MemoryManager};
use std::time::Duration;

const MIB: usize = 1024 * 1024;

fn sim_config(region_size: usize) -> CxlConfig {
    let mut config = CxlConfig {
        region_size,
        ..CxlConfig::default()
    };
    config.sim.latency = Duration::from_micros(20);
    config
}

#[test]
fn one_mebibyte_allocation_scenario() {
    let ctx = Context::open_anonymous(sim_config(MIB)).unwrap();
    let allocator = ctx.memory().allocator();

    assert_eq!(allocator.allocate(MIB - 64, 64).unwrap(), 0);
    assert!(matches!(
        allocator.allocate(128, DEFAULT_ALIGNMENT),
        Err(CxlError::OutOfMemory { .. })
    ));
    allocator.free(0).unwrap();
    assert_eq!(allocator.allocate(128, DEFAULT_ALIGNMENT).unwrap(), 0);
}

#[test]
fn file_backed_region_persists_writes() {
    let file = tempfile::NamedTempFile::new().unwrap();
    file.as_file().set_len(MIB as u64).unwrap();

    {
        let memory = MemoryManager::open(DeviceFileSource::new(file.path()), MIB).unwrap();
        let block = memory.allocate(512).unwrap();
        block.write(0, b"persisted").unwrap();
        assert_eq!(block.offset(), 0);
        memory.free(block).unwrap();
    }

    let bytes = std::fs::read(file.path()).unwrap();
    assert_eq!(&bytes[..9], b"persisted");
}

#[test]
fn device_commands_operate_on_allocated_blocks() {
    let ctx = Context::open_anonymous(sim_config(4 * MIB)).unwrap();
    let dev = ctx.attach_simulator().unwrap();
    let channel = ctx.channel(dev).unwrap();
    let memory = ctx.memory();

    let src = memory.allocate(MIB).unwrap();
    let dst = memory.allocate(MIB).unwrap();
    let pattern: Vec<u8> = (0..MIB).map(|i| (i % 253) as u8).collect();
    src.write(0, &pattern).unwrap();

    let ids: Vec<_> = (0..4)
        .map(|quarter| {
            let at = quarter * (MIB / 4);
            channel
                .submit_payload(CommandPayload::Copy {
                    src: (src.offset() + at) as u32,
                    dst: (dst.offset() + at) as u64,
                    len: (MIB / 4) as u32,
                })
                .unwrap()
        })
        .collect();

    for id in ids {
        let report = channel.wait(id, Duration::from_secs(10)).unwrap();
        assert_eq!(report.status(), CommandStatus::Completed);
        assert_eq!(report.result(), Some((MIB / 4) as u64));
        assert!(matches!(
            channel.poll(id),
            Err(CxlError::UnknownCommand { .. })
        ));
    }
    assert_eq!(dst.read(0, MIB).unwrap(), pattern);

    memory.free(src).unwrap();
    memory.free(dst).unwrap();
    assert_eq!(memory.stats().used, 0);
}

#[test]
fn harness_runs_next_to_live_allocations() {
    let ctx = Context::open_anonymous(sim_config(8 * MIB)).unwrap();
    let pinned = ctx.memory().allocate(MIB).unwrap();
    pinned.fill(0, MIB, 0x11).unwrap();

    {
        let harness = Harness::new(
            ctx.memory(),
            HarnessConfig {
                seed: Some(42),
                chase_nodes: 16 * 1024,
                hops_per_iteration: 200,
                ..HarnessConfig::default()
            },
        )
        .unwrap();
        assert_eq!(harness.arena_size(), 7 * MIB);

        for block in [1, 64, MIB] {
            harness.measure_bandwidth(block, 32, AccessMode::Write).unwrap();
            harness.measure_bandwidth(block, 32, AccessMode::Read).unwrap();
        }
        assert!(harness.measure_latency(20).unwrap().nanos_per_access() >= 0.0);
    }

    assert!(pinned.read(0, MIB).unwrap().iter().all(|&b| b == 0x11));
    ctx.memory().free(pinned).unwrap();
}

#[test]
fn closing_the_context_fails_later_accesses_cleanly() {
    let ctx = Context::open_anonymous(sim_config(MIB)).unwrap();
    let block = ctx.memory().allocate(256).unwrap();
    let handle = block.ptr().clone();

    ctx.close();
    assert!(matches!(
        block.write(0, b"late"),
        Err(CxlError::NotInitialized { .. })
    ));
    assert!(matches!(
        handle.read(0, 4),
        Err(CxlError::NotInitialized { .. })
    ));
}
