use cxl_rs::CxlConfig;
use cxl_rs::runtime::{AccessMode, ComputeOp, Context, Harness, HarnessConfig};
use std::process;
use tracing_subscriber::EnvFilter;

const BLOCK_SIZES: [usize; 5] = [4 << 10, 16 << 10, 64 << 10, 256 << 10, 1 << 20];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let iterations: usize = match args.next() {
        Some(raw) => raw.parse()?,
        None => 1000,
    };
    let seed: Option<u64> = args.next().map(|raw| raw.parse()).transpose()?;

    println!("============================================================");
    println!("                 CXL Region Benchmark Sweep                 ");
    println!("============================================================");

    let config = CxlConfig::from_env()?;
    let context = if config.device_path.exists() {
        Context::open_device(config)
    } else {
        println!("[!] {} not present, using anonymous memory", config.device_path.display());
        Context::open_anonymous(config)
    };
    let context = match context {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("Failed to map the CXL region: {e}");
            process::exit(1);
        }
    };
    println!("[+] Region: {} ({} MB)", context.region().origin(), context.region().size() >> 20);

    let harness = Harness::new(
        context.memory(),
        HarnessConfig {
            seed,
            ..HarnessConfig::default()
        },
    )?;
    println!("[+] Arena: {} MB, {iterations} iterations\n", harness.arena_size() >> 20);

    println!("{:>10} | {:>14} | {:>14}", "block", "write", "read");
    println!("{:-<10}-+-{:-<14}-+-{:-<14}", "", "", "");
    for block in BLOCK_SIZES {
        if block > harness.arena_size() {
            continue;
        }
        let write = harness.measure_bandwidth(block, iterations, AccessMode::Write)?;
        let read = harness.measure_bandwidth(block, iterations, AccessMode::Read)?;
        println!("{:>8} K | {:>14} | {:>14}", block >> 10, write.to_string(), read.to_string());
    }

    let latency = harness.measure_latency(iterations)?;
    println!("\n[+] Pointer-chase latency: {latency}");

    println!("\n[+] Host compute modes");
    for op in [ComputeOp::Memcpy, ComputeOp::Memfill, ComputeOp::Scale] {
        let report = harness.measure_compute(op, iterations.min(100))?;
        println!("    {op:?}: {report}");
    }

    Ok(())
}
