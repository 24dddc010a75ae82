use cxl_rs::driver::ioctl::{CommandPayload, CommandStatus};
use cxl_rs::runtime::{AllocFlags, Context};
use cxl_rs::{CxlConfig, CxlError, CxlResult};
use std::process;
use tracing_subscriber::EnvFilter;

fn f32s(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn run(context: &Context) -> CxlResult<()> {
    let memory = context.memory();
    let id = context.attach_simulator()?;
    let channel = context.channel(id)?;
    println!("[+] Attached simulated FPGA as {id}");

    let src = memory.allocate_with(4096, AllocFlags::new().zeroed())?;
    let dst = memory.allocate_with(4096, AllocFlags::new().zeroed())?;
    src.write(0, b"staged through CXL memory")?;

    // 1. Fill
    let cmd = channel.submit_payload(CommandPayload::Fill {
        offset: dst.address(),
        len: 64,
        byte: 0x5A,
    })?;
    let report = channel.wait_default(cmd)?;
    println!("[+] {cmd} fill   -> {:?} ({:?} bytes)", report.status(), report.result());

    // 2. Copy
    let len = 25;
    let cmd = channel.submit_payload(CommandPayload::Copy {
        src: u32::try_from(src.address())
            .map_err(|_| CxlError::InvalidArgument("source beyond the 32-bit copy window".into()))?,
        dst: dst.address(),
        len,
    })?;
    let report = channel.wait_default(cmd)?;
    println!("[+] {cmd} copy   -> {:?} ({:?} bytes)", report.status(), report.result());
    println!(
        "    dst now reads {:?}",
        String::from_utf8_lossy(&dst.read(0, len as usize)?)
    );

    // 3. Scale
    let values: Vec<u8> = (1..=8).flat_map(|v| (v as f32).to_ne_bytes()).collect();
    src.write(0, &values)?;
    let cmd = channel.submit_payload(CommandPayload::Scale {
        offset: src.address(),
        count: 8,
        factor: 0.5,
    })?;
    let report = channel.wait_default(cmd)?;
    println!("[+] {cmd} scale  -> {:?} ({:?} elements)", report.status(), report.result());
    println!("    values now {:?}", f32s(&src.read(0, 32)?));

    // 4. Unknown opcode
    let cmd = channel.submit(0x7F, 0, 0)?;
    let report = channel.wait_default(cmd)?;
    let verdict = if report.status() == CommandStatus::Invalid {
        "rejected as expected"
    } else {
        "unexpected"
    };
    println!("[+] {cmd} opcode 0x7f -> {:?} ({verdict})", report.status());

    match channel.poll(cmd) {
        Err(e) => println!("[+] polling a retired command: {e}"),
        Ok(report) => println!("[!] retired command still answered {report:?}"),
    }

    memory.free(src)?;
    memory.free(dst)?;
    context.detach_device(id)?;
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("============================================================");
    println!("              CXL Command Round Trip (simulated)            ");
    println!("============================================================");

    let mut config = CxlConfig::from_env()?;
    config.region_size = config.region_size.min(64 << 20);

    let context = match Context::open_anonymous(config) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("Failed to map the CXL region: {e}");
            process::exit(1);
        }
    };

    run(&context)?;
    println!("[+] Done.");
    Ok(())
}
