use cxl_rs::CxlConfig;
use cxl_rs::runtime::Context;
use std::process;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("--- CXL Runtime Context ---");

    let config = CxlConfig::from_env()?;
    let use_device = config.device_path.exists();

    // Without the region there is nothing to report.
    let opened = if use_device {
        Context::open_device(config)
    } else {
        Context::open_anonymous(config)
    };
    let context = match opened {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("Error mapping the CXL region (Is the driver loaded?): {e}");
            process::exit(1);
        }
    };

    let config = context.config();
    println!("\n--- Configuration ---");
    println!("Device Path:       {}", config.device_path.display());
    println!("Region Size:       {} MB", config.region_size / 1024 / 1024);
    println!("Default Alignment: {} bytes", config.default_align);
    println!("Wait Timeout:      {:?}", config.wait.timeout);
    println!(
        "Wait Backoff:      {:?} .. {:?}",
        config.wait.initial_backoff, config.wait.max_backoff
    );

    println!("\n--- Region ---");
    println!("Backing:           {}", context.region().origin());
    println!("Live:              {}", context.region().is_live());

    let stats = context.memory().stats();
    println!("\n--- Allocator ---");
    println!("Total:             {:#x}", stats.total);
    println!("Used:              {:#x}", stats.used);
    println!("Free:              {:#x}", stats.free);
    println!("Largest Free:      {:#x}", context.memory().allocator().largest_free());

    if use_device {
        context.attach_cxl_device()?;
    } else {
        context.attach_simulator()?;
    }

    println!("\n--- Devices ---");
    for dev in context.devices() {
        let channel = context.channel(dev)?;
        println!("[{dev}] {channel:?}");
    }

    context.close();
    println!("\nContext closed.");
    Ok(())
}
