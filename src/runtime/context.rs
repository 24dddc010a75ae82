use crate::driver::DeviceChannel;
use crate::driver::device::CxlDevice;
use crate::driver::registry::{DeviceId, DeviceRegistry};
use crate::driver::sim::SimulatedDevice;
use crate::driver::source::{AnonymousSource, DeviceFileSource, RegionSource};
use crate::error::{CxlError, CxlResult};
use crate::runtime::command::CommandChannel;
use crate::runtime::config::CxlConfig;
use crate::runtime::memory::MemoryManager;
use crate::runtime::region::MappedRegion;
use std::sync::Arc;

// ===============================================================================================
// Context
// ===============================================================================================

/// The runtime: one mapped region, its allocator, and the command channels of every
/// attached device.
///
/// Contexts are plain owned values. Several can coexist, each with its own region.
#[derive(Debug)]
pub struct Context {
    config: CxlConfig,
    memory: MemoryManager,
    devices: DeviceRegistry<CommandChannel>,
}

impl Context {
    /// Maps `config.region_size` bytes from `source`.
    ///
    /// A process cannot do anything useful without its region, so callers are expected
    /// to treat an error here as fatal.
    ///
    /// # Errors
    /// Invalid configuration, or `NotFound`/`MapFailed` from the source.
    pub fn open(config: CxlConfig, source: impl RegionSource + 'static) -> CxlResult<Self> {
        config.validate()?;

        let region = MappedRegion::open(source, config.region_size)?;
        let memory = MemoryManager::new(region).with_default_align(config.default_align)?;

        tracing::info!(
            "CXL context ready: {} ({:#x} bytes, align {})",
            memory.region().origin(),
            config.region_size,
            config.default_align
        );

        Ok(Self {
            config,
            memory,
            devices: DeviceRegistry::new(),
        })
    }

    /// Maps the device node named by `config.device_path`.
    pub fn open_device(config: CxlConfig) -> CxlResult<Self> {
        let source = DeviceFileSource::new(&config.device_path);
        Self::open(config, source)
    }

    /// Maps anonymous memory, for hosts without the hardware.
    pub fn open_anonymous(config: CxlConfig) -> CxlResult<Self> {
        Self::open(config, AnonymousSource)
    }

    #[must_use]
    pub const fn config(&self) -> &CxlConfig {
        &self.config
    }

    #[must_use]
    pub const fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    #[must_use]
    pub const fn region(&self) -> &MappedRegion {
        self.memory.region()
    }

    /// Wraps `device` in a command channel using the configured wait policy.
    pub fn attach_device(&self, device: Arc<dyn DeviceChannel>) -> CxlResult<DeviceId> {
        let channel = CommandChannel::with_policy(device, self.config.wait);
        let id = self.devices.register(Arc::new(channel))?;
        tracing::info!("attached device {id}");
        Ok(id)
    }

    /// Attaches the FPGA behind `config.device_path`.
    pub fn attach_cxl_device(&self) -> CxlResult<DeviceId> {
        let device = CxlDevice::open(&self.config.device_path)?;
        self.attach_device(Arc::new(device))
    }

    /// Attaches a simulated FPGA operating on this context's region.
    pub fn attach_simulator(&self) -> CxlResult<DeviceId> {
        let device = SimulatedDevice::new(self.region().handle()?, self.config.sim)?;
        self.attach_device(Arc::new(device))
    }

    /// Removes the device and closes its channel. Commands still in flight can be polled
    /// through channel handles obtained earlier.
    pub fn detach_device(&self, id: DeviceId) -> CxlResult<()> {
        let channel = self.devices.unregister(id)?;
        channel.close();
        tracing::info!("detached device {id}");
        Ok(())
    }

    /// # Errors
    /// `UnknownDevice` if `id` is not attached.
    pub fn channel(&self, id: DeviceId) -> CxlResult<Arc<CommandChannel>> {
        self.devices
            .get(id)
            .ok_or(CxlError::UnknownDevice { id: id.0 })
    }

    #[must_use]
    pub fn devices(&self) -> Vec<DeviceId> {
        self.devices.ids()
    }

    /// Detaches every device and unmaps the region. Idempotent.
    pub fn close(&self) {
        for (id, channel) in self.devices.drain() {
            channel.close();
            tracing::debug!("detached device {id} on close");
        }
        self.memory.region().close();
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::ioctl::{CommandPayload, CommandStatus};
    use std::time::Duration;

    fn config() -> CxlConfig {
        let mut config = CxlConfig {
            region_size: 1 << 20,
            ..CxlConfig::default()
        };
        config.sim.latency = Duration::ZERO;
        config
    }

    #[test]
    fn missing_device_node_fails_open() {
        let config = CxlConfig {
            device_path: "/nonexistent/cxl9".into(),
            ..config()
        };
        assert!(matches!(
            Context::open_device(config),
            Err(CxlError::NotFound { .. })
        ));
    }

    #[test]
    fn simulator_executes_commands_on_the_context_region() {
        let ctx = Context::open_anonymous(config()).unwrap();
        let dev = ctx.attach_simulator().unwrap();
        let channel = ctx.channel(dev).unwrap();

        let block = ctx.memory().allocate(4096).unwrap();
        let id = channel
            .submit_payload(CommandPayload::Fill {
                offset: block.address(),
                len: 4096,
                byte: 0x7E,
            })
            .unwrap();
        let report = channel.wait(id, Duration::from_secs(5)).unwrap();

        assert_eq!(report.status(), CommandStatus::Completed);
        assert_eq!(report.result(), Some(4096));
        assert!(block.read(0, 4096).unwrap().iter().all(|&b| b == 0x7E));
        ctx.memory().free(block).unwrap();
    }

    #[test]
    fn detached_devices_are_gone() {
        let ctx = Context::open_anonymous(config()).unwrap();
        let a = ctx.attach_simulator().unwrap();
        let b = ctx.attach_simulator().unwrap();
        assert_eq!(ctx.devices(), vec![a, b]);

        let channel = ctx.channel(a).unwrap();
        ctx.detach_device(a).unwrap();
        assert!(!channel.is_open());
        assert!(matches!(
            ctx.channel(a),
            Err(CxlError::UnknownDevice { .. })
        ));
        assert!(ctx.detach_device(a).is_err());
        assert_eq!(ctx.devices(), vec![b]);
    }

    #[test]
    fn close_unmaps_and_detaches() {
        let ctx = Context::open_anonymous(config()).unwrap();
        ctx.attach_simulator().unwrap();
        let handle = ctx.region().handle().unwrap();

        ctx.close();
        ctx.close();
        assert!(ctx.devices().is_empty());
        assert!(!handle.is_live());
        assert!(matches!(
            ctx.memory().allocate(64),
            Err(CxlError::NotInitialized { .. })
        ));
    }

    #[test]
    fn invalid_config_is_rejected_before_mapping() {
        let config = CxlConfig {
            default_align: 24,
            ..config()
        };
        assert!(matches!(
            Context::open_anonymous(config),
            Err(CxlError::InvalidArgument(_))
        ));
    }
}
