use std::{
    sync::{Arc, Mutex},
    thread::JoinHandle,
};

use rustc_hash::FxHashMap as HashMap;

use super::{
    compiler::CompilerCache,
    config::Config,
    context::Context,
    device::{Device, DeviceDriver, DeviceEvent, DeviceId, DriverContext, MemSpaceId},
    error::Error,
    event::EventTracker,
    platform,
};

/// Maps a memory family to the space of the first device that reported it.
#[derive(Debug, Default)]
pub struct MemorySpaces(Mutex<HashMap<String, MemSpaceId>>);

impl MemorySpaces {
    /// Returns the space of `family`, owned by `device` if it is the first to claim it.
    pub fn claim(&self, family: &str, device: DeviceId) -> MemSpaceId {
        let mut spaces = self.0.lock().expect("failed to lock");
        *spaces
            .entry(family.to_string())
            .or_insert(MemSpaceId(device))
    }

    pub fn get(&self, family: &str) -> Option<MemSpaceId> {
        let spaces = self.0.lock().expect("failed to lock");
        spaces.get(family).copied()
    }
}

/// Builds a [`Runtime`] from a set of drivers.
pub struct RuntimeBuilder {
    config: Config,
    drivers: Vec<Box<dyn DeviceDriver>>,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeBuilder {
    /// Starts from the configuration in the process environment.
    pub fn new() -> Self {
        Self {
            config: Config::from_env(),
            drivers: vec![],
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn driver(mut self, driver: impl DeviceDriver + 'static) -> Self {
        self.drivers.push(Box::new(driver));
        self
    }

    /// Probes every driver and starts a worker for each device that initializes.
    ///
    /// Devices failing to initialize are skipped. Fails if no device is left.
    pub fn build(self) -> Result<Runtime, Error> {
        let config = Arc::new(self.config);
        let cache = Arc::new(CompilerCache::new());
        let tracker = Arc::new(EventTracker::new());
        let spaces = MemorySpaces::default();
        let mut devices = vec![];
        let mut workers = vec![];

        for driver in &self.drivers {
            let name = driver.name();
            let count = driver.probe(&config);
            log::debug!("driver {name} reports {count} device(s)");

            for index in 0..count {
                let id = DeviceId(devices.len());
                let context = DriverContext {
                    id,
                    config: config.clone(),
                    cache: cache.clone(),
                };
                let ops = match driver.init(index, &context) {
                    Ok(ops) => ops,
                    Err(err) => {
                        log::warn!("failed to initialize {name} device {index}: {err}");
                        continue;
                    }
                };

                let space = spaces.claim(&ops.info().memory_family, id);
                let (sender, receiver) = flume::unbounded();
                let device = Device::new(id, space, ops, sender);
                let worker = platform::spawn(
                    format!("heddle-{name}-{index}"),
                    super::device::serve(device.clone(), tracker.clone(), receiver),
                )
                .map_err(|err| {
                    log::error!("failed to spawn worker for device {id}: {err}");
                    Error::DeviceNotAvailable
                })?;

                log::info!(
                    "device {id}: {} ({}, space {space})",
                    device.info().name,
                    device.info().r#type
                );
                devices.push(device);
                workers.push(worker);
            }
        }

        if devices.is_empty() {
            return Err(Error::DeviceNotAvailable);
        }

        Ok(Runtime {
            config,
            cache,
            tracker,
            spaces,
            devices,
            workers,
        })
    }
}

/// Owns the devices, their workers, the event tracker and the kernel cache.
///
/// Dropping the runtime stops every worker after the commands already handed to it.
pub struct Runtime {
    config: Arc<Config>,
    cache: Arc<CompilerCache>,
    tracker: Arc<EventTracker>,
    spaces: MemorySpaces,
    devices: Vec<Device>,
    workers: Vec<JoinHandle<()>>,
}

impl Runtime {
    #[inline]
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device(&self, id: DeviceId) -> Option<&Device> {
        self.devices.get(id.0)
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub fn compiler_cache(&self) -> &Arc<CompilerCache> {
        &self.cache
    }

    #[inline]
    pub fn tracker(&self) -> &Arc<EventTracker> {
        &self.tracker
    }

    #[inline]
    pub fn memory_spaces(&self) -> &MemorySpaces {
        &self.spaces
    }

    pub fn create_context(&self, devices: &[Device]) -> Result<Context, Error> {
        Context::new(self, devices)
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("devices", &self.devices)
            .finish_non_exhaustive()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        for device in &self.devices {
            if device.submit(DeviceEvent::Shutdown).is_err() {
                log::warn!("device {} worker already stopped", device.id());
            }
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("device worker panicked");
            }
        }
        for device in &self.devices {
            device.ops().uninit();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{MemorySpaces, RuntimeBuilder};
    use crate::loom::{
        config::Config,
        device::{DeviceId, HostBuilder, MemSpaceId},
        error,
    };

    #[test]
    fn test_spaces() {
        let spaces = MemorySpaces::default();
        assert_eq!(spaces.claim("host", DeviceId(0)), MemSpaceId(DeviceId(0)));
        assert_eq!(spaces.claim("host", DeviceId(1)), MemSpaceId(DeviceId(0)));
        assert_eq!(spaces.claim("softcore:0", DeviceId(2)), MemSpaceId(DeviceId(2)));
        assert_eq!(spaces.get("softcore:1"), None);
    }

    #[test]
    fn test_build() -> Result<(), Box<dyn Error>> {
        let runtime = RuntimeBuilder::new()
            .config(Config::default())
            .driver(HostBuilder::new().devices(2).build())
            .driver(HostBuilder::new().build())
            .build()?;
        let ids = runtime.devices().iter().map(|device| device.id()).collect::<Vec<_>>();
        assert_eq!(ids, [DeviceId(0), DeviceId(1), DeviceId(2)]);

        // separately built host drivers do not share memory
        let spaces = runtime
            .devices()
            .iter()
            .map(|device| device.space())
            .collect::<Vec<_>>();
        assert_eq!(spaces[0], spaces[1]);
        assert_ne!(spaces[1], spaces[2]);
        assert_eq!(runtime.device(DeviceId(2)), runtime.devices().get(2));
        Ok(())
    }

    #[test]
    fn test_filtered() {
        let config = Config {
            devices: Some(vec!["softcore".into()]),
            ..Default::default()
        };
        let result = RuntimeBuilder::new()
            .config(config)
            .driver(HostBuilder::new().build())
            .build();
        assert_eq!(result.err(), Some(error::Error::DeviceNotAvailable));
    }
}
