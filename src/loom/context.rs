use std::sync::Arc;

use itertools::Itertools;

use super::{
    device::{Device, DeviceId},
    error::Error,
    event::{Event, EventTracker, UserEvent},
    image::{ImageDesc, ImageFormat},
    mem::{HostBuffer, MemFlags, MemObject},
    runtime::Runtime,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId;

#[derive(Debug)]
struct ContextInner {
    id: uid::Id<ContextId>,
    devices: Vec<Device>,
    tracker: Arc<EventTracker>,
}

/// A set of devices sharing memory objects and events.
#[derive(Debug, Clone)]
pub struct Context(Arc<ContextInner>);

impl Context {
    /// Groups `devices` of `runtime`. Duplicates are ignored.
    pub fn new(runtime: &Runtime, devices: &[Device]) -> Result<Self, Error> {
        if devices.is_empty() {
            return Err(Error::InvalidValue);
        }
        if devices
            .iter()
            .any(|device| !runtime.devices().contains(device))
        {
            return Err(Error::InvalidDevice);
        }

        let devices = devices
            .iter()
            .unique_by(|device| device.id())
            .cloned()
            .collect_vec();
        let id = uid::Id::new();
        log::debug!("context {id} created with {} device(s)", devices.len());

        Ok(Self(Arc::new(ContextInner {
            id,
            devices,
            tracker: runtime.tracker().clone(),
        })))
    }

    #[inline]
    pub fn id(&self) -> uid::Id<ContextId> {
        self.0.id
    }

    #[inline]
    pub fn devices(&self) -> &[Device] {
        &self.0.devices
    }

    #[inline]
    pub fn contains(&self, device: DeviceId) -> bool {
        self.0.devices.iter().any(|d| d.id() == device)
    }

    #[inline]
    pub fn tracker(&self) -> &Arc<EventTracker> {
        &self.0.tracker
    }

    /// Creates a buffer of `size` bytes. Storage is allocated on first use by a device.
    pub fn create_buffer(
        &self,
        flags: MemFlags,
        size: usize,
        host: Option<HostBuffer>,
    ) -> Result<MemObject, Error> {
        MemObject::new_buffer(self, flags, size, host)
    }

    pub fn create_image(
        &self,
        flags: MemFlags,
        format: ImageFormat,
        desc: ImageDesc,
        host: Option<HostBuffer>,
    ) -> Result<MemObject, Error> {
        MemObject::new_image(self, flags, format, desc, host)
    }

    pub fn create_user_event(&self) -> UserEvent {
        let id = self.tracker().create_user(self.id());
        UserEvent::new(Event::from_raw(id, self.tracker().clone()))
    }

    /// Image formats every image-capable device of the context supports.
    pub fn supported_image_formats(&self, flags: MemFlags) -> Vec<ImageFormat> {
        let mut devices = self
            .devices()
            .iter()
            .filter(|device| device.info().image_support);
        let Some(first) = devices.next() else {
            return vec![];
        };
        let mut formats = first.ops().supported_image_formats(flags).to_vec();
        for device in devices {
            let supported = device.ops().supported_image_formats(flags);
            formats.retain(|format| supported.contains(format));
        }
        formats
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Context {}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::Context;
    use crate::loom::{
        device::HostBuilder,
        error,
        event::ExecutionStatus,
        image::SUPPORTED_IMAGE_FORMATS,
        mem::MemFlags,
        runtime::RuntimeBuilder,
    };

    #[test]
    fn test_new() -> Result<(), Box<dyn Error>> {
        let runtime = RuntimeBuilder::new()
            .driver(HostBuilder::new().devices(2).build())
            .build()?;
        let other = RuntimeBuilder::new()
            .driver(HostBuilder::new().build())
            .build()?;

        assert_eq!(Context::new(&runtime, &[]), Err(error::Error::InvalidValue));
        assert_eq!(
            Context::new(&runtime, other.devices()),
            Err(error::Error::InvalidDevice)
        );

        let device = runtime.devices()[0].clone();
        let context = Context::new(&runtime, &[device.clone(), device.clone()])?;
        assert_eq!(context.devices().len(), 1);
        assert!(context.contains(device.id()));
        assert!(!context.contains(runtime.devices()[1].id()));
        Ok(())
    }

    #[test]
    fn test_image_formats() -> Result<(), Box<dyn Error>> {
        let runtime = RuntimeBuilder::new()
            .driver(HostBuilder::new().build())
            .build()?;
        let context = runtime.create_context(runtime.devices())?;
        let formats = context.supported_image_formats(MemFlags::READ_WRITE);
        assert_eq!(formats, *SUPPORTED_IMAGE_FORMATS);
        Ok(())
    }

    #[test]
    fn test_user_event() -> Result<(), Box<dyn Error>> {
        let runtime = RuntimeBuilder::new()
            .driver(HostBuilder::new().build())
            .build()?;
        let context = runtime.create_context(runtime.devices())?;
        let event = context.create_user_event();
        assert_eq!(event.status(), ExecutionStatus::Submitted);
        assert_eq!(event.context(), context.id());
        event.set_status(Ok(()))?;
        assert_eq!(event.status(), ExecutionStatus::Complete);
        Ok(())
    }
}
