use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bitflags::bitflags;
use bytemuck::Pod;
use rustc_hash::FxHashMap as HashMap;

use super::{
    context::{Context, ContextId},
    device::{Device, DeviceError, DeviceId, MemSpaceId, allocator::ChunkId},
    error::Error,
    image::{ImageDesc, ImageFormat},
};

bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemFlags: u32 {
        const READ_WRITE = 1 << 0;
        const WRITE_ONLY = 1 << 1;
        const READ_ONLY = 1 << 2;
        const USE_HOST_PTR = 1 << 3;
        const ALLOC_HOST_PTR = 1 << 4;
        const COPY_HOST_PTR = 1 << 5;
    }
}

impl MemFlags {
    /// Checks flag combinations and whether a host buffer is required.
    pub fn validate(self, host: Option<&HostBuffer>) -> Result<(), Error> {
        let access = self & (Self::READ_WRITE | Self::WRITE_ONLY | Self::READ_ONLY);
        if access.bits().count_ones() > 1 {
            return Err(Error::InvalidValue);
        }
        if self.contains(Self::USE_HOST_PTR)
            && self.intersects(Self::COPY_HOST_PTR | Self::ALLOC_HOST_PTR)
        {
            return Err(Error::InvalidValue);
        }
        let wants_host = self.intersects(Self::USE_HOST_PTR | Self::COPY_HOST_PTR);
        match (wants_host, host) {
            (true, None) | (false, Some(_)) => Err(Error::InvalidHostPtr),
            _ => Ok(()),
        }
    }
}

/// Shared host-side bytes: a transfer source or destination, a mapping, or a host pointer.
#[derive(Debug, Default, Clone)]
pub struct HostBuffer(Arc<RwLock<Vec<u8>>>);

impl HostBuffer {
    /// A zeroed buffer of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self::from(vec![0; len])
    }

    pub fn from_slice<T: Pod>(data: &[T]) -> Self {
        Self::from(bytemuck::cast_slice::<T, u8>(data).to_vec())
    }

    #[inline]
    pub fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.0.read().expect("failed to lock")
    }

    #[inline]
    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.0.write().expect("failed to lock")
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    #[inline]
    pub fn to_vec(&self) -> Vec<u8> {
        self.read().clone()
    }

    /// Copies the contents out as elements of `T`.
    pub fn to_pod_vec<T: Pod>(&self) -> Vec<T> {
        bytemuck::pod_collect_to_vec(&self.read())
    }

    #[inline]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl From<Vec<u8>> for HostBuffer {
    fn from(value: Vec<u8>) -> Self {
        Self(Arc::new(RwLock::new(value)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemObjectType {
    Buffer,
    Image { format: ImageFormat, desc: ImageDesc },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemObjectId;

/// Storage of a memory object in one memory space.
#[derive(Debug)]
struct Home {
    device: Device,
    chunk: ChunkId,
}

#[derive(Debug, Default)]
struct Placement {
    homes: HashMap<MemSpaceId, Home>,
    mappings: HashMap<DeviceId, ChunkId>,
}

#[derive(Debug)]
struct MemInner {
    id: uid::Id<MemObjectId>,
    context: uid::Id<ContextId>,
    flags: MemFlags,
    size: usize,
    r#type: MemObjectType,
    host: Option<HostBuffer>,
    placement: Mutex<Placement>,
}

impl Drop for MemInner {
    fn drop(&mut self) {
        let placement = self.placement.get_mut().expect("failed to lock");
        for (_, home) in placement.homes.drain() {
            home.device.ops().free(home.chunk);
        }
    }
}

/// A buffer or image. Clones share the object; the last one frees its device storage.
#[derive(Debug, Clone)]
pub struct MemObject(Arc<MemInner>);

impl MemObject {
    pub(crate) fn new_buffer(
        context: &Context,
        flags: MemFlags,
        size: usize,
        host: Option<HostBuffer>,
    ) -> Result<Self, Error> {
        flags.validate(host.as_ref())?;
        let max_alloc = context
            .devices()
            .iter()
            .map(|device| device.info().max_mem_alloc_size)
            .max()
            .unwrap_or_default();
        if size == 0 || size > max_alloc {
            return Err(Error::InvalidBufferSize);
        }
        if host.as_ref().is_some_and(|host| host.len() < size) {
            return Err(Error::InvalidHostPtr);
        }
        Ok(Self::new(context, flags, size, MemObjectType::Buffer, host))
    }

    pub(crate) fn new_image(
        context: &Context,
        flags: MemFlags,
        format: ImageFormat,
        desc: ImageDesc,
        host: Option<HostBuffer>,
    ) -> Result<Self, Error> {
        flags.validate(host.as_ref())?;
        let devices = context
            .devices()
            .iter()
            .filter(|device| device.info().image_support)
            .collect::<Vec<_>>();
        if devices.is_empty() {
            return Err(Error::InvalidOperation);
        }
        let supported = devices.iter().all(|device| {
            device
                .ops()
                .supported_image_formats(flags)
                .contains(&format)
        });
        if !supported {
            return Err(Error::ImageFormatNotSupported);
        }

        let desc = desc.normalize(format)?;
        let size = desc.size();
        if host.as_ref().is_some_and(|host| host.len() < size) {
            return Err(Error::InvalidHostPtr);
        }
        let r#type = MemObjectType::Image { format, desc };
        Ok(Self::new(context, flags, size, r#type, host))
    }

    fn new(
        context: &Context,
        flags: MemFlags,
        size: usize,
        r#type: MemObjectType,
        host: Option<HostBuffer>,
    ) -> Self {
        Self(Arc::new(MemInner {
            id: uid::Id::new(),
            context: context.id(),
            flags,
            size,
            r#type,
            host,
            placement: Default::default(),
        }))
    }

    #[inline]
    pub fn id(&self) -> uid::Id<MemObjectId> {
        self.0.id
    }

    #[inline]
    pub fn context(&self) -> uid::Id<ContextId> {
        self.0.context
    }

    #[inline]
    pub fn flags(&self) -> MemFlags {
        self.0.flags
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.0.size
    }

    #[inline]
    pub fn r#type(&self) -> MemObjectType {
        self.0.r#type
    }

    #[inline]
    pub fn is_buffer(&self) -> bool {
        matches!(self.0.r#type, MemObjectType::Buffer)
    }

    #[inline]
    pub fn host_ptr(&self) -> Option<&HostBuffer> {
        self.0.host.as_ref()
    }

    #[inline]
    pub fn reference_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    #[inline]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// The chunk backing this object on `device`, if storage has been resolved there.
    pub fn mapped_chunk(&self, device: DeviceId) -> Option<ChunkId> {
        let placement = self.0.placement.lock().expect("failed to lock");
        placement.mappings.get(&device).copied()
    }

    /// Resolves the chunk backing this object on `device`.
    ///
    /// The first device of a memory space to touch the object allocates its home there and
    /// uploads any initial host contents; other devices of the space reuse that home.
    pub fn chunk_for(&self, device: &Device) -> Result<ChunkId, Error> {
        let mut placement = self.0.placement.lock().expect("failed to lock");
        if let Some(&chunk) = placement.mappings.get(&device.id()) {
            return Ok(chunk);
        }

        let chunk = match placement.homes.get(&device.space()) {
            Some(home) => home.chunk,
            None => {
                let chunk = self.allocate(device).map_err(|err| {
                    log::warn!(
                        "failed to allocate {} bytes on device {}: {err}",
                        self.size(),
                        device.id()
                    );
                    Error::MemObjectAllocationFailure
                })?;
                let home = Home {
                    device: device.clone(),
                    chunk,
                };
                placement.homes.insert(device.space(), home);
                chunk
            }
        };
        placement.mappings.insert(device.id(), chunk);
        Ok(chunk)
    }

    fn allocate(&self, device: &Device) -> Result<ChunkId, DeviceError> {
        let ops = device.ops();
        let chunk = ops.alloc(self.size())?;

        let initial = self
            .flags()
            .intersects(MemFlags::USE_HOST_PTR | MemFlags::COPY_HOST_PTR);
        if let (true, Some(host)) = (initial, self.host_ptr()) {
            let host = host.read();
            if let Err(err) = ops.write(&host[..self.size()], chunk, 0) {
                ops.free(chunk);
                return Err(err);
            }
        }
        Ok(chunk)
    }

    /// Copies device contents back into the host pointer of a `USE_HOST_PTR` object.
    pub(crate) fn sync_to_host(&self, device: &Device) -> Result<(), DeviceError> {
        let Some(host) = self.host_ptr() else {
            return Ok(());
        };
        let chunk = self.chunk_for(device)?;
        let mut host = host.write();
        device.ops().read(&mut host[..self.size()], chunk, 0)
    }
}

impl PartialEq for MemObject {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for MemObject {}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{HostBuffer, MemFlags};
    use crate::loom::{
        device::HostBuilder,
        error,
        image::{ChannelOrder, ChannelType, ImageDesc, ImageFormat},
        runtime::RuntimeBuilder,
    };

    #[test]
    fn test_flags() {
        let host = HostBuffer::new(16);
        assert_eq!(MemFlags::READ_WRITE.validate(None), Ok(()));
        assert_eq!(
            (MemFlags::READ_ONLY | MemFlags::WRITE_ONLY).validate(None),
            Err(error::Error::InvalidValue)
        );
        assert_eq!(
            (MemFlags::USE_HOST_PTR | MemFlags::COPY_HOST_PTR).validate(Some(&host)),
            Err(error::Error::InvalidValue)
        );
        assert_eq!(
            MemFlags::COPY_HOST_PTR.validate(None),
            Err(error::Error::InvalidHostPtr)
        );
        assert_eq!(
            MemFlags::READ_WRITE.validate(Some(&host)),
            Err(error::Error::InvalidHostPtr)
        );
        assert_eq!(MemFlags::USE_HOST_PTR.validate(Some(&host)), Ok(()));
    }

    #[test]
    fn test_shared_home() -> Result<(), Box<dyn Error>> {
        let runtime = RuntimeBuilder::new()
            .driver(HostBuilder::new().devices(2).build())
            .build()?;
        let context = runtime.create_context(runtime.devices())?;
        let [first, second] = runtime.devices() else {
            unreachable!()
        };
        assert_eq!(first.space(), second.space());

        let data = HostBuffer::from_slice(&[1u32, 2, 3, 4]);
        let buffer = context.create_buffer(MemFlags::COPY_HOST_PTR, 16, Some(data))?;
        assert_eq!(buffer.mapped_chunk(first.id()), None);

        // both devices of the space resolve to the same home chunk
        let chunk = buffer.chunk_for(first)?;
        assert_eq!(buffer.chunk_for(second)?, chunk);
        let usage = first.ops().memory_usage();
        assert_eq!(usage.capacity - usage.free, 16);

        let mut contents = [0u8; 16];
        second.ops().read(&mut contents, chunk, 0)?;
        assert_eq!(bytemuck::cast_slice::<u8, u32>(&contents), [1, 2, 3, 4]);

        // the last handle frees the home
        let clone = buffer.clone();
        assert_eq!(buffer.reference_count(), 2);
        drop(buffer);
        drop(clone);
        let usage = first.ops().memory_usage();
        assert_eq!(usage.free, usage.capacity);
        Ok(())
    }

    #[test]
    fn test_create_errors() -> Result<(), Box<dyn Error>> {
        let runtime = RuntimeBuilder::new()
            .driver(HostBuilder::new().memory(1024).build())
            .build()?;
        let context = runtime.create_context(runtime.devices())?;

        assert_eq!(
            context.create_buffer(MemFlags::READ_WRITE, 0, None).err(),
            Some(error::Error::InvalidBufferSize)
        );
        assert_eq!(
            context
                .create_buffer(MemFlags::COPY_HOST_PTR, 32, Some(HostBuffer::new(8)))
                .err(),
            Some(error::Error::InvalidHostPtr)
        );

        // beyond the largest allocation any device of the context accepts
        assert_eq!(
            context.create_buffer(MemFlags::READ_WRITE, 1 << 20, None).err(),
            Some(error::Error::InvalidBufferSize)
        );

        let format = ImageFormat::new(ChannelOrder::Bgra, ChannelType::Float);
        assert_eq!(
            context
                .create_image(MemFlags::READ_ONLY, format, ImageDesc::new_2d(4, 4), None)
                .err(),
            Some(error::Error::ImageFormatNotSupported)
        );
        let format = ImageFormat::new(ChannelOrder::Rgba, ChannelType::UnormInt8);
        let image =
            context.create_image(MemFlags::READ_ONLY, format, ImageDesc::new_2d(4, 4), None)?;
        assert_eq!(image.size(), 64);
        assert!(!image.is_buffer());
        Ok(())
    }
}
