use std::{sync::Arc, time::Duration};

use derive_more::{Display, From, Into};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use allocator::{AllocError, ChunkId};

use super::{
    command::{CommandKind, CommandNode, NativeCommand, Rect, RectLayout, RunCommand},
    compiler::{BuildError, CompilerCache},
    config::Config,
    error::Error,
    event::{EventId, EventTracker},
    image::{ImageFormat, SUPPORTED_IMAGE_FORMATS},
    mem::{MemFlags, MemObject},
    platform,
};

pub use host::{HostBuilder, HostDriver, WorkGroup};
pub use softcore::{SoftcoreBuilder, SoftcoreDriver};

pub mod allocator;
pub mod hardware;
pub mod host;
pub mod softcore;

/// Position of a device in its runtime's device list.
#[derive(
    Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, From, Into,
)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceId(pub usize);

/// A set of devices sharing one physical memory. Named after the first device that claimed it.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, From, Into)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MemSpaceId(pub DeviceId);

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DeviceType {
    Cpu,
    Accelerator,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceInfo {
    pub name: String,
    pub r#type: DeviceType,
    /// Devices reporting the same family share a memory space.
    pub memory_family: String,
    /// Size of a device pointer in bytes.
    pub pointer_width: usize,
    pub big_endian: bool,
    pub global_mem_size: usize,
    pub max_mem_alloc_size: usize,
    pub max_work_group_size: usize,
    pub image_support: bool,
    pub native_kernels: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemoryUsage {
    pub capacity: usize,
    pub free: usize,
    pub largest_free: usize,
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Runtime(#[from] Error),
    #[error("device i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("access of {size} bytes at {offset} exceeds {limit}")]
    OutOfRange {
        offset: usize,
        size: usize,
        limit: usize,
    },
    #[error("core did not finish within {0:?}")]
    Timeout(Duration),
    #[error("kernel `{0}` is not available on this device")]
    MissingKernel(String),
    #[error("kernel argument {0}: {1}")]
    Argument(usize, &'static str),
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
    #[error("out of resources: {0}")]
    OutOfResources(&'static str),
    #[error("kernel failed: {0}")]
    Kernel(String),
}

/// The capability set every backend implements. Offsets and sizes are in bytes.
///
/// Rect operations take `rect.src` and `rect.dst` in the direction of the transfer: for
/// [`read_rect`](DeviceOps::read_rect) the source is the device chunk and the destination the
/// host slice, and the other way around for [`write_rect`](DeviceOps::write_rect).
pub trait DeviceOps: Send + Sync {
    fn info(&self) -> &DeviceInfo;

    fn alloc(&self, size: usize) -> Result<ChunkId, DeviceError>;

    /// Releases a chunk. Failures are logged.
    fn free(&self, chunk: ChunkId);

    fn memory_usage(&self) -> MemoryUsage;

    fn read(&self, dst: &mut [u8], src: ChunkId, offset: usize) -> Result<(), DeviceError>;

    fn write(&self, src: &[u8], dst: ChunkId, offset: usize) -> Result<(), DeviceError>;

    fn copy(
        &self,
        src: ChunkId,
        src_offset: usize,
        dst: ChunkId,
        dst_offset: usize,
        size: usize,
    ) -> Result<(), DeviceError> {
        let mut data = vec![0; size];
        self.read(&mut data, src, src_offset)?;
        self.write(&data, dst, dst_offset)
    }

    fn read_rect(&self, dst: &mut [u8], src: ChunkId, rect: &Rect) -> Result<(), DeviceError> {
        let width = rect.region[0];
        for (y, z) in rect.rows() {
            let offset = rect.dst.offset(y, z);
            let row = host_row_mut(dst, offset, width)?;
            self.read(row, src, rect.src.offset(y, z))?;
        }
        Ok(())
    }

    fn write_rect(&self, src: &[u8], dst: ChunkId, rect: &Rect) -> Result<(), DeviceError> {
        let width = rect.region[0];
        for (y, z) in rect.rows() {
            let offset = rect.src.offset(y, z);
            let row = host_row(src, offset, width)?;
            self.write(row, dst, rect.dst.offset(y, z))?;
        }
        Ok(())
    }

    fn copy_rect(&self, src: ChunkId, dst: ChunkId, rect: &Rect) -> Result<(), DeviceError> {
        let mut row = vec![0; rect.region[0]];
        for (y, z) in rect.rows() {
            self.read(&mut row, src, rect.src.offset(y, z))?;
            self.write(&row, dst, rect.dst.offset(y, z))?;
        }
        Ok(())
    }

    /// Repeats `pattern` over a rectangle. `region[0]` counts patterns, not bytes.
    fn fill_rect(
        &self,
        dst: ChunkId,
        layout: &RectLayout,
        region: [usize; 3],
        pattern: &[u8],
    ) -> Result<(), DeviceError> {
        let row = pattern.repeat(region[0]);
        for z in 0..region[2] {
            for y in 0..region[1] {
                self.write(&row, dst, layout.offset(y, z))?;
            }
        }
        Ok(())
    }

    /// Returns a host copy of a chunk range.
    fn map(&self, src: ChunkId, offset: usize, size: usize) -> Result<Vec<u8>, DeviceError> {
        let mut data = vec![0; size];
        self.read(&mut data, src, offset)?;
        Ok(data)
    }

    /// Writes a mapped copy back.
    fn unmap(&self, src: &[u8], dst: ChunkId, offset: usize) -> Result<(), DeviceError> {
        self.write(src, dst, offset)
    }

    /// Makes sure the kernel of `command` is built for this device.
    fn compile_submitted_kernels(&self, command: &mut RunCommand) -> Result<(), DeviceError>;

    fn run(&self, command: &RunCommand) -> Result<(), DeviceError>;

    /// Runs a host function over host copies of the command's buffers.
    fn run_native(&self, command: &NativeCommand) -> Result<(), DeviceError> {
        if !self.info().native_kernels {
            return Err(DeviceError::Unsupported("native kernels"));
        }
        let mut buffers = command
            .buffers
            .iter()
            .map(|&(chunk, size)| self.map(chunk, 0, size))
            .collect::<Result<Vec<_>, _>>()?;
        (command.function)(&mut buffers).map_err(DeviceError::Kernel)?;
        for (&(chunk, _), data) in command.buffers.iter().zip(&buffers) {
            self.write(data, chunk, 0)?;
        }
        Ok(())
    }

    /// Device timestamp in nanoseconds.
    fn get_timer_value(&self) -> u64 {
        platform::timestamp()
    }

    fn supported_image_formats(&self, _flags: MemFlags) -> &[ImageFormat] {
        match self.info().image_support {
            true => SUPPORTED_IMAGE_FORMATS.as_slice(),
            false => &[],
        }
    }

    /// Releases backend-local state when the runtime shuts down.
    fn uninit(&self) {}
}

fn host_row(data: &[u8], offset: usize, size: usize) -> Result<&[u8], DeviceError> {
    let limit = data.len();
    data.get(offset..offset + size)
        .ok_or(DeviceError::OutOfRange {
            offset,
            size,
            limit,
        })
}

fn host_row_mut(data: &mut [u8], offset: usize, size: usize) -> Result<&mut [u8], DeviceError> {
    let limit = data.len();
    data.get_mut(offset..offset + size)
        .ok_or(DeviceError::OutOfRange {
            offset,
            size,
            limit,
        })
}

/// Services handed to a driver while it initializes a device.
#[derive(Debug, Clone)]
pub struct DriverContext {
    pub id: DeviceId,
    pub config: Arc<Config>,
    pub cache: Arc<CompilerCache>,
}

/// Discovers and initializes the devices of one backend.
pub trait DeviceDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Number of devices this driver can initialize.
    fn probe(&self, config: &Config) -> usize;

    fn init(&self, index: usize, context: &DriverContext)
    -> Result<Arc<dyn DeviceOps>, DeviceError>;
}

pub enum DeviceEvent {
    Run { event: EventId, node: CommandNode },
    Shutdown,
}

struct DeviceInner {
    id: DeviceId,
    space: MemSpaceId,
    ops: Arc<dyn DeviceOps>,
    sender: flume::Sender<DeviceEvent>,
}

/// Handle to an initialized device. Cheap to clone.
#[derive(Clone)]
pub struct Device(Arc<DeviceInner>);

impl Device {
    pub(crate) fn new(
        id: DeviceId,
        space: MemSpaceId,
        ops: Arc<dyn DeviceOps>,
        sender: flume::Sender<DeviceEvent>,
    ) -> Self {
        Self(Arc::new(DeviceInner {
            id,
            space,
            ops,
            sender,
        }))
    }

    #[inline]
    pub fn id(&self) -> DeviceId {
        self.0.id
    }

    #[inline]
    pub fn space(&self) -> MemSpaceId {
        self.0.space
    }

    #[inline]
    pub fn info(&self) -> &DeviceInfo {
        self.0.ops.info()
    }

    #[inline]
    pub fn ops(&self) -> &Arc<dyn DeviceOps> {
        &self.0.ops
    }

    /// Hands an event to the device's worker. Gives the event back if the worker is gone.
    #[inline]
    pub(crate) fn submit(&self, event: DeviceEvent) -> Result<(), DeviceEvent> {
        self.0.sender.send(event).map_err(|err| err.into_inner())
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id())
            .field("space", &self.space())
            .field("name", &self.info().name)
            .finish()
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Device {}

/// Executes commands handed to `device` until told to shut down.
pub(crate) async fn serve(
    device: Device,
    tracker: Arc<EventTracker>,
    receiver: flume::Receiver<DeviceEvent>,
) {
    while let Ok(event) = receiver.recv_async().await {
        match event {
            DeviceEvent::Run { event, mut node } => {
                let ops = device.ops();
                tracker.start(event, ops.get_timer_value());
                let result = execute(&device, &mut node);
                if let Err(err) = &result {
                    log::error!(
                        "{} on device {} failed: {err}",
                        node.kind.command_type(),
                        device.id()
                    );
                }
                // memory objects held by the command are released before waiters wake
                drop(node);
                tracker.finish(event, result.map_err(Error::from), ops.get_timer_value());
            }
            DeviceEvent::Shutdown => break,
        }
    }
    log::debug!("device {} worker stopped", device.id());
}

#[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
fn execute(device: &Device, node: &mut CommandNode) -> Result<(), DeviceError> {
    let ops = device.ops().as_ref();
    let chunk = |mem: &MemObject| mem.chunk_for(device);

    match &mut node.kind {
        CommandKind::ReadBuffer {
            src,
            offset,
            size,
            dst,
        } => {
            let mut dst = dst.write();
            let row = host_row_mut(&mut dst, 0, *size)?;
            ops.read(row, chunk(src)?, *offset)?;
        }
        CommandKind::WriteBuffer {
            dst,
            offset,
            size,
            src,
        } => {
            let src = src.read();
            ops.write(host_row(&src, 0, *size)?, chunk(dst)?, *offset)?;
        }
        CommandKind::CopyBuffer {
            src,
            src_offset,
            dst,
            dst_offset,
            size,
        } => ops.copy(chunk(src)?, *src_offset, chunk(dst)?, *dst_offset, *size)?,
        CommandKind::ReadBufferRect { src, rect, dst } => {
            ops.read_rect(&mut dst.write(), chunk(src)?, rect)?
        }
        CommandKind::WriteBufferRect { dst, rect, src } => {
            ops.write_rect(&src.read(), chunk(dst)?, rect)?
        }
        CommandKind::CopyBufferRect { src, dst, rect } => {
            ops.copy_rect(chunk(src)?, chunk(dst)?, rect)?
        }
        CommandKind::FillBuffer {
            dst,
            pattern,
            offset,
            size,
        } => {
            let layout = RectLayout {
                origin: [*offset, 0, 0],
                row_pitch: *size,
                slice_pitch: *size,
            };
            let region = [*size / pattern.len(), 1, 1];
            ops.fill_rect(chunk(dst)?, &layout, region, pattern)?
        }
        CommandKind::MapBuffer {
            src,
            offset,
            size,
            dst,
        } => {
            let data = ops.map(chunk(src)?, *offset, *size)?;
            *dst.write() = data;
        }
        CommandKind::Unmap { dst, offset, src } => {
            ops.unmap(&src.read(), chunk(dst)?, *offset)?
        }
        CommandKind::NdRangeKernel(launch) => {
            let mut command = RunCommand::resolve(launch, device)?;
            ops.compile_submitted_kernels(&mut command)?;
            ops.run(&command)?;
        }
        CommandKind::NativeKernel(launch) => {
            let command = NativeCommand::resolve(launch, device)?;
            ops.run_native(&command)?;
        }
        CommandKind::Marker => {}
    }

    // buffers created over host memory mirror device contents back after every write
    for mem in node.kind.written() {
        if mem.flags().contains(MemFlags::USE_HOST_PTR) {
            mem.sync_to_host(device)?;
        }
    }
    Ok(())
}
