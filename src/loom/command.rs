use std::{ops::Range, path::PathBuf, sync::Arc};

use derive_more::Display;
use itertools::{Itertools, iproduct};

use super::{
    context::ContextId,
    device::{Device, DeviceError, DeviceId, DeviceInfo, allocator::ChunkId},
    error::Error,
    image::{ImageDesc, ImageFormat, Sampler},
    kernel::{Kernel, KernelArg, NdRange, ScalarBytes},
    mem::{HostBuffer, MemObject, MemObjectType},
    queue::QueueId,
};

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandType {
    ReadBuffer,
    WriteBuffer,
    CopyBuffer,
    ReadBufferRect,
    WriteBufferRect,
    CopyBufferRect,
    FillBuffer,
    MapBuffer,
    UnmapMemObject,
    NdRangeKernel,
    NativeKernel,
    Marker,
    User,
}

/// One side of a rectangular transfer. All values are in bytes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RectLayout {
    pub origin: [usize; 3],
    /// Zero defaults to the region width.
    pub row_pitch: usize,
    /// Zero defaults to the row pitch times the region height.
    pub slice_pitch: usize,
}

impl RectLayout {
    #[inline]
    pub fn new(origin: [usize; 3], row_pitch: usize, slice_pitch: usize) -> Self {
        Self {
            origin,
            row_pitch,
            slice_pitch,
        }
    }

    fn normalize(self, region: [usize; 3]) -> Self {
        let row_pitch = match self.row_pitch {
            0 => region[0],
            pitch => pitch,
        };
        let slice_pitch = match self.slice_pitch {
            0 => row_pitch.saturating_mul(region[1]),
            pitch => pitch,
        };
        Self {
            row_pitch,
            slice_pitch,
            ..self
        }
    }

    /// Byte offset of row `y` of slice `z`, relative to the origin.
    ///
    /// Does not overflow for rows inside a region whose [`span`](RectLayout::span) exists.
    #[inline]
    pub fn offset(&self, y: usize, z: usize) -> usize {
        self.origin[0]
            + (self.origin[1] + y) * self.row_pitch
            + (self.origin[2] + z) * self.slice_pitch
    }

    fn checked_offset(&self, y: usize, z: usize) -> Option<usize> {
        let row = self.origin[1].checked_add(y)?.checked_mul(self.row_pitch)?;
        let slice = self.origin[2].checked_add(z)?.checked_mul(self.slice_pitch)?;
        self.origin[0].checked_add(row)?.checked_add(slice)
    }

    /// Bytes spanned by `region`, from its first to one past its last byte.
    ///
    /// `None` for an empty region or one that does not fit the address space.
    pub fn span(&self, region: [usize; 3]) -> Option<Range<usize>> {
        let start = self.checked_offset(0, 0)?;
        let last = self.checked_offset(region[1].checked_sub(1)?, region[2].checked_sub(1)?)?;
        let end = last.checked_add(region[0])?;
        Some(start..end)
    }

    fn check_pitches(&self, region: [usize; 3]) -> Result<(), Error> {
        let slice = self
            .row_pitch
            .checked_mul(region[1])
            .ok_or(Error::InvalidValue)?;
        if self.row_pitch < region[0] || self.slice_pitch < slice {
            return Err(Error::InvalidValue);
        }
        Ok(())
    }
}

/// A rectangular transfer of `region` bytes × rows × slices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rect {
    pub region: [usize; 3],
    pub src: RectLayout,
    pub dst: RectLayout,
}

impl Rect {
    /// Fills in default pitches.
    pub fn new(region: [usize; 3], src: RectLayout, dst: RectLayout) -> Self {
        Self {
            region,
            src: src.normalize(region),
            dst: dst.normalize(region),
        }
    }

    /// Rows as `(y, z)` pairs, slice by slice.
    pub fn rows(&self) -> impl Iterator<Item = (usize, usize)> + use<> {
        iproduct!(0..self.region[2], 0..self.region[1]).map(|(z, y)| (y, z))
    }

    fn validate(&self) -> Result<(), Error> {
        if self.region.contains(&0) {
            return Err(Error::InvalidValue);
        }
        self.src.check_pitches(self.region)?;
        self.dst.check_pitches(self.region)
    }

    /// Source and destination spans.
    fn spans(&self) -> Result<(Range<usize>, Range<usize>), Error> {
        let src = self.src.span(self.region).ok_or(Error::InvalidValue)?;
        let dst = self.dst.span(self.region).ok_or(Error::InvalidValue)?;
        Ok((src, dst))
    }
}

/// A kernel launch as enqueued.
#[derive(Debug, Clone)]
pub struct KernelLaunch {
    pub kernel: Kernel,
    pub args: Vec<KernelArg>,
    pub range: NdRange,
}

pub type NativeFn = Arc<dyn Fn(&mut [Vec<u8>]) -> Result<(), String> + Send + Sync>;

/// A host function over host copies of `buffers`, in order.
#[derive(Clone)]
pub struct NativeLaunch {
    pub function: NativeFn,
    pub buffers: Vec<MemObject>,
}

impl std::fmt::Debug for NativeLaunch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeLaunch")
            .field("buffers", &self.buffers)
            .finish_non_exhaustive()
    }
}

/// Payload of a command. Memory objects are retained until the command is dropped.
#[derive(Debug, Clone)]
pub enum CommandKind {
    ReadBuffer {
        src: MemObject,
        offset: usize,
        size: usize,
        dst: HostBuffer,
    },
    WriteBuffer {
        dst: MemObject,
        offset: usize,
        size: usize,
        src: HostBuffer,
    },
    CopyBuffer {
        src: MemObject,
        src_offset: usize,
        dst: MemObject,
        dst_offset: usize,
        size: usize,
    },
    ReadBufferRect {
        src: MemObject,
        rect: Rect,
        dst: HostBuffer,
    },
    WriteBufferRect {
        dst: MemObject,
        rect: Rect,
        src: HostBuffer,
    },
    CopyBufferRect {
        src: MemObject,
        dst: MemObject,
        rect: Rect,
    },
    FillBuffer {
        dst: MemObject,
        pattern: Vec<u8>,
        offset: usize,
        size: usize,
    },
    MapBuffer {
        src: MemObject,
        offset: usize,
        size: usize,
        dst: HostBuffer,
    },
    Unmap {
        dst: MemObject,
        offset: usize,
        src: HostBuffer,
    },
    NdRangeKernel(KernelLaunch),
    NativeKernel(NativeLaunch),
    Marker,
}

#[inline]
fn check_range(mem: &MemObject, offset: usize, size: usize) -> Result<(), Error> {
    match offset.checked_add(size) {
        Some(end) if end <= mem.size() => Ok(()),
        _ => Err(Error::InvalidValue),
    }
}

#[inline]
fn check_host(host: &HostBuffer, end: usize) -> Result<(), Error> {
    match host.len() >= end {
        true => Ok(()),
        false => Err(Error::InvalidValue),
    }
}

#[inline]
fn overlaps(x: Range<usize>, y: Range<usize>) -> bool {
    x.start < y.end && y.start < x.end
}

impl CommandKind {
    pub fn command_type(&self) -> CommandType {
        match self {
            CommandKind::ReadBuffer { .. } => CommandType::ReadBuffer,
            CommandKind::WriteBuffer { .. } => CommandType::WriteBuffer,
            CommandKind::CopyBuffer { .. } => CommandType::CopyBuffer,
            CommandKind::ReadBufferRect { .. } => CommandType::ReadBufferRect,
            CommandKind::WriteBufferRect { .. } => CommandType::WriteBufferRect,
            CommandKind::CopyBufferRect { .. } => CommandType::CopyBufferRect,
            CommandKind::FillBuffer { .. } => CommandType::FillBuffer,
            CommandKind::MapBuffer { .. } => CommandType::MapBuffer,
            CommandKind::Unmap { .. } => CommandType::UnmapMemObject,
            CommandKind::NdRangeKernel(_) => CommandType::NdRangeKernel,
            CommandKind::NativeKernel(_) => CommandType::NativeKernel,
            CommandKind::Marker => CommandType::Marker,
        }
    }

    /// Every memory object the command touches.
    pub fn mem_objects(&self) -> Vec<&MemObject> {
        match self {
            CommandKind::ReadBuffer { src, .. }
            | CommandKind::ReadBufferRect { src, .. }
            | CommandKind::MapBuffer { src, .. } => vec![src],
            CommandKind::WriteBuffer { dst, .. }
            | CommandKind::WriteBufferRect { dst, .. }
            | CommandKind::FillBuffer { dst, .. }
            | CommandKind::Unmap { dst, .. } => vec![dst],
            CommandKind::CopyBuffer { src, dst, .. }
            | CommandKind::CopyBufferRect { src, dst, .. } => vec![src, dst],
            CommandKind::NdRangeKernel(launch) => {
                launch.args.iter().filter_map(KernelArg::mem).collect()
            }
            CommandKind::NativeKernel(launch) => launch.buffers.iter().collect(),
            CommandKind::Marker => vec![],
        }
    }

    /// Memory objects whose device contents the command may change.
    pub fn written(&self) -> Vec<&MemObject> {
        match self {
            CommandKind::WriteBuffer { dst, .. }
            | CommandKind::WriteBufferRect { dst, .. }
            | CommandKind::FillBuffer { dst, .. }
            | CommandKind::Unmap { dst, .. }
            | CommandKind::CopyBuffer { dst, .. }
            | CommandKind::CopyBufferRect { dst, .. } => vec![dst],
            CommandKind::NdRangeKernel(launch) => launch
                .args
                .iter()
                .filter_map(KernelArg::mem)
                .unique_by(|mem| mem.id())
                .collect(),
            CommandKind::NativeKernel(launch) => {
                launch.buffers.iter().unique_by(|mem| mem.id()).collect()
            }
            _ => vec![],
        }
    }

    /// Checks object kinds and that every object belongs to `context`.
    pub(crate) fn validate_objects(&self, context: uid::Id<ContextId>) -> Result<(), Error> {
        let valid = match self {
            CommandKind::NdRangeKernel(launch) => launch.args.iter().all(|arg| match arg {
                KernelArg::Buffer(Some(mem)) => mem.is_buffer(),
                KernelArg::Image(mem) => !mem.is_buffer(),
                _ => true,
            }),
            kind => kind.mem_objects().iter().all(|mem| mem.is_buffer()),
        };
        if !valid {
            return Err(Error::InvalidMemObject);
        }
        if self.mem_objects().iter().any(|mem| mem.context() != context) {
            return Err(Error::InvalidContext);
        }
        Ok(())
    }

    /// Rejects zero sizes and malformed shapes.
    pub(crate) fn validate_sizes(&self, device: &DeviceInfo) -> Result<(), Error> {
        match self {
            CommandKind::ReadBuffer { size, .. }
            | CommandKind::WriteBuffer { size, .. }
            | CommandKind::CopyBuffer { size, .. }
            | CommandKind::MapBuffer { size, .. } => match size {
                0 => Err(Error::InvalidValue),
                _ => Ok(()),
            },
            CommandKind::ReadBufferRect { rect, .. }
            | CommandKind::WriteBufferRect { rect, .. }
            | CommandKind::CopyBufferRect { rect, .. } => rect.validate(),
            CommandKind::FillBuffer {
                pattern,
                offset,
                size,
                ..
            } => {
                let len = pattern.len();
                if !len.is_power_of_two() || len > 128 {
                    return Err(Error::InvalidValue);
                }
                if *size == 0 || offset % len != 0 || size % len != 0 {
                    return Err(Error::InvalidValue);
                }
                Ok(())
            }
            CommandKind::Unmap { .. } | CommandKind::Marker => Ok(()),
            CommandKind::NdRangeKernel(launch) => {
                launch.kernel.check_args(&launch.args)?;
                launch.range.validate(device.max_work_group_size)
            }
            CommandKind::NativeKernel(_) => match device.native_kernels {
                true => Ok(()),
                false => Err(Error::InvalidOperation),
            },
        }
    }

    /// Checks ranges against object and host buffer sizes, then overlap of copies.
    pub(crate) fn validate_ranges(&self) -> Result<(), Error> {
        match self {
            CommandKind::ReadBuffer {
                src,
                offset,
                size,
                dst,
            } => {
                check_range(src, *offset, *size)?;
                check_host(dst, *size)
            }
            CommandKind::WriteBuffer {
                dst,
                offset,
                size,
                src,
            } => {
                check_range(dst, *offset, *size)?;
                check_host(src, *size)
            }
            CommandKind::CopyBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => {
                check_range(src, *src_offset, *size)?;
                check_range(dst, *dst_offset, *size)?;
                let x = *src_offset..src_offset + size;
                let y = *dst_offset..dst_offset + size;
                match src.ptr_eq(dst) && overlaps(x, y) {
                    true => Err(Error::MemCopyOverlap),
                    false => Ok(()),
                }
            }
            CommandKind::ReadBufferRect { src, rect, dst } => {
                let (x, y) = rect.spans()?;
                check_range(src, x.start, x.len())?;
                check_host(dst, y.end)
            }
            CommandKind::WriteBufferRect { dst, rect, src } => {
                let (x, y) = rect.spans()?;
                check_range(dst, y.start, y.len())?;
                check_host(src, x.end)
            }
            CommandKind::CopyBufferRect { src, dst, rect } => {
                let (x, y) = rect.spans()?;
                check_range(src, x.start, x.len())?;
                check_range(dst, y.start, y.len())?;
                match src.ptr_eq(dst) && overlaps(x, y) {
                    true => Err(Error::MemCopyOverlap),
                    false => Ok(()),
                }
            }
            CommandKind::FillBuffer {
                dst, offset, size, ..
            } => check_range(dst, *offset, *size),
            CommandKind::MapBuffer {
                src, offset, size, ..
            } => check_range(src, *offset, *size),
            CommandKind::Unmap { dst, offset, src } => check_range(dst, *offset, src.len()),
            CommandKind::NdRangeKernel(_) | CommandKind::NativeKernel(_) | CommandKind::Marker => {
                Ok(())
            }
        }
    }
}

/// A command bound to the queue and device that will execute it.
#[derive(Debug)]
pub struct CommandNode {
    pub kind: CommandKind,
    pub queue: uid::Id<QueueId>,
    pub device: DeviceId,
}

#[derive(Debug, Clone)]
pub struct BufferArg {
    pub mem: MemObject,
    pub chunk: ChunkId,
}

#[derive(Debug, Clone)]
pub struct ImageArg {
    pub mem: MemObject,
    pub chunk: ChunkId,
    pub format: ImageFormat,
    pub desc: ImageDesc,
}

/// A kernel argument with memory objects resolved to chunks of the executing device.
#[derive(Debug, Clone)]
pub enum ResolvedArg {
    Scalar(ScalarBytes),
    Buffer(Option<BufferArg>),
    Local(usize),
    Image(ImageArg),
    Sampler(Sampler),
}

/// A kernel launch ready for a device.
#[derive(Debug, Clone)]
pub struct RunCommand {
    pub kernel: Kernel,
    pub args: Vec<ResolvedArg>,
    pub range: NdRange,
    /// Built program for the device, set by `compile_submitted_kernels`.
    pub artifact: Option<PathBuf>,
}

impl RunCommand {
    pub fn resolve(launch: &KernelLaunch, device: &Device) -> Result<Self, DeviceError> {
        let args = launch
            .args
            .iter()
            .map(|arg| -> Result<_, DeviceError> {
                let arg = match arg {
                    KernelArg::Scalar(scalar) => ResolvedArg::Scalar(scalar.clone()),
                    KernelArg::Buffer(None) => ResolvedArg::Buffer(None),
                    KernelArg::Buffer(Some(mem)) => ResolvedArg::Buffer(Some(BufferArg {
                        mem: mem.clone(),
                        chunk: mem.chunk_for(device)?,
                    })),
                    KernelArg::Local(size) => ResolvedArg::Local(*size),
                    KernelArg::Image(mem) => {
                        let MemObjectType::Image { format, desc } = mem.r#type() else {
                            return Err(Error::InvalidMemObject.into());
                        };
                        ResolvedArg::Image(ImageArg {
                            mem: mem.clone(),
                            chunk: mem.chunk_for(device)?,
                            format,
                            desc,
                        })
                    }
                    KernelArg::Sampler(sampler) => ResolvedArg::Sampler(*sampler),
                };
                Ok(arg)
            })
            .collect::<Result<_, _>>()?;
        Ok(Self {
            kernel: launch.kernel.clone(),
            args,
            range: launch.range,
            artifact: None,
        })
    }
}

/// A native function launch ready for a device.
#[derive(Clone)]
pub struct NativeCommand {
    pub function: NativeFn,
    /// Chunk and size of each buffer, in argument order.
    pub buffers: Vec<(ChunkId, usize)>,
}

impl NativeCommand {
    pub fn resolve(launch: &NativeLaunch, device: &Device) -> Result<Self, DeviceError> {
        let buffers = launch
            .buffers
            .iter()
            .map(|mem| Ok((mem.chunk_for(device)?, mem.size())))
            .collect::<Result<_, Error>>()?;
        Ok(Self {
            function: launch.function.clone(),
            buffers,
        })
    }
}
