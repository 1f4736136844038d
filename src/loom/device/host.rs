use std::{
    ops::Range,
    sync::{Arc, Mutex, RwLock, Weak},
};

use bytemuck::Pod;
use itertools::iproduct;
use rustc_hash::FxHashMap as HashMap;

use super::{
    DeviceDriver, DeviceError, DeviceInfo, DeviceOps, DeviceType, DriverContext, MemoryUsage,
    allocator::{ChunkId, MemoryRegion, RegionConfig},
};
use crate::loom::{
    command::{RectLayout, ResolvedArg, RunCommand},
    config::Config,
    kernel::ScalarArg,
};

/// A kernel compiled into the host program, run once per work-group.
pub type HostKernel = Arc<dyn Fn(&mut WorkGroup) -> Result<(), DeviceError> + Send + Sync>;

pub const DEFAULT_MEMORY_SIZE: usize = 64 << 20;
pub const MAX_WORK_GROUP_SIZE: usize = 4096;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostMemoryId;

/// Memory shared by every device of one [`HostDriver`].
#[derive(Debug)]
struct HostMemory {
    region: Mutex<MemoryRegion>,
    bytes: RwLock<Vec<u8>>,
}

impl HostMemory {
    fn new(size: usize, config: RegionConfig) -> Self {
        Self {
            region: Mutex::new(MemoryRegion::new(0, size, config)),
            bytes: RwLock::new(vec![0; size]),
        }
    }

    /// Host range of `size` bytes at `offset` into `chunk`.
    fn span(
        &self,
        chunk: ChunkId,
        offset: usize,
        size: usize,
    ) -> Result<Range<usize>, DeviceError> {
        let region = self.region.lock().expect("failed to lock");
        let chunk = region.chunk(chunk)?;
        match offset.checked_add(size) {
            Some(end) if end <= chunk.size => Ok(chunk.start + offset..chunk.start + end),
            _ => Err(DeviceError::OutOfRange {
                offset,
                size,
                limit: chunk.size,
            }),
        }
    }
}

#[derive(Clone)]
pub struct HostBuilder {
    devices: usize,
    memory: usize,
    alignment: usize,
    kernels: HashMap<String, HostKernel>,
}

impl Default for HostBuilder {
    fn default() -> Self {
        Self {
            devices: 1,
            memory: DEFAULT_MEMORY_SIZE,
            alignment: RegionConfig::default().alignment,
            kernels: Default::default(),
        }
    }
}

impl HostBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of devices sharing the driver's memory.
    pub fn devices(mut self, devices: usize) -> Self {
        self.devices = devices;
        self
    }

    /// Size of the shared memory in bytes.
    pub fn memory(mut self, memory: usize) -> Self {
        self.memory = memory;
        self
    }

    pub fn alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn add_kernel<F>(mut self, name: impl Into<String>, kernel: F) -> Self
    where
        F: Fn(&mut WorkGroup) -> Result<(), DeviceError> + Send + Sync + 'static,
    {
        self.kernels.insert(name.into(), Arc::new(kernel));
        self
    }

    pub fn build(self) -> HostDriver {
        let id = uid::Id::<HostMemoryId>::new();
        HostDriver {
            devices: self.devices,
            memory: self.memory,
            region: RegionConfig::with_alignment(self.alignment),
            family: format!("host:{id}"),
            kernels: Arc::new(self.kernels),
            shared: Mutex::new(Weak::new()),
        }
    }
}

/// Thread-backed devices over one shared host memory.
pub struct HostDriver {
    devices: usize,
    memory: usize,
    region: RegionConfig,
    family: String,
    kernels: Arc<HashMap<String, HostKernel>>,
    shared: Mutex<Weak<HostMemory>>,
}

impl HostDriver {
    fn memory(&self) -> Arc<HostMemory> {
        let mut shared = self.shared.lock().expect("failed to lock");
        match shared.upgrade() {
            Some(memory) => memory,
            None => {
                let memory = Arc::new(HostMemory::new(self.memory, self.region));
                *shared = Arc::downgrade(&memory);
                memory
            }
        }
    }
}

impl DeviceDriver for HostDriver {
    fn name(&self) -> &str {
        "host"
    }

    fn probe(&self, config: &Config) -> usize {
        match config.allows_driver(self.name()) {
            true => self.devices,
            false => 0,
        }
    }

    fn init(
        &self,
        index: usize,
        context: &DriverContext,
    ) -> Result<Arc<dyn DeviceOps>, DeviceError> {
        let info = DeviceInfo {
            name: format!("host-{index}"),
            r#type: DeviceType::Cpu,
            memory_family: self.family.clone(),
            pointer_width: size_of::<usize>(),
            big_endian: cfg!(target_endian = "big"),
            global_mem_size: self.memory,
            max_mem_alloc_size: self.memory,
            max_work_group_size: MAX_WORK_GROUP_SIZE,
            image_support: true,
            native_kernels: true,
        };
        Ok(Arc::new(HostDevice {
            info,
            memory: self.memory(),
            kernels: self.kernels.clone(),
            level: context.config.transfer_level(),
        }))
    }
}

struct HostDevice {
    info: DeviceInfo,
    memory: Arc<HostMemory>,
    kernels: Arc<HashMap<String, HostKernel>>,
    level: log::Level,
}

impl DeviceOps for HostDevice {
    #[inline]
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn alloc(&self, size: usize) -> Result<ChunkId, DeviceError> {
        let mut region = self.memory.region.lock().expect("failed to lock");
        Ok(region.alloc(size)?)
    }

    fn free(&self, chunk: ChunkId) {
        let mut region = self.memory.region.lock().expect("failed to lock");
        if let Err(err) = region.free(chunk) {
            log::error!("{}: {err}", self.info.name);
        }
    }

    fn memory_usage(&self) -> MemoryUsage {
        let region = self.memory.region.lock().expect("failed to lock");
        MemoryUsage {
            capacity: region.capacity(),
            free: region.free_bytes(),
            largest_free: region.largest_free(),
        }
    }

    fn read(&self, dst: &mut [u8], src: ChunkId, offset: usize) -> Result<(), DeviceError> {
        let span = self.memory.span(src, offset, dst.len())?;
        log::log!(self.level, "{}: read {} bytes at {}", self.info.name, dst.len(), span.start);
        let bytes = self.memory.bytes.read().expect("failed to lock");
        dst.copy_from_slice(&bytes[span]);
        Ok(())
    }

    fn write(&self, src: &[u8], dst: ChunkId, offset: usize) -> Result<(), DeviceError> {
        let span = self.memory.span(dst, offset, src.len())?;
        log::log!(self.level, "{}: write {} bytes at {}", self.info.name, src.len(), span.start);
        let mut bytes = self.memory.bytes.write().expect("failed to lock");
        bytes[span].copy_from_slice(src);
        Ok(())
    }

    fn copy(
        &self,
        src: ChunkId,
        src_offset: usize,
        dst: ChunkId,
        dst_offset: usize,
        size: usize,
    ) -> Result<(), DeviceError> {
        let from = self.memory.span(src, src_offset, size)?;
        let to = self.memory.span(dst, dst_offset, size)?;
        let mut bytes = self.memory.bytes.write().expect("failed to lock");
        bytes.copy_within(from, to.start);
        Ok(())
    }

    fn fill_rect(
        &self,
        dst: ChunkId,
        layout: &RectLayout,
        region: [usize; 3],
        pattern: &[u8],
    ) -> Result<(), DeviceError> {
        let width = pattern.len() * region[0];
        let rows = iproduct!(0..region[2], 0..region[1])
            .map(|(z, y)| self.memory.span(dst, layout.offset(y, z), width))
            .collect::<Result<Vec<_>, _>>()?;

        let mut bytes = self.memory.bytes.write().expect("failed to lock");
        for row in rows {
            let row = &mut bytes[row];
            #[cfg(not(feature = "rayon"))]
            row.chunks_exact_mut(pattern.len())
                .for_each(|x| x.copy_from_slice(pattern));
            #[cfg(feature = "rayon")]
            {
                use rayon::prelude::*;
                row.par_chunks_exact_mut(pattern.len())
                    .for_each(|x| x.copy_from_slice(pattern));
            }
        }
        Ok(())
    }

    fn compile_submitted_kernels(&self, command: &mut RunCommand) -> Result<(), DeviceError> {
        let name = command.kernel.name();
        match self.kernels.contains_key(name) {
            true => Ok(()),
            false => Err(DeviceError::MissingKernel(name.to_string())),
        }
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    fn run(&self, command: &RunCommand) -> Result<(), DeviceError> {
        let name = command.kernel.name();
        let kernel = self
            .kernels
            .get(name)
            .ok_or_else(|| DeviceError::MissingKernel(name.to_string()))?;

        // 1. resolve buffers to host ranges
        let spans = command
            .args
            .iter()
            .map(|arg| match arg {
                ResolvedArg::Buffer(Some(buffer)) => {
                    Ok(Some(self.memory.span(buffer.chunk, 0, buffer.mem.size())?))
                }
                ResolvedArg::Image(image) => {
                    Ok(Some(self.memory.span(image.chunk, 0, image.mem.size())?))
                }
                _ => Ok(None),
            })
            .collect::<Result<Vec<_>, DeviceError>>()?;

        // 2. local memory, explicit arguments first then automatic locals
        let sizes = command
            .args
            .iter()
            .map(|arg| match arg {
                ResolvedArg::Local(size) => *size,
                _ => 0,
            })
            .chain(command.kernel.locals().iter().copied());

        // 3. one call per work-group
        let mut bytes = self.memory.bytes.write().expect("failed to lock");
        let mut locals = sizes.map(|size| vec![0u8; size]).collect::<Vec<_>>();
        for group_id in command.range.groups() {
            locals.iter_mut().for_each(|local| local.fill(0));
            let mut group = WorkGroup {
                command,
                group_id,
                spans: &spans,
                memory: &mut bytes[..],
                locals: &mut locals,
            };
            kernel(&mut group)?;
        }
        Ok(())
    }
}

/// What a host kernel sees of one work-group. Argument indices follow the kernel signature.
pub struct WorkGroup<'a> {
    command: &'a RunCommand,
    group_id: [usize; 3],
    spans: &'a [Option<Range<usize>>],
    memory: &'a mut [u8],
    locals: &'a mut [Vec<u8>],
}

impl WorkGroup<'_> {
    #[inline]
    pub fn group_id(&self) -> [usize; 3] {
        self.group_id
    }

    #[inline]
    pub fn num_groups(&self) -> [usize; 3] {
        self.command.range.num_groups()
    }

    #[inline]
    pub fn local_size(&self) -> [usize; 3] {
        self.command.range.local_size
    }

    #[inline]
    pub fn global_offset(&self) -> [usize; 3] {
        self.command.range.global_offset
    }

    #[inline]
    pub fn work_dim(&self) -> usize {
        self.command.range.work_dim
    }

    /// Global ids of the group's work-items, x fastest.
    pub fn global_ids(&self) -> impl Iterator<Item = [usize; 3]> + use<> {
        let [x, y, z] = self.local_size();
        let group = self.group_id;
        let offset = self.global_offset();
        let local = self.local_size();
        iproduct!(0..z, 0..y, 0..x).map(move |(k, j, i)| {
            let item = [i, j, k];
            std::array::from_fn(|dim| offset[dim] + group[dim] * local[dim] + item[dim])
        })
    }

    pub fn scalar<T: ScalarArg>(&self, index: usize) -> Result<T, DeviceError> {
        match self.command.args.get(index) {
            Some(ResolvedArg::Scalar(scalar)) => bytemuck::try_pod_read_unaligned(&scalar.bytes)
                .map_err(|_| DeviceError::Argument(index, "scalar size mismatch")),
            _ => Err(DeviceError::Argument(index, "not a scalar")),
        }
    }

    fn span(&self, index: usize) -> Result<Range<usize>, DeviceError> {
        match self.spans.get(index) {
            Some(Some(span)) => Ok(span.clone()),
            _ => Err(DeviceError::Argument(index, "not a buffer")),
        }
    }

    fn element<T: Pod>(&self, index: usize, element: usize) -> Result<Range<usize>, DeviceError> {
        let span = self.span(index)?;
        let size = size_of::<T>();
        let offset = element * size;
        match offset + size <= span.len() {
            true => Ok(span.start + offset..span.start + offset + size),
            false => Err(DeviceError::OutOfRange {
                offset,
                size,
                limit: span.len(),
            }),
        }
    }

    /// Size in bytes of the buffer or image argument at `index`.
    pub fn buffer_len(&self, index: usize) -> Result<usize, DeviceError> {
        self.span(index).map(|span| span.len())
    }

    pub fn read<T: Pod>(&self, index: usize, element: usize) -> Result<T, DeviceError> {
        let range = self.element::<T>(index, element)?;
        Ok(bytemuck::pod_read_unaligned(&self.memory[range]))
    }

    pub fn write<T: Pod>(
        &mut self,
        index: usize,
        element: usize,
        value: T,
    ) -> Result<(), DeviceError> {
        let range = self.element::<T>(index, element)?;
        self.memory[range].copy_from_slice(bytemuck::bytes_of(&value));
        Ok(())
    }

    /// Local memory of a `Local` argument, or of automatic local `n` at index `num_args + n`.
    pub fn local_mut(&mut self, index: usize) -> Result<&mut [u8], DeviceError> {
        match self.locals.get_mut(index) {
            Some(local) if !local.is_empty() => Ok(local),
            _ => Err(DeviceError::Argument(index, "not a local buffer")),
        }
    }
}
