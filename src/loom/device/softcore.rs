use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use bytemuck::{Pod, Zeroable};

use super::{
    DeviceDriver, DeviceError, DeviceInfo, DeviceOps, DeviceType, DriverContext, MemoryUsage,
    allocator::{ChunkId, MemoryRegion, RegionConfig},
    hardware::{self, Core, CoreLocation, SysfsCore},
};
use crate::loom::{
    command::{ImageArg, ResolvedArg, RunCommand},
    compiler::{BuildError, CodeGenerator, CompilerCache},
    config::Config,
};

/// Soft-cores address memory with 32-bit big-endian pointers.
pub const POINTER_WIDTH: usize = 4;
pub const DEFAULT_MEMORY_SIZE: usize = 512 << 20;
/// Space reserved for a linked program image.
pub const PROGRAM_RESERVE: usize = 1 << 20;
pub const MAX_WORK_GROUP_SIZE: usize = 4096;
/// The program image starts with the argument and context pointers; code follows.
const PROGRAM_HEADER: usize = 2 * POINTER_WIDTH;

/// Work-group context read by the core, stored big-endian.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct CoreContext {
    pub work_dim: u32,
    pub num_groups: [u32; 3],
    pub group_id: [u32; 3],
    pub global_offset: [u32; 3],
}

impl CoreContext {
    pub fn to_be(self) -> Self {
        Self {
            work_dim: self.work_dim.to_be(),
            num_groups: self.num_groups.map(u32::to_be),
            group_id: self.group_id.map(u32::to_be),
            global_offset: self.global_offset.map(u32::to_be),
        }
    }
}

/// Image descriptor as laid out for kernels, stored big-endian.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct DeviceImage {
    pub data: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub array_size: u32,
    pub row_pitch: u32,
    pub slice_pitch: u32,
    pub element_size: u32,
    pub num_channels: u32,
    pub order: u32,
    pub data_type: u32,
    pub image_type: u32,
}

impl DeviceImage {
    fn new(image: &ImageArg, data: u32) -> Self {
        let desc = &image.desc;
        Self {
            data,
            width: desc.width as u32,
            height: desc.height as u32,
            depth: desc.depth as u32,
            array_size: desc.array_size as u32,
            row_pitch: desc.row_pitch as u32,
            slice_pitch: desc.slice_pitch as u32,
            element_size: image.format.element_size() as u32,
            num_channels: image.format.order.channels() as u32,
            order: image.format.order.code(),
            data_type: image.format.data_type.code(),
            image_type: desc.r#type as u32,
        }
    }

    pub fn to_be(self) -> Self {
        let words: [u32; 12] = bytemuck::cast(self);
        bytemuck::cast(words.map(u32::to_be))
    }
}

/// Waiting for a core: exponential backoff between checks, optionally bounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub timeout: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_micros(50),
            max: Duration::from_millis(1),
            timeout: None,
        }
    }
}

impl PollPolicy {
    /// Calls `done` until it reports completion or the timeout passes.
    pub fn poll_until(
        &self,
        mut done: impl FnMut() -> std::io::Result<bool>,
    ) -> Result<(), DeviceError> {
        let start = Instant::now();
        let mut delay = self.initial;
        loop {
            if done()? {
                return Ok(());
            }
            if let Some(timeout) = self.timeout {
                if start.elapsed() >= timeout {
                    return Err(DeviceError::Timeout(timeout));
                }
            }
            std::thread::sleep(delay);
            delay = (delay * 2).min(self.max);
        }
    }
}

/// Source of cores for a [`SoftcoreDriver`].
pub trait CoreProvider: Send + Sync {
    fn count(&self) -> usize;

    fn open(&self, index: usize) -> std::io::Result<Box<dyn Core>>;
}

/// Cores found under a sysfs class directory.
#[derive(Debug, Clone)]
pub struct SysfsProvider {
    root: PathBuf,
}

impl SysfsProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn locations(&self) -> Vec<CoreLocation> {
        hardware::discover(&self.root).unwrap_or_else(|err| {
            log::warn!("failed to scan {}: {err}", self.root.display());
            vec![]
        })
    }
}

impl Default for SysfsProvider {
    fn default() -> Self {
        Self::new(hardware::DEFAULT_ROOT)
    }
}

impl CoreProvider for SysfsProvider {
    fn count(&self) -> usize {
        self.locations().len()
    }

    fn open(&self, index: usize) -> std::io::Result<Box<dyn Core>> {
        let locations = self.locations();
        let location = locations.get(index).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, format!("no core {index}"))
        })?;
        Ok(Box::new(SysfsCore::open(location)?))
    }
}

pub struct SoftcoreBuilder {
    provider: Arc<dyn CoreProvider>,
    generator: Arc<dyn CodeGenerator>,
    memory: usize,
    poll: Option<PollPolicy>,
}

impl SoftcoreBuilder {
    /// Cores from sysfs, kernels built by `generator`.
    pub fn new(generator: impl CodeGenerator + 'static) -> Self {
        Self {
            provider: Arc::new(SysfsProvider::default()),
            generator: Arc::new(generator),
            memory: DEFAULT_MEMORY_SIZE,
            poll: None,
        }
    }

    pub fn provider(mut self, provider: impl CoreProvider + 'static) -> Self {
        self.provider = Arc::new(provider);
        self
    }

    /// Size of each core's memory in bytes.
    pub fn memory(mut self, memory: usize) -> Self {
        self.memory = memory;
        self
    }

    /// Overrides the poll policy. By default the timeout comes from the runtime configuration.
    pub fn poll(mut self, poll: PollPolicy) -> Self {
        self.poll = Some(poll);
        self
    }

    pub fn build(self) -> SoftcoreDriver {
        SoftcoreDriver {
            provider: self.provider,
            generator: self.generator,
            memory: self.memory,
            poll: self.poll,
        }
    }
}

/// Soft-core processors on FPGAs, one device per core.
pub struct SoftcoreDriver {
    provider: Arc<dyn CoreProvider>,
    generator: Arc<dyn CodeGenerator>,
    memory: usize,
    poll: Option<PollPolicy>,
}

impl DeviceDriver for SoftcoreDriver {
    fn name(&self) -> &str {
        "softcore"
    }

    fn probe(&self, config: &Config) -> usize {
        match config.allows_driver(self.name()) {
            true => self.provider.count(),
            false => 0,
        }
    }

    fn init(
        &self,
        index: usize,
        context: &DriverContext,
    ) -> Result<Arc<dyn DeviceOps>, DeviceError> {
        let core = self.provider.open(index)?;
        let info = DeviceInfo {
            name: core.name().to_string(),
            r#type: DeviceType::Accelerator,
            memory_family: format!("softcore:{}", context.id),
            pointer_width: POINTER_WIDTH,
            big_endian: true,
            global_mem_size: self.memory,
            max_mem_alloc_size: self.memory / 4,
            max_work_group_size: MAX_WORK_GROUP_SIZE,
            image_support: true,
            native_kernels: true,
        };
        let config = RegionConfig::with_alignment(POINTER_WIDTH);
        let region = MemoryRegion::new(0, self.memory, config);
        let poll = self.poll.unwrap_or(PollPolicy {
            timeout: context.config.poll_timeout,
            ..Default::default()
        });

        Ok(Arc::new(SoftcoreDevice {
            info,
            core: Mutex::new(core),
            region: Mutex::new(region),
            generator: self.generator.clone(),
            cache: context.cache.clone(),
            poll,
            leave_temp_files: context.config.leave_compiler_temp_files,
            level: context.config.transfer_level(),
        }))
    }
}

struct SoftcoreDevice {
    info: DeviceInfo,
    core: Mutex<Box<dyn Core>>,
    region: Mutex<MemoryRegion>,
    generator: Arc<dyn CodeGenerator>,
    cache: Arc<CompilerCache>,
    poll: PollPolicy,
    leave_temp_files: bool,
    level: log::Level,
}

impl SoftcoreDevice {
    /// Device address of `size` bytes at `offset` into `chunk`.
    fn locate(&self, chunk: ChunkId, offset: usize, size: usize) -> Result<u64, DeviceError> {
        let region = self.region.lock().expect("failed to lock");
        let limit = region.chunk(chunk)?.size;
        match offset.checked_add(size) {
            Some(end) if end <= limit => Ok(region.address(chunk)? + offset as u64),
            _ => Err(DeviceError::OutOfRange {
                offset,
                size,
                limit,
            }),
        }
    }

    fn pointer(&self, chunk: ChunkId) -> Result<u32, DeviceError> {
        let address = self.locate(chunk, 0, 0)?;
        u32::try_from(address).map_err(|_| DeviceError::Unsupported("address beyond 32 bits"))
    }

    /// Reads a linked program image and points its header at the argument and context blobs.
    fn load_program(
        &self,
        linked: &Path,
        arguments: u32,
        context: u32,
    ) -> Result<Vec<u8>, DeviceError> {
        let mut program = std::fs::read(linked).map_err(|source| BuildError::Io {
            path: linked.to_path_buf(),
            source,
        })?;
        if program.len() < PROGRAM_HEADER || program.len() > PROGRAM_RESERVE {
            let message = format!("program image of {} bytes", program.len());
            return Err(DeviceError::Kernel(message));
        }
        program[0..4].copy_from_slice(&arguments.to_be_bytes());
        program[4..8].copy_from_slice(&context.to_be_bytes());
        Ok(program)
    }

    fn start(&self, entry: u32) -> Result<(), DeviceError> {
        let mut core = self.core.lock().expect("failed to lock");
        core.set_run(false)?;
        core.set_reset_vector(entry)?;
        core.set_reset(true)?;
        core.set_reset(false)?;
        core.set_run(true)?;
        self.poll.poll_until(|| core.done())
    }
}

/// Chunks that live for one kernel run.
struct Staging<'a> {
    device: &'a SoftcoreDevice,
    chunks: Vec<ChunkId>,
}

impl<'a> Staging<'a> {
    fn new(device: &'a SoftcoreDevice) -> Self {
        Self {
            device,
            chunks: vec![],
        }
    }

    fn alloc(&mut self, size: usize) -> Result<ChunkId, DeviceError> {
        let chunk = self.device.alloc(size)?;
        self.chunks.push(chunk);
        Ok(chunk)
    }
}

impl Drop for Staging<'_> {
    fn drop(&mut self) {
        for chunk in self.chunks.drain(..) {
            self.device.free(chunk);
        }
    }
}

const BLOB_OVERFLOW: DeviceError = DeviceError::OutOfResources("argument blob beyond 32 bits");

#[inline]
fn align(size: usize) -> Result<usize, DeviceError> {
    size.checked_next_multiple_of(POINTER_WIDTH).ok_or(BLOB_OVERFLOW)
}

/// Bytes needed for the pointer list plus by-value data of a kernel's arguments.
fn blob_size(args: &[ResolvedArg], locals: &[usize]) -> Result<usize, DeviceError> {
    let list = POINTER_WIDTH * (args.len() + locals.len());
    let data = args.iter().map(|arg| match arg {
        ResolvedArg::Scalar(scalar) => align(scalar.len()),
        ResolvedArg::Local(size) => align(*size),
        ResolvedArg::Image(_) => align(size_of::<DeviceImage>()),
        ResolvedArg::Sampler(_) => Ok(POINTER_WIDTH),
        ResolvedArg::Buffer(_) => Ok(0),
    });
    let locals = locals.iter().map(|&size| align(size));
    data.chain(locals).try_fold(list, |total, size| {
        total.checked_add(size?).ok_or(BLOB_OVERFLOW)
    })
}

/// Lays out the argument blob placed at device address `base`.
///
/// The blob starts with one big-endian pointer per argument, then automatic local; pointed-to
/// data follows in argument order. Buffers point at their chunks, null buffers are 0. The whole
/// blob must be addressable with 32 bits.
fn encode_args(
    args: &[ResolvedArg],
    locals: &[usize],
    base: u32,
    pointer: impl Fn(ChunkId) -> Result<u32, DeviceError>,
) -> Result<Vec<u8>, DeviceError> {
    let size = blob_size(args, locals)?;
    u32::try_from(size)
        .ok()
        .and_then(|size| base.checked_add(size))
        .ok_or(BLOB_OVERFLOW)?;

    let list = POINTER_WIDTH * (args.len() + locals.len());
    let mut pointers = Vec::with_capacity(list);
    let mut data = Vec::with_capacity(size - list);

    // stores `bytes` padded to `size` in the data area and points at it
    let mut push = |pointers: &mut Vec<u8>, bytes: &[u8], size: usize| {
        let address = u32::try_from(list + data.len())
            .ok()
            .and_then(|offset| base.checked_add(offset))
            .ok_or(BLOB_OVERFLOW)?;
        pointers.extend_from_slice(&address.to_be_bytes());
        data.extend_from_slice(bytes);
        data.resize(data.len() + align(size)? - bytes.len(), 0);
        Ok::<_, DeviceError>(())
    };

    for arg in args {
        match arg {
            ResolvedArg::Scalar(scalar) => {
                let bytes = scalar.to_endian(true);
                push(&mut pointers, &bytes, bytes.len())?;
            }
            ResolvedArg::Local(size) => push(&mut pointers, &[], *size)?,
            ResolvedArg::Buffer(None) => pointers.extend_from_slice(&0u32.to_be_bytes()),
            ResolvedArg::Buffer(Some(buffer)) => {
                let address = pointer(buffer.chunk)?;
                pointers.extend_from_slice(&address.to_be_bytes());
            }
            ResolvedArg::Image(image) => {
                let address = pointer(image.chunk)?;
                let image = DeviceImage::new(image, address).to_be();
                push(&mut pointers, bytemuck::bytes_of(&image), size_of::<DeviceImage>())?;
            }
            ResolvedArg::Sampler(sampler) => {
                push(&mut pointers, &sampler.bits().to_be_bytes(), POINTER_WIDTH)?;
            }
        }
    }
    for &size in locals {
        push(&mut pointers, &[], size)?;
    }
    debug_assert_eq!(pointers.len() + data.len(), size);

    pointers.extend_from_slice(&data);
    Ok(pointers)
}

impl DeviceOps for SoftcoreDevice {
    #[inline]
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn alloc(&self, size: usize) -> Result<ChunkId, DeviceError> {
        let mut region = self.region.lock().expect("failed to lock");
        Ok(region.alloc(size)?)
    }

    fn free(&self, chunk: ChunkId) {
        let mut region = self.region.lock().expect("failed to lock");
        if let Err(err) = region.free(chunk) {
            log::error!("{}: {err}", self.info.name);
        }
    }

    fn memory_usage(&self) -> MemoryUsage {
        let region = self.region.lock().expect("failed to lock");
        MemoryUsage {
            capacity: region.capacity(),
            free: region.free_bytes(),
            largest_free: region.largest_free(),
        }
    }

    fn read(&self, dst: &mut [u8], src: ChunkId, offset: usize) -> Result<(), DeviceError> {
        let address = self.locate(src, offset, dst.len())?;
        let start = Instant::now();
        let mut core = self.core.lock().expect("failed to lock");
        core.read_memory(address, dst)?;
        log::log!(
            self.level,
            "{}: read {} bytes from {address:#x} in {:?}",
            self.info.name,
            dst.len(),
            start.elapsed()
        );
        Ok(())
    }

    fn write(&self, src: &[u8], dst: ChunkId, offset: usize) -> Result<(), DeviceError> {
        let address = self.locate(dst, offset, src.len())?;
        let start = Instant::now();
        let mut core = self.core.lock().expect("failed to lock");
        core.write_memory(address, src)?;
        log::log!(
            self.level,
            "{}: wrote {} bytes to {address:#x} in {:?}",
            self.info.name,
            src.len(),
            start.elapsed()
        );
        Ok(())
    }

    fn compile_submitted_kernels(&self, command: &mut RunCommand) -> Result<(), DeviceError> {
        let kernel = &command.kernel;
        let artifact = self.cache.get_or_build(
            kernel.tmp_dir(),
            kernel.name(),
            self.generator.as_ref(),
            &self.info,
        )?;
        command.artifact = Some(artifact);
        Ok(())
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    fn run(&self, command: &RunCommand) -> Result<(), DeviceError> {
        let kernel = &command.kernel;
        let artifact = command
            .artifact
            .as_ref()
            .ok_or_else(|| DeviceError::MissingKernel(kernel.name().to_string()))?;
        let mut staging = Staging::new(self);

        // 1. argument blob
        let size = blob_size(&command.args, kernel.locals())?;
        let arguments = staging.alloc(size)?;
        let base = self.pointer(arguments)?;
        let blob = encode_args(&command.args, kernel.locals(), base, |chunk| {
            self.pointer(chunk)
        })?;
        self.write(&blob, arguments, 0)?;

        // 2. work-group context
        let context = staging.alloc(size_of::<CoreContext>())?;

        // 3. program, linked at its load address
        let program = staging.alloc(PROGRAM_RESERVE)?;
        let address = self.pointer(program)?;
        let linked = self
            .generator
            .link(artifact, address.into(), kernel.name())?;
        let image = self.load_program(&linked, base, self.pointer(context)?);
        if !self.leave_temp_files && linked != *artifact {
            if let Err(err) = std::fs::remove_file(&linked) {
                log::debug!("failed to remove {}: {err}", linked.display());
            }
        }
        self.write(&image?, program, 0)?;

        // 4. one reset and run per work-group
        let range = &command.range;
        let num_groups = range.num_groups().map(|x| x as u32);
        let global_offset = range.global_offset.map(|x| x as u32);
        let entry = address + PROGRAM_HEADER as u32;
        for group_id in range.groups() {
            let data = CoreContext {
                work_dim: range.work_dim as u32,
                num_groups,
                group_id: group_id.map(|x| x as u32),
                global_offset,
            }
            .to_be();
            self.write(bytemuck::bytes_of(&data), context, 0)?;
            self.start(entry)?;
        }
        log::debug!(
            "{}: ran `{}` over {} work-group(s)",
            self.info.name,
            kernel.name(),
            num_groups.iter().product::<u32>()
        );
        Ok(())
    }

    fn uninit(&self) {
        let usage = self.memory_usage();
        if usage.free != usage.capacity {
            log::debug!(
                "{}: {} bytes still allocated at shutdown",
                self.info.name,
                usage.capacity - usage.free
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        error::Error,
        path::{Path, PathBuf},
        sync::{
            Arc, Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use super::{
        CoreContext, CoreProvider, POINTER_WIDTH, PROGRAM_RESERVE, PollPolicy, SoftcoreBuilder,
        blob_size, encode_args,
    };
    use crate::loom::{
        command::ResolvedArg,
        compiler::{BuildError, CodeGenerator},
        config::Config,
        device::{DeviceError, DeviceInfo, allocator::ChunkId, hardware::Core},
        kernel::{ArgType, Kernel, KernelArg, NdRange, ScalarBytes},
        mem::{HostBuffer, MemFlags},
        queue::CommandQueue,
        runtime::RuntimeBuilder,
    };

    const LOCAL_SIZE: usize = 4;

    /// Emulates a core running `scale(uint *data, uint factor)` with a fixed local size.
    struct SimCore {
        memory: Vec<u8>,
        reset_vector: u32,
        done: bool,
        runs: Arc<AtomicUsize>,
    }

    impl SimCore {
        fn word(&self, address: u32) -> u32 {
            let address = address as usize;
            let bytes = &self.memory[address..address + 4];
            u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
        }

        fn execute(&mut self) {
            let program = self.reset_vector - 8;
            let arguments = self.word(program);
            let context = self.word(program + 4);

            let data = self.word(arguments);
            let factor = self.word(self.word(arguments + 4));
            let group = self.word(context + 16);
            for item in 0..LOCAL_SIZE as u32 {
                let address = data + 4 * (group * LOCAL_SIZE as u32 + item);
                let value = self.word(address) * factor;
                let address = address as usize;
                self.memory[address..address + 4].copy_from_slice(&value.to_be_bytes());
            }
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.done = true;
        }
    }

    impl Core for SimCore {
        fn name(&self) -> &str {
            "sim"
        }

        fn read_memory(&mut self, address: u64, data: &mut [u8]) -> std::io::Result<()> {
            let address = address as usize;
            data.copy_from_slice(&self.memory[address..address + data.len()]);
            Ok(())
        }

        fn write_memory(&mut self, address: u64, data: &[u8]) -> std::io::Result<()> {
            let address = address as usize;
            self.memory[address..address + data.len()].copy_from_slice(data);
            Ok(())
        }

        fn set_run(&mut self, run: bool) -> std::io::Result<()> {
            match run {
                true => self.execute(),
                false => self.done = false,
            }
            Ok(())
        }

        fn set_reset(&mut self, _reset: bool) -> std::io::Result<()> {
            Ok(())
        }

        fn set_reset_vector(&mut self, address: u32) -> std::io::Result<()> {
            self.reset_vector = address;
            Ok(())
        }

        fn done(&mut self) -> std::io::Result<bool> {
            Ok(self.done)
        }
    }

    struct SimProvider {
        memory: usize,
        runs: Arc<AtomicUsize>,
    }

    impl CoreProvider for SimProvider {
        fn count(&self) -> usize {
            1
        }

        fn open(&self, _index: usize) -> std::io::Result<Box<dyn Core>> {
            Ok(Box::new(SimCore {
                memory: vec![0; self.memory],
                reset_vector: 0,
                done: false,
                runs: self.runs.clone(),
            }))
        }
    }

    /// Writes a fixed program image; linking copies it next to the artifact.
    #[derive(Default)]
    struct FakeToolchain {
        builds: AtomicUsize,
        links: Mutex<Vec<PathBuf>>,
    }

    impl CodeGenerator for Arc<FakeToolchain> {
        fn generate(
            &self,
            tmpdir: &Path,
            kernel: &str,
            _device: &DeviceInfo,
        ) -> Result<PathBuf, BuildError> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            let artifact = tmpdir.join(format!("{kernel}.so"));
            std::fs::write(&artifact, [0u8; 16]).map_err(|source| BuildError::Io {
                path: artifact.clone(),
                source,
            })?;
            Ok(artifact)
        }

        fn link(
            &self,
            artifact: &Path,
            address: u64,
            _kernel: &str,
        ) -> Result<PathBuf, BuildError> {
            let linked = artifact.with_extension(format!("{address:x}.bin"));
            std::fs::copy(artifact, &linked).map_err(|source| BuildError::Io {
                path: linked.clone(),
                source,
            })?;
            self.links.lock().expect("failed to lock").push(linked.clone());
            Ok(linked)
        }
    }

    #[test]
    fn test_encode_args() -> Result<(), Box<dyn Error>> {
        let args = vec![
            ResolvedArg::Scalar(ScalarBytes::new(&0x0102_0304u32)),
            ResolvedArg::Buffer(None),
            ResolvedArg::Local(6),
            ResolvedArg::Scalar(ScalarBytes::new(&[0x0506u16, 0x0708])),
        ];
        let locals = [16];
        let size = blob_size(&args, &locals)?;
        // five pointers, 4 + 8 + 4 bytes of data, 16 bytes of automatic local
        assert_eq!(size, 5 * POINTER_WIDTH + 16 + 16);

        let pointer = |_: ChunkId| -> Result<u32, DeviceError> { unreachable!() };
        let blob = encode_args(&args, &locals, 0x1000, pointer)?;
        assert_eq!(blob.len(), size);

        let words = blob
            .chunks_exact(4)
            .map(|x| u32::from_be_bytes([x[0], x[1], x[2], x[3]]))
            .collect::<Vec<_>>();
        assert_eq!(words[..5], [0x1014, 0, 0x1018, 0x1020, 0x1024]);
        assert_eq!(blob[20..24], [1, 2, 3, 4]);
        assert_eq!(blob[32..36], [5, 6, 7, 8]);
        Ok(())
    }

    #[test]
    fn test_encode_args_overflow() -> Result<(), Box<dyn Error>> {
        let pointer = |_: ChunkId| -> Result<u32, DeviceError> { unreachable!() };
        let args = vec![ResolvedArg::Scalar(ScalarBytes::new(&1u32))];

        // the blob would run past the 32-bit address space
        let result = encode_args(&args, &[], u32::MAX - 4, pointer);
        assert!(matches!(result, Err(DeviceError::OutOfResources(_))));
        assert_eq!(encode_args(&args, &[], u32::MAX - 8, pointer)?.len(), 8);

        let args = vec![ResolvedArg::Local((u32::MAX as usize).saturating_add(1))];
        let result = encode_args(&args, &[], 0, pointer);
        assert!(matches!(result, Err(DeviceError::OutOfResources(_))));

        let result = blob_size(&[ResolvedArg::Local(usize::MAX - 2)], &[]);
        assert!(matches!(result, Err(DeviceError::OutOfResources(_))));
        let result = blob_size(&[ResolvedArg::Local(8)], &[usize::MAX - 8]);
        assert!(matches!(result, Err(DeviceError::OutOfResources(_))));
        Ok(())
    }

    #[test]
    fn test_context_layout() {
        let context = CoreContext {
            work_dim: 1,
            num_groups: [2, 1, 1],
            group_id: [1, 0, 0],
            global_offset: [0; 3],
        }
        .to_be();
        let bytes = bytemuck::bytes_of(&context);
        assert_eq!(bytes.len(), 40);
        assert_eq!(bytes[..4], [0, 0, 0, 1]);
        assert_eq!(bytes[16..20], [0, 0, 0, 1]);
    }

    #[test]
    fn test_poll() {
        let policy = PollPolicy {
            timeout: Some(Duration::from_millis(5)),
            ..Default::default()
        };
        let mut calls = 0;
        let result = policy.poll_until(|| {
            calls += 1;
            Ok(calls == 3)
        });
        assert!(result.is_ok());
        assert_eq!(calls, 3);

        let result = policy.poll_until(|| Ok(false));
        assert!(matches!(result, Err(DeviceError::Timeout(_))));
    }

    #[test]
    fn test_run() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let runs = Arc::new(AtomicUsize::new(0));
        let toolchain = Arc::new(FakeToolchain::default());
        let provider = SimProvider {
            memory: 1 << 22,
            runs: runs.clone(),
        };
        let driver = SoftcoreBuilder::new(toolchain.clone())
            .provider(provider)
            .memory(1 << 22)
            .build();
        let runtime = RuntimeBuilder::new()
            .config(Config::default())
            .driver(driver)
            .build()?;
        let device = &runtime.devices()[0];
        assert!(device.info().big_endian);
        let context = runtime.create_context(runtime.devices())?;
        let queue = CommandQueue::new(&context, device, Default::default())?;

        let data = (1..=8u32).map(u32::to_be).collect::<Vec<_>>();
        let host = HostBuffer::from_slice(&data);
        let buffer = context.create_buffer(MemFlags::USE_HOST_PTR, 32, Some(host.clone()))?;

        let kernel = Kernel::new("scale", dir.path(), [ArgType::Pointer, ArgType::Scalar]);
        let args = vec![KernelArg::buffer(buffer.clone()), KernelArg::scalar(&3u32)];
        for _ in 0..2 {
            let range = NdRange::linear(8, LOCAL_SIZE);
            queue.enqueue_ndrange_kernel(&kernel, &args, range, &[])?.wait()?;
        }

        let result = host
            .to_pod_vec::<u32>()
            .into_iter()
            .map(u32::from_be)
            .collect::<Vec<_>>();
        assert_eq!(result, (1..=8).map(|x| x * 9).collect::<Vec<_>>());
        assert_eq!(runs.load(Ordering::SeqCst), 4);

        // built once, linked per launch, linked images removed
        assert_eq!(toolchain.builds.load(Ordering::SeqCst), 1);
        assert!(runtime.compiler_cache().contains(dir.path(), "scale"));
        let links = toolchain.links.lock().expect("failed to lock").clone();
        assert_eq!(links.len(), 2);
        assert!(links.iter().all(|path| !path.exists()));

        // the program reserve and other staging chunks are released after every run
        let usage = device.ops().memory_usage();
        assert!(usage.capacity - usage.free < PROGRAM_RESERVE);
        Ok(())
    }
}
