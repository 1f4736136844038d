use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use bytemuck::Pod;
use derive_more::Display;
use itertools::iproduct;

pub use heddle_derive::KernelArgs;

use super::{error::Error, image::Sampler, mem::MemObject};

mod sealed {
    pub trait Sealed {}
}

/// Plain values that may be passed by value to a kernel. Arrays are vectors of lanes.
pub trait ScalarArg: Pod + sealed::Sealed {
    /// Size of one lane in bytes; byte order is swapped per lane.
    const LANE: usize;
}

macro_rules! impl_scalar_arg {
    ($($ty:ty),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}
            impl ScalarArg for $ty {
                const LANE: usize = size_of::<$ty>();
            }
        )*
    };
}

impl_scalar_arg!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

impl<T: ScalarArg, const N: usize> sealed::Sealed for [T; N] {}
impl<T: ScalarArg, const N: usize> ScalarArg for [T; N]
where
    [T; N]: Pod,
{
    const LANE: usize = T::LANE;
}

/// Raw bytes of a scalar argument in host byte order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalarBytes {
    pub bytes: Vec<u8>,
    pub lane: usize,
}

impl ScalarBytes {
    pub fn new<T: ScalarArg>(value: &T) -> Self {
        Self {
            bytes: bytemuck::bytes_of(value).to_vec(),
            lane: T::LANE,
        }
    }

    /// Bytes in the requested byte order, swapped lane by lane.
    pub fn to_endian(&self, big_endian: bool) -> Vec<u8> {
        let mut bytes = self.bytes.clone();
        if big_endian != cfg!(target_endian = "big") && self.lane > 1 {
            bytes
                .chunks_exact_mut(self.lane)
                .for_each(|lane| lane.reverse());
        }
        bytes
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgType {
    Scalar,
    Pointer,
    Local,
    Image,
    Sampler,
}

/// A value bound to one kernel parameter.
#[derive(Debug, Clone)]
pub enum KernelArg {
    Scalar(ScalarBytes),
    /// A global buffer. `None` passes a null pointer.
    Buffer(Option<MemObject>),
    /// Bytes of work-group local memory to reserve.
    Local(usize),
    Image(MemObject),
    Sampler(Sampler),
}

impl KernelArg {
    #[inline]
    pub fn scalar<T: ScalarArg>(value: &T) -> Self {
        Self::Scalar(ScalarBytes::new(value))
    }

    #[inline]
    pub fn buffer(mem: impl Into<Option<MemObject>>) -> Self {
        Self::Buffer(mem.into())
    }

    pub fn kind(&self) -> ArgType {
        match self {
            KernelArg::Scalar(_) => ArgType::Scalar,
            KernelArg::Buffer(_) => ArgType::Pointer,
            KernelArg::Local(_) => ArgType::Local,
            KernelArg::Image(_) => ArgType::Image,
            KernelArg::Sampler(_) => ArgType::Sampler,
        }
    }

    /// The memory object this argument refers to, if any.
    pub fn mem(&self) -> Option<&MemObject> {
        match self {
            KernelArg::Buffer(mem) => mem.as_ref(),
            KernelArg::Image(mem) => Some(mem),
            _ => None,
        }
    }
}

/// Lowers a value into an ordered kernel argument list. Derivable with `#[derive(KernelArgs)]`.
pub trait KernelArgs {
    fn args(&self) -> Vec<KernelArg>;
}

impl KernelArgs for [KernelArg] {
    fn args(&self) -> Vec<KernelArg> {
        self.to_vec()
    }
}

impl KernelArgs for Vec<KernelArg> {
    fn args(&self) -> Vec<KernelArg> {
        self.clone()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelId;

#[derive(Debug, Clone)]
struct KernelInner {
    id: uid::Id<KernelId>,
    name: String,
    tmp_dir: PathBuf,
    signature: Vec<ArgType>,
    locals: Vec<usize>,
}

/// A kernel function of a built program.
#[derive(Debug, Clone)]
pub struct Kernel(Arc<KernelInner>);

impl Kernel {
    /// `tmp_dir` is the program's build directory, where compiled artifacts are kept.
    pub fn new(
        name: impl Into<String>,
        tmp_dir: impl Into<PathBuf>,
        signature: impl IntoIterator<Item = ArgType>,
    ) -> Self {
        Self(Arc::new(KernelInner {
            id: uid::Id::new(),
            name: name.into(),
            tmp_dir: tmp_dir.into(),
            signature: signature.into_iter().collect(),
            locals: vec![],
        }))
    }

    /// Sets the local buffers the compiler allocated automatically, appended after the arguments.
    pub fn with_locals(mut self, locals: impl IntoIterator<Item = usize>) -> Self {
        let inner = Arc::make_mut(&mut self.0);
        inner.id = uid::Id::new();
        inner.locals = locals.into_iter().collect();
        self
    }

    #[inline]
    pub fn id(&self) -> uid::Id<KernelId> {
        self.0.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.0.name
    }

    #[inline]
    pub fn tmp_dir(&self) -> &Path {
        &self.0.tmp_dir
    }

    #[inline]
    pub fn signature(&self) -> &[ArgType] {
        &self.0.signature
    }

    #[inline]
    pub fn locals(&self) -> &[usize] {
        &self.0.locals
    }

    #[inline]
    pub fn num_args(&self) -> usize {
        self.0.signature.len()
    }

    /// Checks a bound argument list against the kernel's signature.
    pub fn check_args(&self, args: &[KernelArg]) -> Result<(), Error> {
        if args.len() != self.num_args() {
            log::debug!(
                "kernel `{}` takes {} arguments, {} given",
                self.name(),
                self.num_args(),
                args.len()
            );
            return Err(Error::InvalidKernelArgs);
        }
        for (index, (arg, &expected)) in args.iter().zip(self.signature()).enumerate() {
            let valid = match arg {
                KernelArg::Local(0) => false,
                KernelArg::Scalar(scalar) => !scalar.is_empty() && arg.kind() == expected,
                arg => arg.kind() == expected,
            };
            if !valid {
                log::debug!(
                    "kernel `{}` argument {index}: expected {expected}, found {}",
                    self.name(),
                    arg.kind()
                );
                return Err(Error::InvalidKernelArgs);
            }
        }
        Ok(())
    }
}

impl PartialEq for Kernel {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for Kernel {}

/// Index space of a kernel launch. Dimensions past `work_dim` are 1 (offsets 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NdRange {
    pub work_dim: usize,
    pub global_offset: [usize; 3],
    pub global_size: [usize; 3],
    pub local_size: [usize; 3],
}

impl NdRange {
    pub fn new(global_size: &[usize], local_size: &[usize]) -> Result<Self, Error> {
        let work_dim = global_size.len();
        if !(1..=3).contains(&work_dim) {
            return Err(Error::InvalidValue);
        }
        if local_size.len() != work_dim {
            return Err(Error::InvalidWorkGroupSize);
        }
        let mut range = Self {
            work_dim,
            global_offset: [0; 3],
            global_size: [1; 3],
            local_size: [1; 3],
        };
        range.global_size[..work_dim].copy_from_slice(global_size);
        range.local_size[..work_dim].copy_from_slice(local_size);
        Ok(range)
    }

    #[inline]
    pub fn linear(global_size: usize, local_size: usize) -> Self {
        Self {
            work_dim: 1,
            global_offset: [0; 3],
            global_size: [global_size, 1, 1],
            local_size: [local_size, 1, 1],
        }
    }

    pub fn with_offset(mut self, offset: &[usize]) -> Self {
        let len = offset.len().min(self.work_dim);
        self.global_offset = [0; 3];
        self.global_offset[..len].copy_from_slice(&offset[..len]);
        self
    }

    /// Checks sizes against each other and the device limit on work-items per group.
    pub fn validate(&self, max_work_group_size: usize) -> Result<(), Error> {
        if !(1..=3).contains(&self.work_dim) {
            return Err(Error::InvalidValue);
        }
        for dim in 0..3 {
            let (global, local) = (self.global_size[dim], self.local_size[dim]);
            if dim >= self.work_dim {
                if global != 1 || local != 1 || self.global_offset[dim] != 0 {
                    return Err(Error::InvalidValue);
                }
                continue;
            }
            if global == 0 {
                return Err(Error::InvalidValue);
            }
            if local == 0 || global % local != 0 {
                return Err(Error::InvalidWorkGroupSize);
            }
        }
        let items = self
            .local_size
            .iter()
            .try_fold(1usize, |acc, &size| acc.checked_mul(size));
        match items {
            Some(items) if items <= max_work_group_size => Ok(()),
            _ => Err(Error::InvalidWorkGroupSize),
        }
    }

    #[inline]
    pub fn num_groups(&self) -> [usize; 3] {
        std::array::from_fn(|dim| self.global_size[dim] / self.local_size[dim].max(1))
    }

    /// Work-group ids, x fastest.
    pub fn groups(&self) -> impl Iterator<Item = [usize; 3]> + use<> {
        let [x, y, z] = self.num_groups();
        iproduct!(0..z, 0..y, 0..x).map(|(z, y, x)| [x, y, z])
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use itertools::Itertools;

    use super::{ArgType, Kernel, KernelArg, KernelArgs, NdRange, ScalarBytes};
    use crate::loom::{error, image::Sampler, mem::MemObject};

    #[test]
    fn test_scalar_endian() {
        let scalar = ScalarBytes::new(&0x0102_0304u32);
        assert_eq!(scalar.to_endian(true), vec![1, 2, 3, 4]);
        assert_eq!(scalar.to_endian(false), vec![4, 3, 2, 1]);

        // vectors swap per lane
        let vector = ScalarBytes::new(&[0x0102u16, 0x0304]);
        assert_eq!(vector.lane, 2);
        assert_eq!(vector.to_endian(true), vec![1, 2, 3, 4]);

        let byte = ScalarBytes::new(&[7u8, 8, 9]);
        assert_eq!(byte.to_endian(true), vec![7, 8, 9]);
    }

    #[test]
    fn test_check_args() {
        let kernel = Kernel::new(
            "scale",
            "/tmp/heddle",
            [ArgType::Pointer, ArgType::Scalar, ArgType::Local],
        );
        let args = vec![
            KernelArg::buffer(None),
            KernelArg::scalar(&2.0f32),
            KernelArg::Local(64),
        ];
        assert_eq!(kernel.check_args(&args), Ok(()));
        assert_eq!(
            kernel.check_args(&args[..2]),
            Err(error::Error::InvalidKernelArgs)
        );

        let args = vec![
            KernelArg::scalar(&1u32),
            KernelArg::scalar(&2.0f32),
            KernelArg::Local(64),
        ];
        assert_eq!(
            kernel.check_args(&args),
            Err(error::Error::InvalidKernelArgs)
        );

        let args = vec![
            KernelArg::buffer(None),
            KernelArg::scalar(&2.0f32),
            KernelArg::Local(0),
        ];
        assert_eq!(
            kernel.check_args(&args),
            Err(error::Error::InvalidKernelArgs)
        );
    }

    #[test]
    fn test_derive() {
        #[derive(super::KernelArgs)]
        #[kernel_args(crate = "crate")]
        struct Scale {
            #[arg(buffer)]
            data: Option<MemObject>,
            factor: f32,
            #[arg(local)]
            scratch: usize,
            #[arg(sampler)]
            sampler: Sampler,
            #[arg(skip)]
            _tag: u8,
        }

        let args = Scale {
            data: None,
            factor: 0.5,
            scratch: 128,
            sampler: Sampler::default(),
            _tag: 0,
        }
        .args();
        let kinds = args.iter().map(KernelArg::kind).collect_vec();
        assert_eq!(
            kinds,
            vec![
                ArgType::Pointer,
                ArgType::Scalar,
                ArgType::Local,
                ArgType::Sampler
            ]
        );
        match &args[1] {
            KernelArg::Scalar(scalar) => assert_eq!(scalar.bytes, 0.5f32.to_ne_bytes()),
            _ => unreachable!(),
        }

        #[derive(super::KernelArgs)]
        #[kernel_args(crate = "crate")]
        struct Pair(u32, #[arg(local)] usize);
        assert_eq!(Pair(1, 2).args().len(), 2);
    }

    #[test]
    fn test_ndrange() -> Result<(), Box<dyn Error>> {
        let range = NdRange::new(&[8, 6], &[4, 3])?;
        assert_eq!(range.num_groups(), [2, 2, 1]);
        assert_eq!(
            range.groups().collect_vec(),
            vec![[0, 0, 0], [1, 0, 0], [0, 1, 0], [1, 1, 0]]
        );
        range.validate(256)?;
        assert_eq!(range.validate(8), Err(error::Error::InvalidWorkGroupSize));

        assert_eq!(
            NdRange::linear(10, 4).validate(256),
            Err(error::Error::InvalidWorkGroupSize)
        );
        assert_eq!(
            NdRange::linear(0, 1).validate(256),
            Err(error::Error::InvalidValue)
        );
        assert!(NdRange::new(&[1, 1, 1, 1], &[1, 1, 1, 1]).is_err());

        let range = NdRange::linear(4, 2).with_offset(&[16, 3]);
        assert_eq!(range.global_offset, [16, 0, 0]);
        Ok(())
    }

    #[test]
    fn test_ndrange_overflow() -> Result<(), Box<dyn Error>> {
        // the product of the local sizes does not fit a usize
        let side = 1 << (usize::BITS / 2 + 4);
        let range = NdRange::new(&[side, side], &[side, side])?;
        assert_eq!(
            range.validate(usize::MAX),
            Err(error::Error::InvalidWorkGroupSize)
        );

        let (x, y) = (1 << (usize::BITS / 2), 1 << (usize::BITS / 2 - 1));
        let range = NdRange::new(&[x, y], &[x, y])?;
        assert_eq!(range.validate(1 << (usize::BITS - 1)), Ok(()));
        Ok(())
    }
}
