use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{compiler::BuildError, device::DeviceError, device::allocator::AllocError};

/// Status taxonomy reported at the host API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Error {
    #[error("device not available")]
    DeviceNotAvailable,
    #[error("memory object allocation failure")]
    MemObjectAllocationFailure,
    #[error("execution failure")]
    ExecutionFailure,
    #[error("profiling info not available")]
    ProfilingInfoNotAvailable,
    #[error("memory copy overlap")]
    MemCopyOverlap,
    #[error("image format not supported")]
    ImageFormatNotSupported,
    #[error("build program failure")]
    BuildProgramFailure,
    #[error("execution status error for events in wait list")]
    ExecStatusErrorForEventsInWaitList,
    #[error("invalid value")]
    InvalidValue,
    #[error("invalid device")]
    InvalidDevice,
    #[error("invalid context")]
    InvalidContext,
    #[error("invalid command queue")]
    InvalidCommandQueue,
    #[error("invalid host pointer")]
    InvalidHostPtr,
    #[error("invalid memory object")]
    InvalidMemObject,
    #[error("invalid kernel arguments")]
    InvalidKernelArgs,
    #[error("invalid work group size")]
    InvalidWorkGroupSize,
    #[error("invalid event wait list")]
    InvalidEventWaitList,
    #[error("invalid event")]
    InvalidEvent,
    #[error("invalid operation")]
    InvalidOperation,
    #[error("invalid buffer size")]
    InvalidBufferSize,
}

impl Error {
    /// The conventional negative numeric status of this error.
    pub const fn code(self) -> i32 {
        match self {
            Error::DeviceNotAvailable => -2,
            Error::MemObjectAllocationFailure => -4,
            Error::ExecutionFailure => -5,
            Error::ProfilingInfoNotAvailable => -7,
            Error::MemCopyOverlap => -8,
            Error::ImageFormatNotSupported => -10,
            Error::BuildProgramFailure => -11,
            Error::ExecStatusErrorForEventsInWaitList => -14,
            Error::InvalidValue => -30,
            Error::InvalidDevice => -33,
            Error::InvalidContext => -34,
            Error::InvalidCommandQueue => -36,
            Error::InvalidHostPtr => -37,
            Error::InvalidMemObject => -38,
            Error::InvalidKernelArgs => -52,
            Error::InvalidWorkGroupSize => -54,
            Error::InvalidEventWaitList => -57,
            Error::InvalidEvent => -58,
            Error::InvalidOperation => -59,
            Error::InvalidBufferSize => -61,
        }
    }
}

impl From<AllocError> for Error {
    fn from(_: AllocError) -> Self {
        Error::MemObjectAllocationFailure
    }
}

impl From<BuildError> for Error {
    fn from(_: BuildError) -> Self {
        Error::BuildProgramFailure
    }
}

impl From<DeviceError> for Error {
    fn from(value: DeviceError) -> Self {
        match value {
            DeviceError::Runtime(err) => err,
            DeviceError::Alloc(_) => Error::MemObjectAllocationFailure,
            DeviceError::Build(_) | DeviceError::MissingKernel(_) => Error::BuildProgramFailure,
            DeviceError::Unsupported(_) => Error::InvalidOperation,
            DeviceError::Io(_)
            | DeviceError::OutOfRange { .. }
            | DeviceError::Timeout(_)
            | DeviceError::OutOfResources(_)
            | DeviceError::Argument(..)
            | DeviceError::Kernel(_) => Error::ExecutionFailure,
        }
    }
}

/// Outcome of a call through the raw host boundary.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Status {
    #[display("success")]
    Success,
    #[display("{_0}")]
    Error(Error),
}

impl Status {
    #[inline]
    pub const fn code(self) -> i32 {
        match self {
            Status::Success => 0,
            Status::Error(err) => err.code(),
        }
    }

    #[inline]
    pub const fn is_success(self) -> bool {
        matches!(self, Status::Success)
    }
}

impl<T> From<&Result<T, Error>> for Status {
    fn from(value: &Result<T, Error>) -> Self {
        match value {
            Ok(_) => Status::Success,
            Err(err) => Status::Error(*err),
        }
    }
}

impl From<Error> for Status {
    fn from(value: Error) -> Self {
        Status::Error(value)
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, Status};
    use crate::loom::device::{DeviceError, allocator::AllocError};

    #[test]
    fn test_codes() {
        assert_eq!(Error::InvalidValue.code(), -30);
        assert_eq!(Error::MemCopyOverlap.code(), -8);
        assert_eq!(Error::InvalidEventWaitList.code(), -57);
        assert_eq!(Status::Success.code(), 0);
        assert_eq!(Status::from(Error::InvalidMemObject).code(), -38);
    }

    #[test]
    fn test_conversions() {
        let err: Error = AllocError::OutOfMemory {
            requested: 64,
            largest: 32,
        }
        .into();
        assert_eq!(err, Error::MemObjectAllocationFailure);

        let err: Error = DeviceError::MissingKernel("scale".into()).into();
        assert_eq!(err, Error::BuildProgramFailure);

        let err: Error = DeviceError::Timeout(std::time::Duration::from_millis(5)).into();
        assert_eq!(err, Error::ExecutionFailure);

        let err: Error = DeviceError::OutOfResources("argument blob").into();
        assert_eq!(err.code(), -5);

        let result: Result<(), Error> = Err(Error::InvalidContext);
        assert_eq!(Status::from(&result), Status::Error(Error::InvalidContext));
    }
}
