//! The `loom` module weaves host commands onto compute devices.
//! It accepts memory transfers and kernel launches through command queues, orders them through an
//! event graph, and executes them on pluggable device backends that manage their own memory.
//!
//! ## Key Components
//! 1. **Command Queues** (`queue`):
//!    - Validate and enqueue transfers, fills, maps and kernel launches.
//!    - In-order queues chain each command after the previous one; out-of-order queues rely on
//!      explicit wait lists only.
//!
//! 2. **Events** (`event`):
//!    - Reference-counted completion handles with a monotonic status.
//!    - Commands dispatch once every predecessor completes; failures propagate to dependents
//!      without ever reaching a device.
//!
//! 3. **Devices** (`device`):
//!    - A uniform capability set (`DeviceOps`) implemented by each backend driver.
//!    - A first-fit region allocator for device memory.
//!    - A host backend running registered work-group functions, and a soft-core accelerator
//!      backend driving cores through a hardware seam.
//!
//! 4. **Kernel Compilation** (`compiler`):
//!    - A process-wide artifact cache keyed by program directory and kernel name.
//!    - An external toolchain invoked through configured command steps.
//!
//! ## Design Principles
//! - **Explicit services**: configuration, the compiler cache and the event tracker live in a
//!   [`Runtime`](runtime::Runtime) value rather than in globals.
//! - **Ownership**: commands retain the memory objects they touch; events hold no references to
//!   commands that have finished.
//! - **Extensibility**: new hardware plugs in through [`DeviceDriver`](device::DeviceDriver).

pub mod api;
pub mod command;
pub mod compiler;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod event;
pub mod image;
pub mod kernel;
pub mod mem;
pub mod platform;
pub mod queue;
pub mod runtime;

pub use config::Config;
pub use context::Context;
pub use error::{Error, Status};
pub use event::{Event, ExecutionStatus, UserEvent};
pub use mem::{HostBuffer, MemFlags, MemObject};
pub use queue::{CommandQueue, QueueProperties};
pub use runtime::{Runtime, RuntimeBuilder};
