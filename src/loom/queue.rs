use std::sync::{Arc, Mutex};

use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{
    command::{CommandKind, CommandNode, KernelLaunch, NativeLaunch, Rect},
    context::Context,
    device::Device,
    error::Error,
    event::{Event, EventId, Submission},
    kernel::{Kernel, KernelArgs, NdRange},
    mem::{HostBuffer, MemObject},
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct QueueProperties {
    /// Commands may run as soon as their wait lists allow.
    pub out_of_order: bool,
    /// Record timestamps on every event of the queue.
    pub profiling: bool,
}

/// A wait list as passed across the host boundary: a count and an optional array.
#[derive(Debug, Clone, Copy)]
pub struct WaitList<'a> {
    num_events: usize,
    events: Option<&'a [Event]>,
}

impl<'a> WaitList<'a> {
    pub const NONE: WaitList<'static> = WaitList {
        num_events: 0,
        events: None,
    };

    #[inline]
    pub fn new(num_events: usize, events: Option<&'a [Event]>) -> Self {
        Self { num_events, events }
    }

    /// Either both absent or both present, and never longer than the array.
    pub fn resolve(self) -> Result<&'a [Event], Error> {
        match (self.events, self.num_events) {
            (None, 0) => Ok(&[]),
            (Some(events), n) if n > 0 && n <= events.len() => Ok(&events[..n]),
            _ => Err(Error::InvalidEventWaitList),
        }
    }
}

impl<'a> From<&'a [Event]> for WaitList<'a> {
    fn from(events: &'a [Event]) -> Self {
        match events.is_empty() {
            true => WaitList::NONE,
            false => WaitList::new(events.len(), Some(events)),
        }
    }
}

/// Host view of a mapped buffer range. Hand it back to [`CommandQueue::enqueue_unmap`].
#[derive(Debug, Clone)]
pub struct Mapped {
    mem: MemObject,
    offset: usize,
    data: HostBuffer,
}

impl Mapped {
    #[inline]
    pub fn data(&self) -> &HostBuffer {
        &self.data
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn mem(&self) -> &MemObject {
        &self.mem
    }
}

#[derive(Debug, Default)]
struct QueueState {
    last: Option<Event>,
    outstanding: Vec<Event>,
}

#[derive(Debug)]
struct QueueInner {
    id: uid::Id<QueueId>,
    context: Context,
    device: Device,
    properties: QueueProperties,
    state: Mutex<QueueState>,
}

/// Submits commands to one device of a context.
#[derive(Debug, Clone)]
pub struct CommandQueue(Arc<QueueInner>);

impl CommandQueue {
    pub fn new(
        context: &Context,
        device: &Device,
        properties: QueueProperties,
    ) -> Result<Self, Error> {
        if !context.contains(device.id()) {
            return Err(Error::InvalidDevice);
        }
        Ok(Self(Arc::new(QueueInner {
            id: uid::Id::new(),
            context: context.clone(),
            device: device.clone(),
            properties,
            state: Default::default(),
        })))
    }

    #[inline]
    pub fn id(&self) -> uid::Id<QueueId> {
        self.0.id
    }

    #[inline]
    pub fn context(&self) -> &Context {
        &self.0.context
    }

    #[inline]
    pub fn device(&self) -> &Device {
        &self.0.device
    }

    #[inline]
    pub fn properties(&self) -> QueueProperties {
        self.0.properties
    }

    /// Validates and publishes a command. Nothing is retained or allocated if validation fails.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub(crate) fn enqueue_with(&self, kind: CommandKind, wait: WaitList) -> Result<Event, Error> {
        let context = &self.0.context;
        let device = &self.0.device;

        // 1. objects, then sizes
        kind.validate_objects(context.id())?;
        kind.validate_sizes(device.info())?;

        // 2. wait list
        let wait = wait.resolve()?;
        if wait.iter().any(|event| event.context() != context.id()) {
            return Err(Error::InvalidContext);
        }

        // 3. bounds and overlap
        kind.validate_ranges()?;

        // 4. storage on the queue's device
        assert!(
            context.contains(device.id()),
            "device {} missing from context {}",
            device.id(),
            context.id()
        );
        for mem in kind.mem_objects() {
            mem.chunk_for(device)?;
        }

        // 5. publish
        let command = kind.command_type();
        let mut state = self.0.state.lock().expect("failed to lock");
        state.outstanding.retain(|event| !event.is_terminal());

        let mut explicit = wait.iter().map(Event::id).collect_vec();
        let marker = matches!(kind, CommandKind::Marker) && wait.is_empty();
        if marker && self.0.properties.out_of_order {
            explicit.extend(state.outstanding.iter().map(Event::id));
        }
        let implicit = match self.0.properties.out_of_order {
            true => None,
            false => state.last.as_ref().map(Event::id),
        };

        let node = CommandNode {
            kind,
            queue: self.id(),
            device: device.id(),
        };
        let submission = Submission {
            node,
            device: device.clone(),
        };
        let tracker = context.tracker();
        let id: EventId = tracker.submit(
            context.id(),
            submission,
            &explicit,
            implicit,
            self.0.properties.profiling,
        )?;
        let event = Event::from_raw(id, tracker.clone());
        log::debug!("queue {} enqueued {command} as event {id}", self.id());

        state.last = Some(event.clone());
        state.outstanding.push(event.clone());
        Ok(event)
    }

    /// Enqueues any command after the events of `wait`.
    #[inline]
    pub fn enqueue(&self, kind: CommandKind, wait: &[Event]) -> Result<Event, Error> {
        self.enqueue_with(kind, wait.into())
    }

    pub fn enqueue_read_buffer(
        &self,
        src: &MemObject,
        offset: usize,
        size: usize,
        dst: &HostBuffer,
        wait: &[Event],
    ) -> Result<Event, Error> {
        let kind = CommandKind::ReadBuffer {
            src: src.clone(),
            offset,
            size,
            dst: dst.clone(),
        };
        self.enqueue(kind, wait)
    }

    pub fn enqueue_write_buffer(
        &self,
        dst: &MemObject,
        offset: usize,
        size: usize,
        src: &HostBuffer,
        wait: &[Event],
    ) -> Result<Event, Error> {
        let kind = CommandKind::WriteBuffer {
            dst: dst.clone(),
            offset,
            size,
            src: src.clone(),
        };
        self.enqueue(kind, wait)
    }

    pub fn enqueue_copy_buffer(
        &self,
        src: &MemObject,
        dst: &MemObject,
        src_offset: usize,
        dst_offset: usize,
        size: usize,
        wait: &[Event],
    ) -> Result<Event, Error> {
        let kind = CommandKind::CopyBuffer {
            src: src.clone(),
            src_offset,
            dst: dst.clone(),
            dst_offset,
            size,
        };
        self.enqueue(kind, wait)
    }

    /// Reads a rectangle of `src` into `dst`. `rect.src` addresses the buffer.
    pub fn enqueue_read_buffer_rect(
        &self,
        src: &MemObject,
        dst: &HostBuffer,
        rect: Rect,
        wait: &[Event],
    ) -> Result<Event, Error> {
        let kind = CommandKind::ReadBufferRect {
            src: src.clone(),
            rect,
            dst: dst.clone(),
        };
        self.enqueue(kind, wait)
    }

    /// Writes a rectangle of `src` into `dst`. `rect.dst` addresses the buffer.
    pub fn enqueue_write_buffer_rect(
        &self,
        dst: &MemObject,
        src: &HostBuffer,
        rect: Rect,
        wait: &[Event],
    ) -> Result<Event, Error> {
        let kind = CommandKind::WriteBufferRect {
            dst: dst.clone(),
            rect,
            src: src.clone(),
        };
        self.enqueue(kind, wait)
    }

    pub fn enqueue_copy_buffer_rect(
        &self,
        src: &MemObject,
        dst: &MemObject,
        rect: Rect,
        wait: &[Event],
    ) -> Result<Event, Error> {
        let kind = CommandKind::CopyBufferRect {
            src: src.clone(),
            dst: dst.clone(),
            rect,
        };
        self.enqueue(kind, wait)
    }

    /// Repeats `pattern` over `size` bytes at `offset`.
    pub fn enqueue_fill_buffer(
        &self,
        dst: &MemObject,
        pattern: &[u8],
        offset: usize,
        size: usize,
        wait: &[Event],
    ) -> Result<Event, Error> {
        let kind = CommandKind::FillBuffer {
            dst: dst.clone(),
            pattern: pattern.to_vec(),
            offset,
            size,
        };
        self.enqueue(kind, wait)
    }

    /// Maps a range of `src`. The returned data is valid once the event completes.
    pub fn enqueue_map_buffer(
        &self,
        src: &MemObject,
        offset: usize,
        size: usize,
        wait: &[Event],
    ) -> Result<(Event, Mapped), Error> {
        let data = HostBuffer::new(size);
        let kind = CommandKind::MapBuffer {
            src: src.clone(),
            offset,
            size,
            dst: data.clone(),
        };
        let event = self.enqueue(kind, wait)?;
        let mapped = Mapped {
            mem: src.clone(),
            offset,
            data,
        };
        Ok((event, mapped))
    }

    /// Writes a mapped range back to its buffer.
    pub fn enqueue_unmap(&self, mapped: &Mapped, wait: &[Event]) -> Result<Event, Error> {
        let kind = CommandKind::Unmap {
            dst: mapped.mem.clone(),
            offset: mapped.offset,
            src: mapped.data.clone(),
        };
        self.enqueue(kind, wait)
    }

    pub fn enqueue_ndrange_kernel(
        &self,
        kernel: &Kernel,
        args: &(impl KernelArgs + ?Sized),
        range: NdRange,
        wait: &[Event],
    ) -> Result<Event, Error> {
        let launch = KernelLaunch {
            kernel: kernel.clone(),
            args: args.args(),
            range,
        };
        self.enqueue(CommandKind::NdRangeKernel(launch), wait)
    }

    /// Runs `function` on the host over copies of `buffers`, written back afterwards.
    pub fn enqueue_native_kernel<F>(
        &self,
        function: F,
        buffers: &[MemObject],
        wait: &[Event],
    ) -> Result<Event, Error>
    where
        F: Fn(&mut [Vec<u8>]) -> Result<(), String> + Send + Sync + 'static,
    {
        let launch = NativeLaunch {
            function: Arc::new(function),
            buffers: buffers.to_vec(),
        };
        self.enqueue(CommandKind::NativeKernel(launch), wait)
    }

    /// Completes after `wait`, or after everything enqueued so far if `wait` is empty.
    pub fn enqueue_marker(&self, wait: &[Event]) -> Result<Event, Error> {
        self.enqueue(CommandKind::Marker, wait)
    }

    /// Commands are handed to devices as soon as they are ready, so there is nothing to push.
    #[inline]
    pub fn flush(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Blocks until every command enqueued so far has finished, successfully or not.
    pub fn finish(&self) -> Result<(), Error> {
        let outstanding = {
            let mut state = self.0.state.lock().expect("failed to lock");
            std::mem::take(&mut state.outstanding)
        };
        for event in &outstanding {
            if let Err(err) = event.wait() {
                log::debug!("event {} finished with {err}", event.id());
            }
        }
        Ok(())
    }
}

impl PartialEq for CommandQueue {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for CommandQueue {}

#[cfg(test)]
mod tests {
    use std::{
        error::Error,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use super::{CommandQueue, QueueProperties, WaitList};
    use crate::loom::{
        command::{Rect, RectLayout},
        context::Context,
        device::HostBuilder,
        error,
        event::ExecutionStatus,
        mem::{HostBuffer, MemFlags, MemObject},
        runtime::{Runtime, RuntimeBuilder},
    };

    fn setup() -> Result<(Runtime, Context, CommandQueue), Box<dyn Error>> {
        let runtime = RuntimeBuilder::new()
            .driver(HostBuilder::new().memory(1 << 16).build())
            .build()?;
        let context = runtime.create_context(runtime.devices())?;
        let queue = CommandQueue::new(&context, &runtime.devices()[0], Default::default())?;
        Ok((runtime, context, queue))
    }

    fn buffer(context: &Context, data: &[u8]) -> Result<MemObject, error::Error> {
        let host = HostBuffer::from_slice(data);
        context.create_buffer(MemFlags::COPY_HOST_PTR, data.len(), Some(host))
    }

    #[test]
    fn test_wait_list() {
        fn len(list: WaitList) -> Result<usize, error::Error> {
            list.resolve().map(|events| events.len())
        }
        assert_eq!(len(WaitList::NONE), Ok(0));
        assert_eq!(
            len(WaitList::new(2, None)),
            Err(error::Error::InvalidEventWaitList)
        );
        assert_eq!(
            len(WaitList::new(0, Some(&[][..]))),
            Err(error::Error::InvalidEventWaitList)
        );
    }

    #[test]
    fn test_copy() -> Result<(), Box<dyn Error>> {
        let (_runtime, context, queue) = setup()?;
        let data = (0..64).collect::<Vec<u8>>();
        let src = buffer(&context, &data)?;
        let dst = buffer(&context, &[0; 64])?;

        let copy = queue.enqueue_copy_buffer(&src, &dst, 8, 16, 32, &[])?;
        let host = HostBuffer::new(64);
        let read = queue.enqueue_read_buffer(&dst, 0, 64, &host, &[copy.clone()])?;
        read.wait()?;

        assert_eq!(copy.status(), ExecutionStatus::Complete);
        let host = host.to_vec();
        assert_eq!(host[16..48], data[8..40]);
        assert!(host[..16].iter().all(|&x| x == 0));
        assert!(host[48..].iter().all(|&x| x == 0));
        Ok(())
    }

    #[test]
    fn test_copy_errors() -> Result<(), Box<dyn Error>> {
        let (runtime, context, queue) = setup()?;
        let src = buffer(&context, &[1; 64])?;
        let dst = buffer(&context, &[0; 32])?;
        let live = runtime.tracker().live();

        let overlap = queue.enqueue_copy_buffer(&src, &src, 0, 16, 32, &[]);
        assert_eq!(overlap.err(), Some(error::Error::MemCopyOverlap));
        let bounds = queue.enqueue_copy_buffer(&src, &dst, 0, 16, 32, &[]);
        assert_eq!(bounds.err(), Some(error::Error::InvalidValue));
        let bounds = queue.enqueue_copy_buffer(&src, &dst, 48, 0, 32, &[]);
        assert_eq!(bounds.err(), Some(error::Error::InvalidValue));
        let empty = queue.enqueue_copy_buffer(&src, &dst, 0, 0, 0, &[]);
        assert_eq!(empty.err(), Some(error::Error::InvalidValue));

        // disjoint ranges of one buffer are fine
        queue.enqueue_copy_buffer(&src, &src, 0, 32, 32, &[])?.wait()?;

        // rejected commands leave no event behind
        queue.finish()?;
        assert_eq!(runtime.tracker().live(), live);
        Ok(())
    }

    #[test]
    fn test_context_mismatch() -> Result<(), Box<dyn Error>> {
        let (runtime, context, queue) = setup()?;
        let other = runtime.create_context(runtime.devices())?;
        let src = buffer(&context, &[1; 16])?;
        let foreign = buffer(&other, &[0; 16])?;

        let result = queue.enqueue_copy_buffer(&src, &foreign, 0, 0, 16, &[]);
        assert_eq!(result.err(), Some(error::Error::InvalidContext));

        let event = other.create_user_event();
        let result = queue.enqueue_marker(&[event.event().clone()]);
        assert_eq!(result.err(), Some(error::Error::InvalidContext));
        Ok(())
    }

    #[test]
    fn test_in_order() -> Result<(), Box<dyn Error>> {
        let (_runtime, context, queue) = setup()?;
        let mem = buffer(&context, &[0; 4])?;
        let order = Arc::new(std::sync::Mutex::new(vec![]));
        let gate = context.create_user_event();

        // the first command waits on the gate, the rest only on the queue order
        let events = (0..4)
            .map(|index| {
                let order = order.clone();
                let wait = match index {
                    0 => vec![gate.event().clone()],
                    _ => vec![],
                };
                let function = move |_: &mut [Vec<u8>]| {
                    order.lock().expect("failed to lock").push(index);
                    Ok(())
                };
                queue.enqueue_native_kernel(function, &[mem.clone()], &wait)
            })
            .collect::<Result<Vec<_>, _>>()?;

        assert!(events.iter().all(|event| !event.is_terminal()));
        gate.set_status(Ok(()))?;
        queue.finish()?;

        assert!(
            events
                .iter()
                .all(|event| event.status() == ExecutionStatus::Complete)
        );
        assert_eq!(*order.lock().expect("failed to lock"), [0, 1, 2, 3]);
        Ok(())
    }

    #[test]
    fn test_out_of_order_marker() -> Result<(), Box<dyn Error>> {
        let (runtime, context, _) = setup()?;
        let properties = QueueProperties {
            out_of_order: true,
            profiling: true,
        };
        let queue = CommandQueue::new(&context, &runtime.devices()[0], properties)?;
        let gate = context.create_user_event();
        let mem = buffer(&context, &[0; 16])?;
        let fill = queue.enqueue_fill_buffer(&mem, &[7], 0, 16, &[gate.event().clone()])?;
        let marker = queue.enqueue_marker(&[])?;
        assert_eq!(marker.status(), ExecutionStatus::Queued);

        gate.set_status(Ok(()))?;
        marker.wait()?;
        assert_eq!(fill.status(), ExecutionStatus::Complete);

        let info = fill.profiling_info()?;
        assert!(info.queued <= info.submit);
        assert!(info.submit <= info.start);
        assert!(info.start <= info.end);
        Ok(())
    }

    #[test]
    fn test_rect_and_fill() -> Result<(), Box<dyn Error>> {
        let (_runtime, context, queue) = setup()?;
        let mem = buffer(&context, &[0; 64])?;

        let fill = queue.enqueue_fill_buffer(&mem, &[1, 2], 0, 64, &[])?;
        let result = queue.enqueue_fill_buffer(&mem, &[1, 2, 3], 0, 63, &[]);
        assert_eq!(result.err(), Some(error::Error::InvalidValue));

        // a 2x2 block of 0xff at (2, 1) of an 8-byte wide image
        let src = HostBuffer::from_slice(&[0xffu8; 4]);
        let rect = Rect::new(
            [2, 2, 1],
            RectLayout::default(),
            RectLayout::new([2, 1, 0], 8, 0),
        );
        queue.enqueue_write_buffer_rect(&mem, &src, rect, &[fill])?;

        let host = HostBuffer::new(64);
        queue.enqueue_read_buffer(&mem, 0, 64, &host, &[])?.wait()?;
        let host = host.to_vec();
        assert_eq!(host[..10], [1, 2, 1, 2, 1, 2, 1, 2, 1, 2]);
        assert_eq!(host[10..12], [0xff, 0xff]);
        assert_eq!(host[18..20], [0xff, 0xff]);
        assert_eq!(host[20..22], [1, 2]);

        // read the block back out
        let block = HostBuffer::new(4);
        let rect = Rect::new(
            [2, 2, 1],
            RectLayout::new([2, 1, 0], 8, 0),
            RectLayout::default(),
        );
        queue
            .enqueue_read_buffer_rect(&mem, &block, rect, &[])?
            .wait()?;
        assert_eq!(block.to_vec(), [0xff; 4]);
        Ok(())
    }

    #[test]
    fn test_rect_out_of_range() -> Result<(), Box<dyn Error>> {
        let (runtime, context, queue) = setup()?;
        let src = buffer(&context, &[0; 64])?;
        let dst = buffer(&context, &[0; 64])?;
        let live = runtime.tracker().live();

        let far = RectLayout::new([usize::MAX - 1, 0, 0], 0, 0);
        let rect = Rect::new([4, 1, 1], far, RectLayout::default());
        let result = queue.enqueue_copy_buffer_rect(&src, &dst, rect, &[]);
        assert_eq!(result.err(), Some(error::Error::InvalidValue));

        let tall = RectLayout::new([0, usize::MAX / 2, 0], 8, 0);
        let rect = Rect::new([4, 2, 1], RectLayout::default(), tall);
        let host = HostBuffer::from_slice(&[0u8; 8]);
        let result = queue.enqueue_write_buffer_rect(&dst, &host, rect, &[]);
        assert_eq!(result.err(), Some(error::Error::InvalidValue));

        assert_eq!(runtime.tracker().live(), live);
        Ok(())
    }

    #[test]
    fn test_map_unmap() -> Result<(), Box<dyn Error>> {
        let (_runtime, context, queue) = setup()?;
        let mem = buffer(&context, &[1, 2, 3, 4, 5, 6, 7, 8])?;

        let (event, mapped) = queue.enqueue_map_buffer(&mem, 4, 4, &[])?;
        event.wait()?;
        assert_eq!(mapped.data().to_vec(), [5, 6, 7, 8]);

        mapped.data().write().fill(0);
        queue.enqueue_unmap(&mapped, &[])?;

        let host = HostBuffer::new(8);
        queue.enqueue_read_buffer(&mem, 0, 8, &host, &[])?.wait()?;
        assert_eq!(host.to_vec(), [1, 2, 3, 4, 0, 0, 0, 0]);
        Ok(())
    }

    #[test]
    fn test_use_host_ptr() -> Result<(), Box<dyn Error>> {
        let (_runtime, context, queue) = setup()?;
        let host = HostBuffer::from_slice(&[0u8; 8]);
        let mem = context.create_buffer(MemFlags::USE_HOST_PTR, 8, Some(host.clone()))?;
        queue.enqueue_fill_buffer(&mem, &[9], 0, 8, &[])?.wait()?;
        assert_eq!(host.to_vec(), [9; 8]);
        Ok(())
    }

    #[test]
    fn test_failed_native() -> Result<(), Box<dyn Error>> {
        let (_runtime, context, queue) = setup()?;
        let mem = buffer(&context, &[0; 8])?;
        let calls = Arc::new(AtomicUsize::new(0));

        let failing = queue.enqueue_native_kernel(
            |_: &mut [Vec<u8>]| Err("boom".to_string()),
            &[mem.clone()],
            &[],
        )?;
        let counter = calls.clone();
        let dependent = queue.enqueue_native_kernel(
            move |_: &mut [Vec<u8>]| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            &[mem.clone()],
            &[failing.clone()],
        )?;

        assert_eq!(failing.wait(), Err(error::Error::ExecStatusErrorForEventsInWaitList));
        assert_eq!(
            failing.status(),
            ExecutionStatus::Failed(error::Error::ExecutionFailure)
        );
        assert_eq!(
            dependent.wait(),
            Err(error::Error::ExecStatusErrorForEventsInWaitList)
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        Ok(())
    }
}
