//! Host entry points with nullable handles, reporting a [`Status`] instead of a `Result`.

use super::{
    command::CommandKind,
    error::{Error, Status},
    event::Event,
    mem::MemObject,
    queue::CommandQueue,
};

pub use super::queue::WaitList;

/// Copies `size` bytes from `src` at `src_offset` to `dst` at `dst_offset`.
///
/// No event is returned unless the status is [`Status::Success`].
pub fn enqueue_copy_buffer(
    queue: Option<&CommandQueue>,
    src: Option<&MemObject>,
    dst: Option<&MemObject>,
    src_offset: usize,
    dst_offset: usize,
    size: usize,
    wait: WaitList,
) -> (Status, Option<Event>) {
    let result = copy_buffer(queue, src, dst, src_offset, dst_offset, size, wait);
    match result {
        Ok(event) => (Status::Success, Some(event)),
        Err(err) => {
            log::debug!("copy buffer rejected: {err}");
            (err.into(), None)
        }
    }
}

fn copy_buffer(
    queue: Option<&CommandQueue>,
    src: Option<&MemObject>,
    dst: Option<&MemObject>,
    src_offset: usize,
    dst_offset: usize,
    size: usize,
    wait: WaitList,
) -> Result<Event, Error> {
    let queue = queue.ok_or(Error::InvalidCommandQueue)?;
    let (Some(src), Some(dst)) = (src, dst) else {
        return Err(Error::InvalidMemObject);
    };
    let kind = CommandKind::CopyBuffer {
        src: src.clone(),
        src_offset,
        dst: dst.clone(),
        dst_offset,
        size,
    };
    queue.enqueue_with(kind, wait)
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{WaitList, enqueue_copy_buffer};
    use crate::loom::{
        device::HostBuilder,
        error::{self, Status},
        mem::{HostBuffer, MemFlags},
        queue::CommandQueue,
        runtime::RuntimeBuilder,
    };

    #[test]
    fn test_enqueue_copy_buffer() -> Result<(), Box<dyn Error>> {
        let runtime = RuntimeBuilder::new()
            .driver(HostBuilder::new().memory(4096).build())
            .build()?;
        let context = runtime.create_context(runtime.devices())?;
        let queue = CommandQueue::new(&context, &runtime.devices()[0], Default::default())?;
        let host = HostBuffer::from_slice(&[3u8; 32]);
        let src = context.create_buffer(MemFlags::COPY_HOST_PTR, 32, Some(host))?;
        let dst = context.create_buffer(MemFlags::READ_WRITE, 32, None)?;

        let (status, event) =
            enqueue_copy_buffer(None, Some(&src), Some(&dst), 0, 0, 32, WaitList::NONE);
        assert_eq!(status, Status::Error(error::Error::InvalidCommandQueue));
        assert!(event.is_none());

        let (status, _) =
            enqueue_copy_buffer(Some(&queue), None, Some(&dst), 0, 0, 32, WaitList::NONE);
        assert_eq!(status.code(), -38);

        let (status, _) = enqueue_copy_buffer(
            Some(&queue),
            Some(&src),
            Some(&dst),
            0,
            0,
            32,
            WaitList::new(1, None),
        );
        assert_eq!(status, Status::Error(error::Error::InvalidEventWaitList));

        let (status, event) =
            enqueue_copy_buffer(Some(&queue), Some(&src), Some(&dst), 0, 0, 32, WaitList::NONE);
        assert!(status.is_success());
        let event = event.ok_or("missing event")?;

        let wait = [event];
        let (status, copy) = enqueue_copy_buffer(
            Some(&queue),
            Some(&dst),
            Some(&src),
            0,
            16,
            16,
            WaitList::new(1, Some(&wait)),
        );
        assert_eq!(status, Status::Success);
        copy.ok_or("missing event")?.wait()?;

        let host = HostBuffer::new(32);
        queue.enqueue_read_buffer(&dst, 0, 32, &host, &[])?.wait()?;
        assert_eq!(host.to_vec(), [3; 32]);
        Ok(())
    }
}
