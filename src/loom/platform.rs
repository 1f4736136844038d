use std::{
    future::Future,
    sync::LazyLock,
    thread::JoinHandle,
    time::{Instant, SystemTime, UNIX_EPOCH},
};

/// Runs `future` to completion on a dedicated, named worker thread.
#[inline]
pub fn spawn<O, F>(name: impl Into<String>, future: F) -> std::io::Result<JoinHandle<O>>
where
    O: Send + 'static,
    F: Future<Output = O> + Send + 'static,
{
    std::thread::Builder::new()
        .name(name.into())
        .spawn(move || futures::executor::block_on(future))
}

static EPOCH: LazyLock<(Instant, u64)> = LazyLock::new(|| {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_nanos() as u64);
    (Instant::now(), nanos)
});

/// Monotonic host timestamp in nanoseconds, anchored at wall-clock time of first use.
#[inline]
pub fn timestamp() -> u64 {
    let (instant, nanos) = *EPOCH;
    nanos + instant.elapsed().as_nanos() as u64
}
