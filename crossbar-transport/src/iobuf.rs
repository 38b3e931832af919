//! Per-thread reusable I/O buffer
//!
//! Socket I/O is performed by a fixed set of threads (the workers, or the
//! selector threads when no worker pool is configured), so one lazily
//! allocated buffer per thread is enough to serve every connection without
//! allocating on the hot path. A configured size of 0 disables the buffer
//! entirely; callers then fall back to gathered writes.

use std::cell::RefCell;

thread_local! {
    static DIRECT_BUFFER: RefCell<Vec<u8>> = const { RefCell::new(Vec::new()) };
}

/// Run `f` with this thread's reusable buffer of `bytes` length.
///
/// The buffer is allocated on first use and grown if a larger size is
/// requested later; its contents are unspecified between calls. `f` receives
/// `None` when `bytes` is 0.
pub fn with_direct_buffer<R>(bytes: usize, f: impl FnOnce(Option<&mut [u8]>) -> R) -> R {
    if bytes == 0 {
        return f(None);
    }
    DIRECT_BUFFER.with(|cell| {
        let mut buf = cell.borrow_mut();
        if buf.len() < bytes {
            buf.resize(bytes, 0);
        }
        f(Some(&mut buf[..bytes]))
    })
}
