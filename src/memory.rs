//! Allocation accounting and the memory-limit observer.
//!
//! Rust exposes no ambient heap statistics, so the observer samples a
//! process-wide counter fed by [CountingAllocator]; a host opts in
//! with:
//!
//! ```ignore
//! #[global_allocator]
//! static ALLOC: moonrise::memory::CountingAllocator = moonrise::memory::CountingAllocator;
//! ```
//!
//! Without it the counter stays at zero and a configured limit never
//! trips.

use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

static ALLOCATED: AtomicUsize = AtomicUsize::new(0);

/// System allocator wrapper that keeps a live-bytes counter.
pub struct CountingAllocator;

unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc(layout);
        if !ptr.is_null() {
            ALLOCATED.fetch_add(layout.size(), Ordering::Relaxed);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout);
        ALLOCATED.fetch_sub(layout.size(), Ordering::Relaxed);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = System.realloc(ptr, layout, new_size);
        if !new_ptr.is_null() {
            ALLOCATED.fetch_add(new_size, Ordering::Relaxed);
            ALLOCATED.fetch_sub(layout.size(), Ordering::Relaxed);
        }
        new_ptr
    }
}

/// Live tracked heap bytes.
pub fn allocated_bytes() -> usize {
    ALLOCATED.load(Ordering::Relaxed)
}

const SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

/// Starts the observer thread: samples the counter every ~100 ms and
/// terminates the process once `limit` bytes are exceeded. The thread
/// exits when `stop` is set.
pub(crate) fn spawn_observer(limit: usize, stop: Arc<AtomicBool>) {
    std::thread::spawn(move || {
        while !stop.load(Ordering::Relaxed) {
            let used = allocated_bytes();
            if used >= limit {
                tracing::error!(used, limit, "memory limit exceeded");
                eprintln!("out of memory");
                std::process::exit(3);
            }
            std::thread::sleep(SAMPLE_INTERVAL);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observer_stops_on_signal() {
        let stop = Arc::new(AtomicBool::new(false));
        spawn_observer(usize::MAX, stop.clone());
        stop.store(true, Ordering::Relaxed);
        // give the observer a beat to wind down; the real assertion is
        // that the process is still alive
        std::thread::sleep(Duration::from_millis(20));
    }
}
