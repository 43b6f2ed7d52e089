//! C ABI surface over a process-global collector.
//!
//! Single-threaded embeddings get one implicit collector: initialize it with
//! `gc_start`, route every allocation through the `gc_*` entry points, and
//! tear it down with `gc_stop`. Entry points called before `gc_start` (or
//! after `gc_stop`) are no-ops that return null or zero.
//!
//! The instance lives behind a Mutex so the global is sound to touch from
//! Rust's perspective; the collector itself still assumes a single mutator
//! thread, because collection scans the stack of whichever thread calls in.

use std::ffi::{CStr, c_char};
use std::sync::{Mutex, OnceLock};

use crate::allocation_index::Finalizer;
use crate::collector::Collector;

fn with_gc<R>(f: impl FnOnce(&mut Option<Collector>) -> R) -> R {
    static INSTANCE: OnceLock<Mutex<Option<Collector>>> = OnceLock::new();
    let gc = INSTANCE.get_or_init(|| Mutex::new(None));
    let mut guard = gc.lock().expect("gc mutex");
    f(&mut guard)
}

/// Start the global collector with default tuning. `bos` must point into a
/// stack frame of the calling thread that outlives every collection.
#[unsafe(no_mangle)]
pub extern "C" fn gc_start(bos: *const u8) {
    with_gc(|gc| *gc = Some(unsafe { Collector::start(bos) }));
}

/// Start the global collector with explicit tuning.
#[unsafe(no_mangle)]
pub extern "C" fn gc_start_ext(
    bos: *const u8,
    initial_capacity: usize,
    min_capacity: usize,
    downsize_factor: f64,
    upsize_factor: f64,
    sweep_factor: f64,
) {
    with_gc(|gc| {
        *gc = Some(unsafe {
            Collector::start_ext(
                bos,
                initial_capacity,
                min_capacity,
                downsize_factor,
                upsize_factor,
                sweep_factor,
            )
        })
    });
}

/// Sweep every remaining block, shut the global collector down, and return
/// the reclaimed byte total.
#[unsafe(no_mangle)]
pub extern "C" fn gc_stop() -> usize {
    with_gc(|gc| gc.take().map_or(0, Collector::stop))
}

#[unsafe(no_mangle)]
pub extern "C" fn gc_pause() {
    with_gc(|gc| {
        if let Some(gc) = gc {
            gc.pause();
        }
    });
}

#[unsafe(no_mangle)]
pub extern "C" fn gc_resume() {
    with_gc(|gc| {
        if let Some(gc) = gc {
            gc.resume();
        }
    });
}

/// Run one full mark-and-sweep cycle; returns the bytes reclaimed.
#[unsafe(no_mangle)]
pub extern "C" fn gc_run() -> usize {
    with_gc(|gc| gc.as_mut().map_or(0, Collector::run))
}

#[unsafe(no_mangle)]
pub extern "C" fn gc_malloc(size: usize) -> *mut u8 {
    with_gc(|gc| gc.as_mut().map_or(std::ptr::null_mut(), |gc| gc.malloc(size)))
}

#[unsafe(no_mangle)]
pub extern "C" fn gc_malloc_ext(size: usize, finalizer: Option<Finalizer>) -> *mut u8 {
    with_gc(|gc| {
        gc.as_mut()
            .map_or(std::ptr::null_mut(), |gc| gc.malloc_ext(size, finalizer))
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn gc_malloc_static(size: usize, finalizer: Option<Finalizer>) -> *mut u8 {
    with_gc(|gc| {
        gc.as_mut()
            .map_or(std::ptr::null_mut(), |gc| gc.malloc_static(size, finalizer))
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn gc_calloc(count: usize, size: usize) -> *mut u8 {
    with_gc(|gc| {
        gc.as_mut()
            .map_or(std::ptr::null_mut(), |gc| gc.calloc(count, size))
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn gc_calloc_ext(count: usize, size: usize, finalizer: Option<Finalizer>) -> *mut u8 {
    with_gc(|gc| {
        gc.as_mut().map_or(std::ptr::null_mut(), |gc| {
            gc.calloc_ext(count, size, finalizer)
        })
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn gc_realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    with_gc(|gc| {
        gc.as_mut()
            .map_or(std::ptr::null_mut(), |gc| gc.realloc(ptr, size))
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn gc_free(ptr: *mut u8) {
    with_gc(|gc| {
        if let Some(gc) = gc {
            gc.free(ptr);
        }
    });
}

#[unsafe(no_mangle)]
pub extern "C" fn gc_make_static(ptr: *mut u8) {
    with_gc(|gc| {
        if let Some(gc) = gc {
            gc.make_static(ptr);
        }
    });
}

/// Managed copy of the NUL-terminated string `s`, terminator included.
#[unsafe(no_mangle)]
pub extern "C" fn gc_strdup(s: *const c_char) -> *mut c_char {
    if s.is_null() {
        return std::ptr::null_mut();
    }
    let s = unsafe { CStr::from_ptr(s) };
    with_gc(|gc| {
        gc.as_mut()
            .map_or(std::ptr::null_mut(), |gc| gc.strdup(s).cast())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test exercises the whole surface: the global instance is process
    // state, and the harness runs tests concurrently.
    #[test]
    fn global_collector_round_trip() {
        assert!(gc_malloc(8).is_null());
        assert_eq!(gc_run(), 0);
        assert_eq!(gc_stop(), 0);

        let bos = 0usize;
        gc_start(&bos as *const usize as *const u8);

        let a = gc_malloc_static(8, None);
        let b = gc_malloc_static(8, None);
        assert!(!a.is_null());
        assert!(!b.is_null());

        let copy = gc_strdup(c"abc".as_ptr());
        assert!(!copy.is_null());
        assert_eq!(unsafe { CStr::from_ptr(copy) }.to_bytes(), b"abc");
        gc_free(copy.cast());

        gc_pause();
        gc_resume();
        gc_make_static(a);

        // Rooted blocks ride out an explicit cycle.
        gc_run();
        assert_eq!(gc_stop(), 16);

        assert!(gc_realloc(std::ptr::null_mut(), 4).is_null());
    }
}
