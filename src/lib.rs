//! Conservative, thread-local mark-and-sweep garbage collection over the
//! system allocator.
//!
//! This crate implements a small, self-contained GC that stands in for
//! manual `malloc`/`free`. The pipeline is:
//!
//! 1) Allocation
//!    - `Collector::malloc`/`calloc`/`realloc` wrap the system allocator.
//!    - Every block vended is filed in the allocation index, an open hash
//!      table keyed by base address with prime bucket counts and
//!      arena-backed chains.
//!
//! 2) Root discovery
//!    - ROOT-tagged records (static allocations, `make_static`).
//!    - The machine stack between the deepest frame and the bottom-of-stack
//!      sentinel captured at `start`, with the register file spilled into
//!      the scanned range first.
//!
//! 3) Mark
//!    - Conservative, byte-granular: any word whose bit pattern equals a
//!      managed base address marks that block, and the block's contents are
//!      queued on an explicit work stack for further tracing.
//!
//! 4) Sweep
//!    - Records with neither MARK nor ROOT are removed from the index,
//!      finalized, and their blocks returned to the system allocator.
//!
//! Key ideas:
//! - Index: base address -> record, separate chaining over a record arena.
//! - Tags: ROOT pins a block across cycles; MARK is transient per cycle.
//! - Sweep limit: when the index holds that many records, the next
//!   allocation runs a cycle first (unless the collector is paused).
//! - Conservatism: the scanner has no type information, so any pointer-sized
//!   bit pattern can retain a block; it can never free a reachable one.
//!
//! The collector is strictly single-mutator. Per-thread instances are fine;
//! sharing one across threads is not. See `stack_scan` for the platform
//! preconditions (downward stack growth, word-sized pointers).

pub mod allocation_index;
pub mod collector;
pub mod ffi;
mod primes;
mod stack_scan;

pub use allocation_index::{
    AllocRecord, AllocationIndex, Finalizer, RecordIdx, RemovedRecord, TAG_MARK, TAG_NONE,
    TAG_ROOT,
};
pub use collector::{Collector, CollectorStats};
