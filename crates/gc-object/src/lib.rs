//! Garbage-collected object allocation with chained finalizers.
//!
//! `gc-object` is an allocation layer over a conservative, non-moving
//! mark-sweep collector. Objects are allocated under a [`Strategy`]:
//!
//! - **Collected**: reclaimed once unreachable; contents are scanned.
//! - **`PointerFree`**: reclaimed once unreachable; contents are never scanned.
//! - **Uncollectable**: acts as a root until explicitly freed.
//! - **`RawPlacement`**: flat array storage without per-element finalizers.
//!
//! Every object with drop glue gets a finalizer keyed to the base address of
//! its block. Several registrations on the same block chain, and the chain
//! runs newest first, exactly once, either when the block becomes
//! unreachable or never (if the object is deleted explicitly first).
//!
//! # Quick Start
//!
//! ```
//! use gc_object::{Allocator, GcConfig, MarkSweep, Strategy};
//!
//! let config = GcConfig::builder().scan_stack(false).build().unwrap();
//! let alloc = Allocator::new(MarkSweep::new(config));
//!
//! let obj = alloc.new_object(String::from("hello"), Strategy::Collected).unwrap();
//! let root = alloc.root(obj);
//! alloc.collect();
//! assert_eq!(&*root, "hello");
//! ```
//!
//! # Thread Safety
//!
//! The allocator and collector are `Send + Sync`. With stack scanning on,
//! a collection parks every registered thread and scans its stack, so
//! objects held only in another thread's locals stay alive. Threads
//! register on first use of an allocator; a thread that only receives
//! objects from others calls [`register_current_thread`]. Thread
//! suspension is available on Linux; elsewhere objects used by other
//! threads must be reachable from a root, an uncollectable block, or a
//! root region.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod allocator;
mod collector;
mod config;
mod error;
mod finalize;
mod gc;
mod metrics;
mod object;
mod roots;
mod scan;
mod stack;
mod threads;
#[cfg(feature = "tracing")]
mod tracing;

/// `BiBOP` memory management internals.
///
/// This module is public for testing and advanced use cases.
/// Most users should go through [`Allocator`].
pub mod heap;

// Re-export public API
pub use allocator::{global, Allocator, Strategy};
pub use collector::{Collector, MarkSweep};
pub use config::{GcConfig, GcConfigBuilder};
pub use error::{AllocError, AllocFailure, ConfigError};
pub use finalize::{invoke_chain, is_finalizing, Finalizer, FinalizerProc, Registry};
pub use gc::{default_collect_condition, CollectCondition, CollectInfo};
pub use heap::BlockKind;
pub use metrics::GcMetrics;
pub use object::Obj;
pub use roots::Root;
pub use threads::{is_current_thread_registered, register_current_thread};
