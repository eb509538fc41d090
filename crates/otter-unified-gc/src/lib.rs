//! # Otter Unified GC
//!
//! Stop-the-world tracing collection coordinated across every heap of a VM
//! and, optionally, with a companion VM that shares object references.
//!
//! ## Design
//!
//! - **Heaps**: one local heap per managed thread plus a shared heap
//! - **Safepoints**: threads park at polls; the coordinator suspends all of them
//! - **Marking**: per-heap markers over a shared work-stealing pool
//! - **Cross-VM**: XRef edges are handed to the companion; both collectors
//!   reconcile until neither has work left
//! - **Interruption**: an episode can be stopped cooperatively and retried

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod config;
pub mod cross_vm;
pub mod daemon;
pub mod error;
pub mod heap;
pub mod interrupt;
pub mod mark_stack;
pub mod marker;
pub mod object;
pub mod thread;
pub mod unified;
pub mod value;
pub mod vm;

pub use config::GcConfig;
pub use cross_vm::{CrossVmOperator, EcmaVmInterface, QuiescencePredicate, StsVmInterface};
pub use daemon::{DaemonTask, DaemonThread};
pub use error::{GcError, GcResult, fatal};
pub use heap::{HeapKind, HeapRegistry, LocalHeap, RootGuard, RunningTask, SweepStats};
pub use interrupt::InterruptToken;
pub use marker::UnifiedGcMarker;
pub use object::{GcHeader, GcRef, GcTraceable, HeapObject, MarkColor, ObjectClass, RecordObject, XRefObject};
pub use thread::{JsThread, ManagedScope, SuspendAllScope, ThreadId, ThreadRegistry, ThreadState};
pub use unified::{CollectionStats, UnifiedGc, UnifiedGcOutcome, UnifiedGcPhase, UnifiedGcStats};
pub use value::{HeapId, ObjectRef, TaggedValue};
pub use vm::EcmaVm;
