//! # strand-fiber
//!
//! Stackful execution contexts (fibers) with explicit resume/yield
//! semantics, cooperatively scheduled within one OS thread.
//!
//! A fiber owns its call stack and saved processor state. Resuming a
//! fiber suspends the caller until the fiber yields back or
//! terminates; a fault inside a fiber's entry callback is contained at
//! the fiber boundary and never unwinds into the resumer.
//!
//! ```ignore
//! use strand_fiber::Fiber;
//!
//! let fiber = Fiber::new(|| {
//!     // runs on its own stack
//!     Fiber::yield_to_ready();
//!     // resumed again later
//! });
//! fiber.resume(); // runs until the yield
//! fiber.resume(); // runs to completion
//! assert!(fiber.state().is_finished());
//! ```
//!
//! ## Modules
//!
//! - `arch` - Architecture-specific register save/restore
//! - `stack` - Pluggable stack allocation (malloc, mmap + guard page)
//! - `fiber` - The `Fiber` type and its state machine
//! - `tls` - Per-thread current/root context
//! - `config` - Runtime-overridable defaults

pub mod arch;
pub mod config;
pub mod fiber;
pub mod stack;
pub(crate) mod tls;

pub use config::{default_stack_size, set_default_stack_size, MIN_STACK_SIZE};
pub use fiber::Fiber;
pub use stack::{MallocStack, MmapStack, Stack, StackAllocator};

// Re-export the core vocabulary used in this crate's signatures.
pub use strand_core::{FiberId, FiberState};
