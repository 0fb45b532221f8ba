//! Fiber configuration
//!
//! The default stack size is a named, runtime-overridable value:
//! initialized from `STRAND_STACK_SIZE` (bytes) on first use, 1 MiB
//! when unset, adjustable later via [`set_default_stack_size`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use strand_core::env_get;

/// Default stack size when `STRAND_STACK_SIZE` is unset: 1 MiB.
const FALLBACK_STACK_SIZE: usize = 1024 * 1024;

/// Floor for configured stack sizes. Below this the entry trampoline
/// and panic machinery cannot run safely.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

fn cell() -> &'static AtomicUsize {
    static DEFAULT_STACK_SIZE: OnceLock<AtomicUsize> = OnceLock::new();
    DEFAULT_STACK_SIZE.get_or_init(|| {
        let size: usize = env_get("STRAND_STACK_SIZE", FALLBACK_STACK_SIZE);
        AtomicUsize::new(size.max(MIN_STACK_SIZE))
    })
}

/// Stack size used by `Fiber::new` and by `with_stack_size(_, 0)`.
#[inline]
pub fn default_stack_size() -> usize {
    cell().load(Ordering::Relaxed)
}

/// Override the default stack size at runtime. Values below
/// [`MIN_STACK_SIZE`] are clamped up.
pub fn set_default_stack_size(size: usize) {
    cell().store(size.max(MIN_STACK_SIZE), Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_and_override() {
        let initial = default_stack_size();
        assert!(initial >= MIN_STACK_SIZE);

        set_default_stack_size(2 * 1024 * 1024);
        assert_eq!(default_stack_size(), 2 * 1024 * 1024);

        // Undersized requests clamp to the floor.
        set_default_stack_size(1);
        assert_eq!(default_stack_size(), MIN_STACK_SIZE);

        set_default_stack_size(initial);
    }
}
