//! Architecture-specific context switching
//!
//! Saves and restores the callee-saved register set during voluntary
//! fiber switches. Only voluntary switches exist here: a fiber gives
//! up control at an explicit yield, so caller-saved registers are
//! already dead at every switch point.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use x86_64::{context_switch, init_context, SavedRegs};
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use aarch64::{context_switch, init_context, SavedRegs};
    } else {
        compile_error!("strand-fiber: unsupported target architecture");
    }
}
