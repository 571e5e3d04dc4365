//! The simulated device execution context (SPEC_FULL §1 "Host-only reference
//! implementation").
//!
//! Real ISHMEM distinguishes "running on the GPU" from "running on the
//! host" at compile time (separate SYCL entry points). Without a vendor GPU
//! toolchain available as a dependency, this crate models the same
//! distinction as a per-thread runtime flag: a thread that calls
//! [`DeviceContext::enter`] is "inside a kernel" for as long as the guard
//! lives, and the engine's fast-path/ring code consults
//! [`DeviceContext::is_active`] exactly where spec.md says a behavior is
//! "on-device" vs. "host-mainline".

use std::cell::Cell;

thread_local! {
    static ACTIVE: Cell<bool> = const { Cell::new(false) };
}

/// RAII guard marking the current thread as executing inside a simulated
/// device kernel. Re-entrant calls to [`DeviceContext::enter`] on the same
/// thread are rejected with a panic — real kernels cannot nest launches on
/// one lane either.
pub struct DeviceContext {
    _private: (),
}

impl DeviceContext {
    /// Enter device context on the calling thread. Dropping the guard exits
    /// it again.
    pub fn enter() -> Self {
        ACTIVE.with(|a| {
            assert!(!a.get(), "DeviceContext::enter called while already active on this thread");
            a.set(true);
        });
        DeviceContext { _private: () }
    }

    /// Whether the calling thread is currently inside a device context.
    pub fn is_active() -> bool {
        ACTIVE.with(|a| a.get())
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        ACTIVE.with(|a| a.set(false));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enter_and_drop_toggles_flag() {
        assert!(!DeviceContext::is_active());
        {
            let _g = DeviceContext::enter();
            assert!(DeviceContext::is_active());
        }
        assert!(!DeviceContext::is_active());
    }

    #[test]
    #[should_panic(expected = "already active")]
    fn nested_enter_panics() {
        let _g1 = DeviceContext::enter();
        let _g2 = DeviceContext::enter();
    }
}
