//! The host proxy thread (§4.C), grounded on
//! `original_source/src/proxy.cpp`'s `host_proxy_thread` / `ishmemi_proxy_init`
//! / `ishmemi_proxy_fini`: one OS thread per PE that polls its [`Ring`] in a
//! tight loop and services whatever the upcall table resolves each request
//! to, until told to exit.

use crate::dispatch::UpcallTable;
use crate::ring::{Ring, RingConsumer};
use crate::Engine;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

mod state {
    pub const RUNNING: u8 = 0;
    pub const EXITING: u8 = 1;
}

/// Handle to the spawned proxy thread. Dropping it does not stop the
/// thread — call [`Proxy::shutdown`] explicitly (mirrors
/// `ishmemi_proxy_fini`'s explicit join, not an implicit one on drop).
pub struct Proxy {
    state: Arc<AtomicU8>,
    handle: Option<JoinHandle<()>>,
}

impl Proxy {
    /// Spawn the proxy thread for `engine`'s ring. `engine` must already be
    /// fully constructed (heap mapped, topology built, runtime attached)
    /// since the proxy starts polling immediately.
    pub fn spawn(engine: Arc<Engine>, table: Arc<UpcallTable>) -> Self {
        let state = Arc::new(AtomicU8::new(state::RUNNING));
        let thread_state = state.clone();
        let spin_budget = engine.config().proxy_spin_budget();

        let handle = std::thread::Builder::new()
            .name(format!("ishmem-proxy-{}", engine.topology().my_pe()))
            .spawn(move || {
                let mut consumer = RingConsumer::new(engine.ring());
                let mut idle_spins = 0u32;
                while thread_state.load(Ordering::Acquire) != state::EXITING {
                    let serviced = consumer.poll(|req| table.dispatch(&engine, req));
                    if serviced {
                        idle_spins = 0;
                    } else {
                        std::hint::spin_loop();
                        idle_spins += 1;
                        if idle_spins >= spin_budget.max(1) {
                            std::thread::yield_now();
                            idle_spins = 0;
                        }
                    }
                }
            })
            .expect("failed to spawn ishmem proxy thread");

        Proxy { state, handle: Some(handle) }
    }

    /// Signal the proxy thread to exit and join it (`ishmemi_proxy_fini`).
    pub fn shutdown(&mut self) {
        self.state.store(state::EXITING, Ordering::Release);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.shutdown();
        }
    }
}

/// Submit `req` on `ring` and block for its completion, then free the slot.
/// The one blocking entry point every device-context RMA/AMO/barrier call
/// that misses its fast path funnels through (§4.B/§4.E/§4.F).
pub fn submit_and_wait(ring: &Ring, req: ishmem_wire::Request, spin_budget: u32) -> ishmem_wire::Completion {
    let sequence = ring.submit(req);
    let completion = ring.wait_completion(sequence, spin_budget);
    ring.free(sequence);
    completion
}
