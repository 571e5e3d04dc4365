//! Lock-free request ring (§4.B), grounded on the teacher's
//! `runtime::sequencer` module (`SequencerConsumer`, `OrderingValidator`,
//! `slot_flags`): a power-of-two array of slots that many producers reserve
//! tickets into and a single consumer drains in strict sequence order.
//!
//! The teacher's ring is read-only from the consumer's perspective (a
//! perf-event stream with no reply channel); this ring additionally writes
//! a paired [`Completion`] record per slot, which the teacher's domain has
//! no equivalent of, so that half is grounded on
//! `examples/original_source/src/proxy.cpp`'s `ishmemi_cpu_ring::poll`
//! instead (reserve a slot, publish with a release fence, have the consumer
//! match on `sequence`, dispatch, then publish the completion).

use ishmem_wire::{lock_state, Completion, Op, Request, RING_MASK, RING_SIZE};
use std::cell::UnsafeCell;
use std::sync::atomic::{fence, AtomicU16, Ordering};

struct Slot<T>(UnsafeCell<T>);

// SAFETY: Access to a given slot is only ever concurrent between the one
// producer that reserved it and the one consumer thread; the sequence
// number / completion lock protocol (§3 Invariants 2 and 5) is what
// arbitrates between them, not the ring's own synchronization.
unsafe impl<T> Sync for Slot<T> {}

/// The ring described in §3/§4.B/§6: `RING_SIZE` request slots and a paired
/// array of completion slots. Owned by one PE; every device-context
/// producer on that PE shares it, and exactly one host proxy thread
/// consumes it.
pub struct Ring {
    requests: Vec<Slot<Request>>,
    completions: Vec<Slot<Completion>>,
    /// Next sequence number a producer will reserve (monotonic, wraps via
    /// the `u16` tag, not via this counter — see `RING_MASK`/`sequence`).
    next_reserve: AtomicU16,
}

impl Ring {
    pub fn new() -> Self {
        let requests = (0..RING_SIZE).map(|_| Slot(UnsafeCell::new(Request::new(Op::Nop, ishmem_wire::ElemType::None, -1)))).collect();
        // Every slot starts free (no prior occupant to wait on); only once
        // a completion has been posted does a slot become `LOCKED` until
        // its producer frees it again.
        let completions = (0..RING_SIZE)
            .map(|_| {
                let mut c = Completion::pending(0);
                c.lock = lock_state::FREE;
                Slot(UnsafeCell::new(c))
            })
            .collect();
        Ring {
            requests,
            completions,
            next_reserve: AtomicU16::new(0),
        }
    }

    fn slot_index(sequence: u16) -> usize {
        (sequence & RING_MASK) as usize
    }

    /// Producer side: reserve the next slot, wait for the device to have
    /// freed its previous occupant (§3 Invariant 2), publish `req` with a
    /// release fence, and return the reserved sequence number so the caller
    /// can poll the matching completion.
    ///
    /// Reserving a unique ticket per producer via `fetch_add` is what lets
    /// many concurrent device threads share one ring without a lock (§9
    /// "Ring vs. queue choice").
    pub fn submit(&self, mut req: Request) -> u16 {
        let sequence = self.next_reserve.fetch_add(1, Ordering::Relaxed);
        let idx = Self::slot_index(sequence);

        // Wait for a prior lap's completion on this slot to be freed by its
        // producer before reusing the slot (ring overrun is otherwise
        // unreachable by construction, per §7).
        while unsafe { (*self.completions[idx].0.get()).lock } == lock_state::LOCKED {
            std::hint::spin_loop();
        }

        req.sequence = sequence;
        unsafe { *self.requests[idx].0.get() = req };
        fence(Ordering::Release);
        sequence
    }

    /// Read the completion for `sequence` (caller must have submitted it).
    /// Returns `None` until the proxy has written a result.
    pub fn try_completion(&self, sequence: u16) -> Option<Completion> {
        let idx = Self::slot_index(sequence);
        let comp = unsafe { *self.completions[idx].0.get() };
        if comp.sequence == sequence {
            fence(Ordering::Acquire);
            Some(comp)
        } else {
            None
        }
    }

    /// Block until `sequence`'s completion is posted, spinning with the
    /// configured burst before yielding (mirrors `wait_until`'s discipline,
    /// §5 "Suspension / blocking points").
    pub fn wait_completion(&self, sequence: u16, spin_budget: u32) -> Completion {
        let mut spins = 0u32;
        loop {
            if let Some(c) = self.try_completion(sequence) {
                return c;
            }
            std::hint::spin_loop();
            spins += 1;
            if spins >= spin_budget.max(1) {
                std::thread::yield_now();
                spins = 0;
            }
        }
    }

    /// Producer side: release a slot back to the ring once its completion
    /// has been observed (`lock = 0`, §3's "Completion").
    pub fn free(&self, sequence: u16) {
        let idx = Self::slot_index(sequence);
        unsafe { (*self.completions[idx].0.get()).lock = lock_state::FREE };
    }
}

impl Default for Ring {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumer side of the ring, owned exclusively by the host proxy thread
/// (§4.C). Polls in strict sequence order, exactly like the teacher's
/// `SequencerConsumer::poll_batch` walking `cursor`/`ticket_id`.
pub struct RingConsumer<'a> {
    ring: &'a Ring,
    next_receive: u16,
}

impl<'a> RingConsumer<'a> {
    pub fn new(ring: &'a Ring) -> Self {
        RingConsumer {
            ring,
            next_receive: 0,
        }
    }

    /// Poll once. If the slot at `next_receive` holds a matching request,
    /// copy it out, mark its completion slot pending, invoke `dispatch` to
    /// get the result, publish the completion, and advance. Returns `true`
    /// if a request was serviced.
    pub fn poll(&mut self, dispatch: impl FnOnce(&Request) -> Completion) -> bool {
        let idx = Ring::slot_index(self.next_receive);
        let req = unsafe { *self.ring.requests[idx].0.get() };
        if req.sequence != self.next_receive {
            return false;
        }
        fence(Ordering::Acquire);

        unsafe {
            *self.ring.completions[idx].0.get() = Completion::pending(self.next_receive);
        }

        let mut comp = dispatch(&req);
        comp.sequence = self.next_receive;
        comp.lock = lock_state::LOCKED;
        fence(Ordering::Release);
        unsafe {
            *self.ring.completions[idx].0.get() = comp;
        }

        self.next_receive = self.next_receive.wrapping_add(1);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ishmem_wire::ElemType;

    #[test]
    fn submit_then_poll_round_trips() {
        let ring = Ring::new();
        let req = Request::new(Op::Put, ElemType::Uint32, 1);
        let seq = ring.submit(req);

        let mut consumer = RingConsumer::new(&ring);
        let serviced = consumer.poll(|r| {
            assert_eq!(r.op().unwrap(), Op::Put);
            let mut c = Completion::pending(r.sequence);
            c.set_status(0);
            c
        });
        assert!(serviced);

        let comp = ring.try_completion(seq).expect("completion should be posted");
        assert_eq!(comp.status(), 0);
        ring.free(seq);
    }

    #[test]
    fn poll_on_empty_ring_does_nothing() {
        let ring = Ring::new();
        let mut consumer = RingConsumer::new(&ring);
        assert!(!consumer.poll(|_| Completion::pending(0)));
    }

    #[test]
    fn sequence_numbers_increase_in_submission_order() {
        let ring = Ring::new();
        let s0 = ring.submit(Request::new(Op::Nop, ElemType::None, -1));
        let s1 = ring.submit(Request::new(Op::Nop, ElemType::None, -1));
        assert_eq!(s1, s0.wrapping_add(1));
    }
}
