//! Atomic memory operations (§4.F).
//!
//! Intra-node fast path casts the target heap offset straight to a
//! `std::sync::atomic` type at `Ordering::SeqCst` ("Rust's atomics are
//! always at least as strong as the spec's 'system scope'", SPEC_FULL
//! §4.F) — no separate scope parameter is threaded through. Off-node goes
//! through `Runtime::proxy_amo`, which calls back into [`apply_raw`] on the
//! target's side (see `runtime::loopback`/`runtime::shm`), so there is only
//! one copy of the per-width read-modify-write logic.

use crate::error::{IshmemError, Result};
use crate::heap::{SymmetricHeap, Topology};
use crate::runtime::{AmoKind, Runtime};
use ishmem_wire::ElemType;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};

fn apply_u8(ptr: *mut u8, op: AmoKind, value: u8, cond: Option<u8>) -> u8 {
    let a = unsafe { &*(ptr as *const AtomicU8) };
    match op {
        AmoKind::Fetch => a.load(Ordering::SeqCst),
        AmoKind::Set | AmoKind::Swap => a.swap(value, Ordering::SeqCst),
        AmoKind::Inc => a.fetch_add(1, Ordering::SeqCst),
        AmoKind::Add => a.fetch_add(value, Ordering::SeqCst),
        AmoKind::And => a.fetch_and(value, Ordering::SeqCst),
        AmoKind::Or => a.fetch_or(value, Ordering::SeqCst),
        AmoKind::Xor => a.fetch_xor(value, Ordering::SeqCst),
        AmoKind::CompareSwap => {
            let expected = cond.unwrap_or(0);
            a.compare_exchange(expected, value, Ordering::SeqCst, Ordering::SeqCst).unwrap_or_else(|v| v)
        }
    }
}

fn apply_u16(ptr: *mut u8, op: AmoKind, value: u16, cond: Option<u16>) -> u16 {
    let a = unsafe { &*(ptr as *const AtomicU16) };
    match op {
        AmoKind::Fetch => a.load(Ordering::SeqCst),
        AmoKind::Set | AmoKind::Swap => a.swap(value, Ordering::SeqCst),
        AmoKind::Inc => a.fetch_add(1, Ordering::SeqCst),
        AmoKind::Add => a.fetch_add(value, Ordering::SeqCst),
        AmoKind::And => a.fetch_and(value, Ordering::SeqCst),
        AmoKind::Or => a.fetch_or(value, Ordering::SeqCst),
        AmoKind::Xor => a.fetch_xor(value, Ordering::SeqCst),
        AmoKind::CompareSwap => {
            let expected = cond.unwrap_or(0);
            a.compare_exchange(expected, value, Ordering::SeqCst, Ordering::SeqCst).unwrap_or_else(|v| v)
        }
    }
}

fn apply_u32(ptr: *mut u8, op: AmoKind, value: u32, cond: Option<u32>) -> u32 {
    let a = unsafe { &*(ptr as *const AtomicU32) };
    match op {
        AmoKind::Fetch => a.load(Ordering::SeqCst),
        AmoKind::Set | AmoKind::Swap => a.swap(value, Ordering::SeqCst),
        AmoKind::Inc => a.fetch_add(1, Ordering::SeqCst),
        AmoKind::Add => a.fetch_add(value, Ordering::SeqCst),
        AmoKind::And => a.fetch_and(value, Ordering::SeqCst),
        AmoKind::Or => a.fetch_or(value, Ordering::SeqCst),
        AmoKind::Xor => a.fetch_xor(value, Ordering::SeqCst),
        AmoKind::CompareSwap => {
            let expected = cond.unwrap_or(0);
            a.compare_exchange(expected, value, Ordering::SeqCst, Ordering::SeqCst).unwrap_or_else(|v| v)
        }
    }
}

fn apply_u64(ptr: *mut u8, op: AmoKind, value: u64, cond: Option<u64>) -> u64 {
    let a = unsafe { &*(ptr as *const AtomicU64) };
    match op {
        AmoKind::Fetch => a.load(Ordering::SeqCst),
        AmoKind::Set | AmoKind::Swap => a.swap(value, Ordering::SeqCst),
        AmoKind::Inc => a.fetch_add(1, Ordering::SeqCst),
        AmoKind::Add => a.fetch_add(value, Ordering::SeqCst),
        AmoKind::And => a.fetch_and(value, Ordering::SeqCst),
        AmoKind::Or => a.fetch_or(value, Ordering::SeqCst),
        AmoKind::Xor => a.fetch_xor(value, Ordering::SeqCst),
        AmoKind::CompareSwap => {
            let expected = cond.unwrap_or(0);
            a.compare_exchange(expected, value, Ordering::SeqCst, Ordering::SeqCst).unwrap_or_else(|v| v)
        }
    }
}

/// Apply `op` at `ptr`, interpreting the target as `elem_type`-wide, and
/// return the pre-operation value widened to `u64` (fetching variants use
/// it; non-fetching callers ignore it). `cond` is the comparand for
/// `CompareSwap` only.
///
/// # Safety contract (caller-enforced, not encoded in the signature)
/// `ptr` must point at a live, correctly-aligned `elem_type`-wide cell
/// inside a symmetric heap (either local, via [`SymmetricHeap::ptr_at`], or
/// a peer's, via [`Topology::ptr`]) for the duration of the call.
pub fn apply_raw(ptr: *mut u8, elem_type: ElemType, op: AmoKind, value: u64, cond: Option<u64>) -> u64 {
    match elem_type.size() {
        1 => apply_u8(ptr, op, value as u8, cond.map(|c| c as u8)) as u64,
        2 => apply_u16(ptr, op, value as u16, cond.map(|c| c as u16)) as u64,
        4 => apply_u32(ptr, op, value as u32, cond.map(|c| c as u32)) as u64,
        8 => apply_u64(ptr, op, value, cond),
        _ => 0,
    }
}

/// Engine-level entry point: dispatch to the intra-node fast path when
/// `pe` is mappable, the proxy otherwise (§4.F / §4.E cutover rules).
pub fn atomic_op(
    heap: &SymmetricHeap,
    topology: &Topology,
    runtime: &dyn Runtime,
    pe: i32,
    offset: usize,
    elem_type: ElemType,
    op: AmoKind,
    value: u64,
    cond: Option<u64>,
) -> Result<u64> {
    if !topology.is_valid_pe(pe) {
        return Err(IshmemError::InvalidPe(pe));
    }
    if pe == topology.my_pe() {
        return Ok(apply_raw(heap.ptr_at(offset), elem_type, op, value, cond));
    }
    if let Some(peer_ptr) = topology.ptr(heap.ptr_at(offset), pe) {
        return Ok(apply_raw(peer_ptr, elem_type, op, value, cond));
    }
    runtime.proxy_amo(pe, offset as u64, elem_type, op, value, cond)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_add_returns_previous_value() {
        let mut cell: u32 = 5;
        let ptr = &mut cell as *mut u32 as *mut u8;
        let prev = apply_raw(ptr, ElemType::Uint32, AmoKind::Add, 10, None);
        assert_eq!(prev, 5);
        assert_eq!(cell, 15);
    }

    #[test]
    fn compare_swap_only_updates_on_match() {
        let mut cell: u64 = 7;
        let ptr = &mut cell as *mut u64 as *mut u8;
        let prev = apply_raw(ptr, ElemType::Uint64, AmoKind::CompareSwap, 99, Some(7));
        assert_eq!(prev, 7);
        assert_eq!(cell, 99);

        let prev2 = apply_raw(ptr, ElemType::Uint64, AmoKind::CompareSwap, 100, Some(7));
        assert_eq!(prev2, 99);
        assert_eq!(cell, 99, "compare_swap must not write on mismatch");
    }

    #[test]
    fn inc_on_narrow_types() {
        let mut cell: u8 = 254;
        let ptr = &mut cell as *mut u8;
        let prev = apply_raw(ptr, ElemType::Uint8, AmoKind::Inc, 0, None);
        assert_eq!(prev, 254);
        assert_eq!(cell, 255);
    }
}
