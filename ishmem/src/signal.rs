//! Point-to-point signalling and the wait/test predicate family (§4.G),
//! grounded on `original_source/src/rma.cpp`'s `ishmem_put_signal` and the
//! `test/unit/SHMEM/{int_wait_until_*,int_test_all_host,int_test_any_device,
//! int_test_some_host,signal_wait_until_device}.cpp` unit tests.
//!
//! `wait_until`/`test` never cross the ring (they are pure local spin
//! predicates over the caller's own symmetric heap cell, written into by a
//! peer's put/AMO) — mirroring `ishmem_wire::Op`'s doc comment that these
//! have no wire tag.

use crate::amo::atomic_op;
use crate::error::Result;
use crate::heap::{SymmetricHeap, Topology};
use crate::rma::local_put;
use crate::runtime::{AmoKind, Runtime};
use ishmem_wire::ElemType;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};

/// How a `put_signal` updates the remote signal word (§4.G).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOp {
    Set,
    Add,
}

/// `ishmem_put_signal`: put `nbytes` from `src_offset` to `pe`, then update
/// `pe`'s signal word at `sig_offset` — in that order, so a peer spinning on
/// the signal never observes it before the data (§3 Invariant: RMA ordering).
#[allow(clippy::too_many_arguments)]
pub fn put_signal(
    heap: &SymmetricHeap,
    topology: &Topology,
    runtime: &dyn Runtime,
    pe: i32,
    dst_offset: u64,
    src_offset: u64,
    nbytes: usize,
    sig_offset: u64,
    sig_value: u64,
    sig_op: SignalOp,
) -> Result<()> {
    local_put(heap, topology, runtime, pe, dst_offset, src_offset, nbytes)?;
    let op = match sig_op {
        SignalOp::Set => AmoKind::Set,
        SignalOp::Add => AmoKind::Add,
    };
    atomic_op(heap, topology, runtime, pe, sig_offset as usize, ElemType::Uint64, op, sig_value, None)?;
    Ok(())
}

/// `ishmem_signal_fetch`: read the caller's own signal word.
pub fn signal_fetch(heap: &SymmetricHeap, sig_offset: u64) -> u64 {
    load_atomic(heap.ptr_at(sig_offset as usize), ElemType::Uint64)
}

/// `ishmem_signal_set`/`ishmem_signal_add` targeting `pe`'s signal word.
pub fn signal_update(heap: &SymmetricHeap, topology: &Topology, runtime: &dyn Runtime, pe: i32, sig_offset: u64, value: u64, op: SignalOp) -> Result<()> {
    let amo_op = match op {
        SignalOp::Set => AmoKind::Set,
        SignalOp::Add => AmoKind::Add,
    };
    atomic_op(heap, topology, runtime, pe, sig_offset as usize, ElemType::Uint64, amo_op, value, None).map(|_| ())
}

fn load_atomic(ptr: *mut u8, elem_type: ElemType) -> u64 {
    match elem_type.size() {
        1 => unsafe { (*(ptr as *const AtomicU8)).load(Ordering::Acquire) as u64 },
        2 => unsafe { (*(ptr as *const AtomicU16)).load(Ordering::Acquire) as u64 },
        4 => unsafe { (*(ptr as *const AtomicU32)).load(Ordering::Acquire) as u64 },
        8 => unsafe { (*(ptr as *const AtomicU64)).load(Ordering::Acquire) },
        _ => 0,
    }
}

/// Comparison predicate for `wait_until`/`test` (§4.G).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

fn cmp_matches(cmp: CmpOp, observed: u64, target: u64) -> bool {
    match cmp {
        CmpOp::Eq => observed == target,
        CmpOp::Ne => observed != target,
        CmpOp::Gt => observed > target,
        CmpOp::Ge => observed >= target,
        CmpOp::Lt => observed < target,
        CmpOp::Le => observed <= target,
    }
}

/// One condition in a `wait_until_all`/`_any`/`_some` array: a heap offset,
/// its element type, the comparison, and the target value.
#[derive(Debug, Clone, Copy)]
pub struct WaitCond {
    pub offset: usize,
    pub elem_type: ElemType,
    pub cmp: CmpOp,
    pub target: u64,
}

/// `ishmem_test`: single non-blocking predicate check.
pub fn test(heap: &SymmetricHeap, cond: WaitCond) -> bool {
    cmp_matches(cond.cmp, load_atomic(heap.ptr_at(cond.offset), cond.elem_type), cond.target)
}

/// `ishmem_wait_until`: block until `cond` holds.
pub fn wait_until(heap: &SymmetricHeap, cond: WaitCond) {
    while !test(heap, cond) {
        std::hint::spin_loop();
    }
}

/// Is index `i` excluded from consideration by an optional `status[]` mask?
fn is_masked(status: Option<&[bool]>, i: usize) -> bool {
    status.map(|s| s[i]).unwrap_or(false)
}

/// Every index is masked out, so there is nothing left for an `_any`/`_some`
/// form to ever find.
fn all_masked(conds: &[WaitCond], status: Option<&[bool]>) -> bool {
    !conds.is_empty() && (0..conds.len()).all(|i| is_masked(status, i))
}

/// `ishmem_test_all`: every unmasked condition holds right now. A masked
/// entry is ignored, i.e. does not block the result.
pub fn test_all(heap: &SymmetricHeap, conds: &[WaitCond], status: Option<&[bool]>) -> bool {
    conds.iter().enumerate().all(|(i, &c)| is_masked(status, i) || test(heap, c))
}

/// `ishmem_wait_until_all`: block until every unmasked condition holds.
pub fn wait_until_all(heap: &SymmetricHeap, conds: &[WaitCond], status: Option<&[bool]>) {
    while !test_all(heap, conds, status) {
        std::hint::spin_loop();
    }
}

/// `ishmem_test_any`: index of the first unmasked condition that holds right
/// now, if any.
pub fn test_any(heap: &SymmetricHeap, conds: &[WaitCond], status: Option<&[bool]>) -> Option<usize> {
    conds.iter().enumerate().find(|&(i, &c)| !is_masked(status, i) && test(heap, c)).map(|(i, _)| i)
}

/// `ishmem_wait_until_any`: block until some unmasked condition holds,
/// returning its index. A fully masked array can never be satisfied, so it
/// short-circuits to `None` instead of spinning forever.
pub fn wait_until_any(heap: &SymmetricHeap, conds: &[WaitCond], status: Option<&[bool]>) -> Option<usize> {
    if all_masked(conds, status) {
        return None;
    }
    loop {
        if let Some(i) = test_any(heap, conds, status) {
            return Some(i);
        }
        std::hint::spin_loop();
    }
}

/// `ishmem_test_some`: indices of every unmasked condition that holds right now.
pub fn test_some(heap: &SymmetricHeap, conds: &[WaitCond], status: Option<&[bool]>) -> Vec<usize> {
    conds.iter().enumerate().filter(|&(i, &c)| !is_masked(status, i) && test(heap, c)).map(|(i, _)| i).collect()
}

/// `ishmem_wait_until_some`: block until at least one unmasked condition
/// holds, returning every index that does. A fully masked array returns no
/// indices immediately rather than spinning forever.
pub fn wait_until_some(heap: &SymmetricHeap, conds: &[WaitCond], status: Option<&[bool]>) -> Vec<usize> {
    if all_masked(conds, status) {
        return Vec::new();
    }
    loop {
        let hit = test_some(heap, conds, status);
        if !hit.is_empty() {
            return hit;
        }
        std::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_until_observes_a_concurrent_write() {
        let heap = SymmetricHeap::new(4096).unwrap();
        let cond = WaitCond { offset: 0, elem_type: ElemType::Uint32, cmp: CmpOp::Eq, target: 7 };
        unsafe { *heap.ptr_at(0).cast::<u32>() = 0 };
        assert!(!test(&heap, cond));

        let atomic = unsafe { &*(heap.ptr_at(0) as *const AtomicU32) };
        let h = std::thread::spawn({
            let heap_ptr = heap.ptr_at(0) as usize;
            move || {
                std::thread::sleep(std::time::Duration::from_millis(5));
                unsafe { (*(heap_ptr as *const AtomicU32)).store(7, Ordering::Release) };
            }
        });
        wait_until(&heap, cond);
        h.join().unwrap();
        assert_eq!(atomic.load(Ordering::Acquire), 7);
    }

    #[test]
    fn test_any_and_test_some_agree_with_test_all() {
        let heap = SymmetricHeap::new(4096).unwrap();
        unsafe {
            *heap.ptr_at(0).cast::<u32>() = 5;
            *heap.ptr_at(8).cast::<u32>() = 9;
        }
        let conds = [
            WaitCond { offset: 0, elem_type: ElemType::Uint32, cmp: CmpOp::Eq, target: 5 },
            WaitCond { offset: 8, elem_type: ElemType::Uint32, cmp: CmpOp::Eq, target: 999 },
        ];
        assert!(!test_all(&heap, &conds, None));
        assert_eq!(test_any(&heap, &conds, None), Some(0));
        assert_eq!(test_some(&heap, &conds, None), vec![0]);
    }

    #[test]
    fn a_fully_masked_array_short_circuits_instead_of_blocking() {
        let heap = SymmetricHeap::new(4096).unwrap();
        let conds = [WaitCond { offset: 0, elem_type: ElemType::Uint32, cmp: CmpOp::Eq, target: 5 }];
        let mask = [true];
        assert!(test_all(&heap, &conds, Some(&mask)));
        assert_eq!(test_any(&heap, &conds, Some(&mask)), None);
        assert_eq!(wait_until_any(&heap, &conds, Some(&mask)), None);
        assert!(test_some(&heap, &conds, Some(&mask)).is_empty());
        assert!(wait_until_some(&heap, &conds, Some(&mask)).is_empty());
    }
}
