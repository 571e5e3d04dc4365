//! Symmetric heap and PE topology (§4.A).
//!
//! Each PE owns one [`SymmetricHeap`]: a region standing in for
//! device-attached memory (there's no vendor GPU allocator available here,
//! so an anonymous `mmap` plays that role, matching the teacher's use of
//! `memmap2` for its ring buffer region). [`Topology`] is the per-PE table
//! of which peers are directly mappable and at what address delta,
//! mirroring `ishmemi_cpu_info`/`ishmemi_gpu_info`'s `local_index` table.

use crate::error::{IshmemError, Result};
use crate::runtime::Runtime;
use memmap2::MmapMut;
use std::collections::HashMap;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Ceiling on the number of PEs directly mappable from any one PE (§3).
pub const MAX_LOCAL_PES: usize = 64;

fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// A PE's slice of the symmetric heap, plus a bump allocator with a
/// size-classed free list so repeated alloc/free of the same size reuses
/// offsets (matching `malloc/calloc/free` being "thin wrappers over an
/// internal symmetric allocator" per spec.md §4.A).
pub struct SymmetricHeap {
    mmap: Mutex<MmapMut>,
    base: *mut u8,
    size: usize,
    bump: AtomicUsize,
    free_lists: Mutex<HashMap<usize, Vec<usize>>>,
}

// SAFETY: `base` is a stable pointer into `mmap`'s allocation for the
// lifetime of `SymmetricHeap` (the `MmapMut` is never reallocated after
// construction). Concurrent raw access from multiple PE threads is the
// entire point of a symmetric heap and is guarded the same way real
// cross-device memory traffic is: by explicit atomics at the call sites
// that need ordering (rma.rs, amo.rs), not by this type.
unsafe impl Send for SymmetricHeap {}
unsafe impl Sync for SymmetricHeap {}

impl SymmetricHeap {
    pub fn new(size: usize) -> Result<Self> {
        let size = align_up(size.max(4096), 4096);
        let mut mmap = MmapMut::map_anon(size)
            .map_err(|e| IshmemError::Fatal(format!("failed to map symmetric heap: {e}")))?;
        let base = mmap.as_mut_ptr();
        Ok(SymmetricHeap {
            mmap: Mutex::new(mmap),
            base,
            size,
            bump: AtomicUsize::new(0),
            free_lists: Mutex::new(HashMap::new()),
        })
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn offset_of(&self, ptr: *mut u8) -> Option<usize> {
        let off = (ptr as isize).checked_sub(self.base as isize)?;
        if off < 0 || off as usize >= self.size {
            None
        } else {
            Some(off as usize)
        }
    }

    pub fn ptr_at(&self, offset: usize) -> *mut u8 {
        unsafe { self.base.add(offset) }
    }

    /// Bump-allocate `size` bytes, reusing a freed block of the same size
    /// class when one is available. Every PE must call `malloc` the same
    /// number of times, in the same order, with the same sizes (§3
    /// Invariant 1) — this implementation does not and cannot detect a
    /// violation of that collective discipline.
    pub fn malloc(&self, size: usize) -> Result<usize> {
        if size == 0 {
            return Ok(self.bump.load(Ordering::Relaxed));
        }
        let class = align_up(size, 8);
        if let Some(off) = self.free_lists.lock().unwrap().get_mut(&class).and_then(Vec::pop) {
            return Ok(off);
        }
        let off = self.bump.fetch_add(class, Ordering::SeqCst);
        if off + class > self.size {
            self.bump.fetch_sub(class, Ordering::SeqCst);
            return Err(IshmemError::AllocatorExhausted { requested: size });
        }
        Ok(off)
    }

    pub fn calloc(&self, count: usize, size: usize) -> Result<usize> {
        let total = count
            .checked_mul(size)
            .ok_or(IshmemError::AllocatorExhausted { requested: usize::MAX })?;
        let off = self.malloc(total)?;
        if total > 0 {
            unsafe { std::ptr::write_bytes(self.base.add(off), 0, total) };
        }
        Ok(off)
    }

    pub fn free(&self, offset: usize, size: usize) {
        if size == 0 {
            return;
        }
        let class = align_up(size, 8);
        self.free_lists.lock().unwrap().entry(class).or_default().push(offset);
    }
}

/// Per-PE topology: which peers are directly mappable, and the address
/// delta that turns a local pointer into the matching pointer on a mapped
/// peer's heap (§4.A).
pub struct Topology {
    my_pe: i32,
    n_pes: i32,
    node_size: i32,
    /// `local_index[p] == 0` means "not mappable" (§3); otherwise an index
    /// into `base_delta`.
    local_index: Vec<u8>,
    base_delta: Vec<isize>,
    /// Raw heap base addresses for every PE, exchanged at init via the
    /// runtime's fcollect (`Runtime::fcollect`). Kept for diagnostics and
    /// for `ptr()`'s direct-pointer fast path.
    peer_base: Vec<AtomicPtr<u8>>,
}

impl Topology {
    /// Build the topology for `my_pe`, exchanging heap base addresses with
    /// every other PE through `runtime` (standing in for "PEs exchange
    /// heap base pointers via the external runtime", §4.A).
    pub fn build(my_pe: i32, n_pes: i32, node_size: i32, heap: &SymmetricHeap, runtime: &dyn Runtime) -> Result<Self> {
        let members: Vec<i32> = (0..n_pes).collect();
        let my_addr = heap.base() as usize;
        let my_bytes = (my_addr as u64).to_le_bytes();
        let mut all_bytes = vec![0u8; n_pes as usize * 8];
        runtime.fcollect(&members, &my_bytes, &mut all_bytes);

        let mut peer_base = Vec::with_capacity(n_pes as usize);
        let mut addrs = Vec::with_capacity(n_pes as usize);
        for p in 0..n_pes as usize {
            let bytes: [u8; 8] = all_bytes[p * 8..p * 8 + 8].try_into().unwrap();
            let addr = u64::from_le_bytes(bytes) as usize;
            addrs.push(addr);
            peer_base.push(AtomicPtr::new(addr as *mut u8));
        }

        let mut local_index = vec![0u8; n_pes as usize];
        let mut base_delta = vec![0isize; 1];
        let mut next_index: u8 = 1;
        for p in 0..n_pes {
            if p == my_pe {
                continue;
            }
            let mappable = node_size <= 0
                || (p / node_size.max(1)) == (my_pe / node_size.max(1));
            if mappable && (next_index as usize) < MAX_LOCAL_PES {
                let delta = addrs[p as usize] as isize - my_addr as isize;
                base_delta.push(delta);
                local_index[p as usize] = next_index;
                next_index += 1;
            }
        }

        Ok(Topology {
            my_pe,
            n_pes,
            node_size,
            local_index,
            base_delta,
            peer_base,
        })
    }

    pub fn my_pe(&self) -> i32 {
        self.my_pe
    }

    pub fn n_pes(&self) -> i32 {
        self.n_pes
    }

    pub fn is_valid_pe(&self, pe: i32) -> bool {
        pe >= 0 && pe < self.n_pes
    }

    /// Whether `pe` is directly mappable from this PE (`local_index != 0`).
    pub fn is_mappable(&self, pe: i32) -> bool {
        self.is_valid_pe(pe) && pe != self.my_pe && self.local_index[pe as usize] != 0
    }

    fn local_index_of(&self, pe: i32) -> Option<usize> {
        if !self.is_mappable(pe) {
            return None;
        }
        Some(self.local_index[pe as usize] as usize)
    }

    /// `ishmem_ptr`: translate a local pointer into the corresponding
    /// pointer on `pe`'s heap, or `None` if `pe` is not mappable (§4.A).
    pub fn ptr(&self, local_ptr: *mut u8, pe: i32) -> Option<*mut u8> {
        let idx = self.local_index_of(pe)?;
        let delta = self.base_delta[idx];
        Some(unsafe { local_ptr.offset(delta) })
    }

    pub fn peer_base(&self, pe: i32) -> Option<*mut u8> {
        if !self.is_valid_pe(pe) {
            return None;
        }
        Some(self.peer_base[pe as usize].load(Ordering::Relaxed))
    }

    /// `SHARED`/`NODE` team membership: the contiguous, same-`node_size`-block
    /// of PEs this PE can reach directly, discovered by scanning mappability
    /// with a consistent stride of 1 (§4.A).
    pub fn shared_team_members(&self) -> Vec<i32> {
        let mut members: Vec<i32> = (0..self.n_pes).filter(|&p| p == self.my_pe || self.is_mappable(p)).collect();
        members.sort_unstable();
        members
    }

    pub fn node_size(&self) -> i32 {
        self.node_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::loopback::LoopbackRuntime;

    #[test]
    fn malloc_matches_offsets_across_matched_calls() {
        let heap = SymmetricHeap::new(4096).unwrap();
        let a = heap.malloc(64).unwrap();
        let b = heap.malloc(64).unwrap();
        assert_ne!(a, b);
        heap.free(a, 64);
        let c = heap.malloc(64).unwrap();
        assert_eq!(a, c, "freed block should be reused by a matched-size malloc");
    }

    #[test]
    fn calloc_zeroes_memory() {
        let heap = SymmetricHeap::new(4096).unwrap();
        let off = heap.calloc(16, 4).unwrap();
        let slice = unsafe { std::slice::from_raw_parts(heap.ptr_at(off), 64) };
        assert!(slice.iter().all(|&b| b == 0));
    }

    #[test]
    fn allocator_exhaustion_is_reported() {
        let heap = SymmetricHeap::new(4096).unwrap();
        assert!(heap.malloc(1_000_000).is_err());
    }

    #[test]
    fn topology_marks_same_node_peers_mappable() {
        let fabric = LoopbackRuntime::new_fabric(4, 2);
        let rt0 = LoopbackRuntime::attach(&fabric, 0);
        let heap0 = SymmetricHeap::new(4096).unwrap();
        let topo0 = Topology::build(0, 4, 2, &heap0, &rt0).unwrap();
        assert!(topo0.is_mappable(1));
        assert!(!topo0.is_mappable(2));
        assert!(!topo0.is_mappable(3));
    }
}
