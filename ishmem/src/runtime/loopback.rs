//! Single-process runtime backend: every PE is an OS thread inside one
//! process, sharing one `LoopbackFabric`. This is the backend the test
//! suite and the `ishmem-cli` demo run against; it is also what makes the
//! engine's "off-node" code paths exercisable at all without a real
//! multi-node launch, by drawing an artificial node boundary at
//! `node_size` PEs even though every thread is physically in the same
//! address space (see `heap::Topology`).
//!
//! The rendezvous primitive below (`Fabric::rendezvous`) is a classic
//! sense-reversing barrier keyed by team membership: every member writes
//! its payload, the last arriver computes a per-rank result vector and
//! flips the generation counter, and every waiter (including the last
//! arriver) reads its own slot back out. Keying by membership rather than
//! by a call-site id is safe here because every collective is called in
//! matching relative program order by every member (this is inherent to
//! any SPMD collective library, not a simplification specific to this
//! backend).

use super::{AmoKind, ReduceOp, Runtime};
use crate::error::{IshmemError, Result};
use ishmem_wire::ElemType;
use std::collections::HashMap;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

struct RendezvousState {
    generation: u64,
    arrived: usize,
    inputs: Vec<Vec<u8>>,
    results: Vec<Vec<u8>>,
}

struct RendezvousPoint {
    state: Mutex<RendezvousState>,
    cv: Condvar,
}

/// Process-wide fabric shared by every PE thread attached to it.
pub struct LoopbackFabric {
    n_pes: i32,
    node_size: i32,
    points: Mutex<HashMap<Vec<i32>, Arc<RendezvousPoint>>>,
    heap_bases: Vec<AtomicPtr<u8>>,
    heap_size: AtomicUsize,
}

impl LoopbackFabric {
    fn point_for(&self, members: &[i32]) -> Arc<RendezvousPoint> {
        let mut points = self.points.lock().unwrap();
        points
            .entry(members.to_vec())
            .or_insert_with(|| {
                Arc::new(RendezvousPoint {
                    state: Mutex::new(RendezvousState {
                        generation: 0,
                        arrived: 0,
                        inputs: vec![Vec::new(); members.len()],
                        results: vec![Vec::new(); members.len()],
                    }),
                    cv: Condvar::new(),
                })
            })
            .clone()
    }

    /// Every member of `members` calls this with its own `rank` (position
    /// in `members`) and `payload`. `combine` runs exactly once per round,
    /// on whichever thread happens to arrive last, and produces one result
    /// per rank (identical for all ranks for every collective except scan).
    fn rendezvous(
        &self,
        members: &[i32],
        rank: usize,
        payload: Vec<u8>,
        combine: impl FnOnce(&[Vec<u8>]) -> Vec<Vec<u8>>,
    ) -> Vec<u8> {
        let point = self.point_for(members);
        let mut state = point.state.lock().unwrap();
        state.inputs[rank] = payload;
        state.arrived += 1;
        let my_generation = state.generation;

        if state.arrived == members.len() {
            let results = combine(&state.inputs);
            debug_assert_eq!(results.len(), members.len());
            state.results = results;
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            point.cv.notify_all();
        } else {
            state = point
                .cv
                .wait_while(state, |s| s.generation == my_generation)
                .unwrap();
        }
        state.results[rank].clone()
    }

    fn rank_of(&self, members: &[i32], pe: i32) -> usize {
        members.iter().position(|&p| p == pe).expect("pe must be a member")
    }
}

/// A PE's handle onto a [`LoopbackFabric`].
pub struct LoopbackRuntime {
    fabric: Arc<LoopbackFabric>,
    my_pe: i32,
}

impl LoopbackRuntime {
    /// Build a fabric for `n_pes` PEs, partitioned into nodes of
    /// `node_size` consecutive PEs each (pass `n_pes` to make every PE
    /// mappable, modeling a single-node run).
    pub fn new_fabric(n_pes: i32, node_size: i32) -> Arc<LoopbackFabric> {
        Arc::new(LoopbackFabric {
            n_pes,
            node_size,
            points: Mutex::new(HashMap::new()),
            heap_bases: (0..n_pes).map(|_| AtomicPtr::new(std::ptr::null_mut())).collect(),
            heap_size: AtomicUsize::new(0),
        })
    }

    pub fn attach(fabric: &Arc<LoopbackFabric>, my_pe: i32) -> Self {
        LoopbackRuntime {
            fabric: fabric.clone(),
            my_pe,
        }
    }
}

impl Runtime for LoopbackRuntime {
    fn my_pe(&self) -> i32 {
        self.my_pe
    }

    fn n_pes(&self) -> i32 {
        self.fabric.n_pes
    }

    fn node_rank(&self, pe: i32) -> i32 {
        if self.fabric.node_size <= 0 {
            pe
        } else {
            pe % self.fabric.node_size
        }
    }

    fn node_size(&self) -> i32 {
        if self.fabric.node_size <= 0 {
            self.fabric.n_pes
        } else {
            self.fabric.node_size
        }
    }

    fn barrier(&self, members: &[i32]) {
        let rank = self.fabric.rank_of(members, self.my_pe);
        self.fabric.rendezvous(members, rank, Vec::new(), |inputs| {
            vec![Vec::new(); inputs.len()]
        });
    }

    fn broadcast(&self, members: &[i32], root: i32, buf: &mut [u8]) {
        let rank = self.fabric.rank_of(members, self.my_pe);
        let root_rank = self.fabric.rank_of(members, root);
        let payload = buf.to_vec();
        let out = self.fabric.rendezvous(members, rank, payload, move |inputs| {
            let chosen = inputs[root_rank].clone();
            vec![chosen; inputs.len()]
        });
        buf.copy_from_slice(&out);
    }

    fn fcollect(&self, members: &[i32], my_chunk: &[u8], out: &mut [u8]) {
        let rank = self.fabric.rank_of(members, self.my_pe);
        let chunk_len = my_chunk.len();
        let result = self.fabric.rendezvous(members, rank, my_chunk.to_vec(), move |inputs| {
            let mut flat = Vec::with_capacity(inputs.len() * chunk_len);
            for chunk in inputs {
                flat.extend_from_slice(chunk);
            }
            vec![flat; inputs.len()]
        });
        out.copy_from_slice(&result);
    }

    fn collect(&self, members: &[i32], my_chunk: &[u8]) -> Vec<u8> {
        let rank = self.fabric.rank_of(members, self.my_pe);
        self.fabric.rendezvous(members, rank, my_chunk.to_vec(), |inputs| {
            let flat: Vec<u8> = inputs.iter().flat_map(|c| c.iter().copied()).collect();
            vec![flat; inputs.len()]
        })
    }

    fn reduce(&self, members: &[i32], op: ReduceOp, elem_type: ElemType, my_chunk: &[u8], out: &mut [u8]) {
        let rank = self.fabric.rank_of(members, self.my_pe);
        let result = self.fabric.rendezvous(members, rank, my_chunk.to_vec(), move |inputs| {
            let combined = crate::collectives::fold_all(op, elem_type, inputs);
            vec![combined; inputs.len()]
        });
        out.copy_from_slice(&result);
    }

    fn scan(&self, members: &[i32], inclusive: bool, elem_type: ElemType, my_value: &[u8], out: &mut [u8]) {
        let rank = self.fabric.rank_of(members, self.my_pe);
        let result = self.fabric.rendezvous(members, rank, my_value.to_vec(), move |inputs| {
            crate::collectives::scan_all(inclusive, elem_type, inputs)
        });
        out.copy_from_slice(&result);
    }

    fn team_split_strided(&self, members: &[i32]) -> Result<()> {
        if members.is_empty() {
            return Err(IshmemError::InvalidTeam(-1));
        }
        Ok(())
    }

    fn team_destroy(&self, _members: &[i32]) {}

    fn proxy_put(&self, dest_pe: i32, dst_offset: u64, data: &[u8]) -> Result<()> {
        let base = self.fabric.heap_bases[dest_pe as usize].load(Ordering::Acquire);
        if base.is_null() {
            return Err(IshmemError::Fatal(format!("no heap registered for pe {dest_pe}")));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), base.add(dst_offset as usize), data.len());
        }
        std::sync::atomic::fence(Ordering::Release);
        Ok(())
    }

    fn proxy_get(&self, src_pe: i32, src_offset: u64, len: usize) -> Result<Vec<u8>> {
        let base = self.fabric.heap_bases[src_pe as usize].load(Ordering::Acquire);
        if base.is_null() {
            return Err(IshmemError::Fatal(format!("no heap registered for pe {src_pe}")));
        }
        std::sync::atomic::fence(Ordering::Acquire);
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(base.add(src_offset as usize), out.as_mut_ptr(), len);
        }
        Ok(out)
    }

    fn proxy_amo(
        &self,
        dest_pe: i32,
        offset: u64,
        elem_type: ElemType,
        op: AmoKind,
        value: u64,
        cond: Option<u64>,
    ) -> Result<u64> {
        let base = self.fabric.heap_bases[dest_pe as usize].load(Ordering::Acquire);
        if base.is_null() {
            return Err(IshmemError::Fatal(format!("no heap registered for pe {dest_pe}")));
        }
        let ptr = unsafe { base.add(offset as usize) };
        Ok(crate::amo::apply_raw(ptr, elem_type, op, value, cond))
    }
}

impl LoopbackFabric {
    /// Publish `pe`'s heap base address so `proxy_put`/`proxy_get`/`proxy_amo`
    /// can reach it. Called once at init after every PE has allocated its
    /// symmetric heap (standing in for the real runtime's address exchange).
    pub fn register_heap(&self, pe: i32, base: *mut u8, size: usize) {
        self.heap_bases[pe as usize].store(base, Ordering::Release);
        self.heap_size.store(size, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn barrier_releases_every_participant() {
        let fabric = LoopbackRuntime::new_fabric(4, 4);
        let handles: Vec<_> = (0..4)
            .map(|pe| {
                let fabric = fabric.clone();
                thread::spawn(move || {
                    let rt = LoopbackRuntime::attach(&fabric, pe);
                    rt.barrier(&[0, 1, 2, 3]);
                    rt.barrier(&[0, 1, 2, 3]);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn broadcast_delivers_roots_value() {
        let fabric = LoopbackRuntime::new_fabric(3, 3);
        let handles: Vec<_> = (0..3)
            .map(|pe| {
                let fabric = fabric.clone();
                thread::spawn(move || {
                    let rt = LoopbackRuntime::attach(&fabric, pe);
                    let mut buf = if pe == 0 { 42i32.to_le_bytes() } else { 0i32.to_le_bytes() };
                    rt.broadcast(&[0, 1, 2], 0, &mut buf);
                    i32::from_le_bytes(buf)
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), 42);
        }
    }

    #[test]
    fn fcollect_orders_by_rank() {
        let fabric = LoopbackRuntime::new_fabric(3, 3);
        let handles: Vec<_> = (0..3)
            .map(|pe| {
                let fabric = fabric.clone();
                thread::spawn(move || {
                    let rt = LoopbackRuntime::attach(&fabric, pe);
                    let mut out = vec![0u8; 12];
                    rt.fcollect(&[0, 1, 2], &(pe as i32).to_le_bytes(), &mut out);
                    out
                })
            })
            .collect();
        let expected: Vec<u8> = (0..3i32).flat_map(|p| p.to_le_bytes()).collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), expected);
        }
    }
}
