//! A host-testable PGAS (partitioned global address space) communication
//! engine for GPU-attached processing elements: one-sided RMA, atomics,
//! collectives, signalling, wait/test predicates, and teams, callable from
//! host code and from a simulated device execution context (see
//! [`device::DeviceContext`]).
//!
//! [`Engine`] is the single runtime object spec.md's design notes call for
//! (§9 "Global mutable state → explicit context"): everything that would
//! otherwise be a process-wide singleton — the symmetric heap, topology,
//! scale-out runtime handle, request ring, team table, on-queue registry —
//! lives behind one `Arc<Engine>` created by [`Engine::init`] and torn down
//! by [`Engine::finalize`].

pub mod amo;
pub mod collectives;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod heap;
pub mod on_queue;
pub mod proxy;
pub mod rma;
pub mod ring;
pub mod runtime;
pub mod signal;
pub mod teams;

pub use device::DeviceContext;
pub use error::{status_of, IshmemError, Result};
pub use ishmem_wire::ElemType;
pub use on_queue::{QueueEvent, QueueId};
pub use runtime::{AmoKind, ReduceOp, Runtime};
pub use signal::{CmpOp, SignalOp, WaitCond};
pub use teams::TeamId;

use config::Config;
use dispatch::UpcallTable;
use heap::{SymmetricHeap, Topology};
use ishmem_wire::{Op, Request};
use on_queue::QueueRegistry;
use proxy::Proxy;
use ring::Ring;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use teams::{Team, TeamPool};

fn wire_op_for_amo(op: AmoKind) -> Op {
    match op {
        AmoKind::Fetch => Op::AmoFetch,
        AmoKind::Set => Op::AmoSet,
        AmoKind::Inc => Op::AmoFetchInc,
        AmoKind::Add => Op::AmoFetchAdd,
        AmoKind::And => Op::AmoFetchAnd,
        AmoKind::Or => Op::AmoFetchOr,
        AmoKind::Xor => Op::AmoFetchXor,
        AmoKind::Swap => Op::AmoSwap,
        AmoKind::CompareSwap => Op::AmoCompareSwap,
    }
}

pub struct Engine {
    config: Config,
    heap: SymmetricHeap,
    topology: Topology,
    runtime: Box<dyn Runtime>,
    ring: Ring,
    teams: Mutex<HashMap<TeamId, Arc<Team>>>,
    team_pool: TeamPool,
    queues: QueueRegistry,
    proxy: Mutex<Option<Proxy>>,
}

impl Engine {
    /// `ishmem_init`: build the engine for this process/thread's PE,
    /// exchange heap addresses through `runtime`, register the predefined
    /// teams, and start the host proxy thread. Installs `env_logger`
    /// idempotently (§4.L).
    pub fn init(runtime: Box<dyn Runtime>) -> Arc<Engine> {
        let config = Config::load();
        let _ = env_logger::builder().filter_level(config.log_level_filter()).is_test(false).try_init();
        log::info!("ishmem init: pe {} of {}", runtime.my_pe(), runtime.n_pes());

        let heap = SymmetricHeap::new(config.symmetric_size).unwrap_or_else(|e| panic!("{e}"));
        let topology = Topology::build(runtime.my_pe(), runtime.n_pes(), runtime.node_size(), &heap, runtime.as_ref())
            .unwrap_or_else(|e| panic!("{e}"));

        let my_pe = topology.my_pe();
        let n_pes = topology.n_pes();
        let shared_members = topology.shared_team_members();
        let only_intra_node = shared_members.len() as i32 == n_pes;

        let world_psync = heap.malloc(teams::N_PSYNCS_PER_TEAM * 8).unwrap_or_else(|e| panic!("{e}"));
        let world = Team::new(teams::WORLD, (0..n_pes).collect(), my_pe, only_intra_node, shared_members.len() as i32, world_psync);

        let shared_psync = heap.malloc(teams::N_PSYNCS_PER_TEAM * 8).unwrap_or_else(|e| panic!("{e}"));
        let shared = Team::new(teams::SHARED, shared_members.clone(), my_pe, true, shared_members.len() as i32, shared_psync);

        let node_psync = heap.malloc(teams::N_PSYNCS_PER_TEAM * 8).unwrap_or_else(|e| panic!("{e}"));
        let n_local_pes = shared_members.len() as i32;
        let node = Team::new(teams::NODE, shared_members, my_pe, true, n_local_pes, node_psync);

        let mut teams_map = HashMap::new();
        teams_map.insert(teams::WORLD, Arc::new(world));
        teams_map.insert(teams::SHARED, Arc::new(shared));
        teams_map.insert(teams::NODE, Arc::new(node));

        let team_pool = TeamPool::new(config.teams_max, 3);
        let ring = Ring::new();

        let engine = Arc::new(Engine {
            config,
            heap,
            topology,
            runtime,
            ring,
            teams: Mutex::new(teams_map),
            team_pool,
            queues: QueueRegistry::new(),
            proxy: Mutex::new(None),
        });

        let table = Arc::new(UpcallTable::build());
        let proxy = Proxy::spawn(engine.clone(), table);
        *engine.proxy.lock().unwrap() = Some(proxy);
        engine
    }

    /// `ishmem_finalize`: stop the proxy thread. Calling this while other
    /// threads still have outstanding blocking calls in flight is undefined
    /// (§5 "Cancellation"), matching spec.md.
    pub fn finalize(self: &Arc<Engine>) {
        if let Some(mut proxy) = self.proxy.lock().unwrap().take() {
            proxy.shutdown();
        }
    }

    pub fn heap(&self) -> &SymmetricHeap {
        &self.heap
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn runtime(&self) -> &dyn Runtime {
        self.runtime.as_ref()
    }

    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn my_pe(&self) -> i32 {
        self.topology.my_pe()
    }

    pub fn n_pes(&self) -> i32 {
        self.topology.n_pes()
    }

    pub fn node_rank(&self) -> i32 {
        self.runtime.node_rank(self.my_pe())
    }

    pub fn node_size(&self) -> i32 {
        self.topology.node_size()
    }

    /// `ishmem_ptr`.
    pub fn ptr(&self, local_offset: usize, pe: i32) -> Option<*mut u8> {
        self.topology.ptr(self.heap.ptr_at(local_offset), pe)
    }

    pub fn malloc(&self, size: usize) -> Result<usize> {
        self.heap.malloc(size)
    }

    pub fn calloc(&self, count: usize, size: usize) -> Result<usize> {
        self.heap.calloc(count, size)
    }

    pub fn free(&self, offset: usize, size: usize) {
        self.heap.free(offset, size)
    }

    fn team(&self, id: TeamId) -> Option<Arc<Team>> {
        self.teams.lock().unwrap().get(&id).cloned()
    }

    // ---- RMA (§4.E) ----------------------------------------------------

    /// `ishmem_put`/`ishmem_iput`/`ishmem_ibput` unified behind one entry
    /// point: `stride`/`bsize` default to `(1, 1)` for the plain
    /// contiguous form.
    #[allow(clippy::too_many_arguments)]
    pub fn put(&self, pe: i32, dst_offset: u64, src_offset: u64, elem_type: ElemType, dst_stride: i64, src_stride: i64, bsize: usize, nelems: usize) -> Result<()> {
        if dst_stride == 1 && src_stride == 1 && bsize == 1 {
            let nbytes = nelems * elem_type.size();
            return self.rma_single(Op::Put, pe, dst_offset, src_offset, elem_type, nelems as u64, 1, 1, 1, nbytes, |h, t, r| {
                rma::local_put(h, t, r, pe, dst_offset, src_offset, nbytes)
            });
        }
        if DeviceContext::is_active() {
            let mut req = Request::new(Op::Iput, elem_type, pe);
            req.dst = dst_offset;
            req.src = src_offset;
            req.nelems = nelems as u64;
            req.dst_stride = dst_stride;
            req.src_stride = src_stride;
            req.bsize_or_value = bsize as u64;
            return self.ring_roundtrip(req);
        }
        rma::local_iput(&self.heap, &self.topology, self.runtime.as_ref(), pe, dst_offset, src_offset, elem_type.size(), dst_stride, src_stride, bsize, nelems)
    }

    /// `ishmem_get`/`ishmem_iget`/`ishmem_ibget`, mirroring [`Engine::put`].
    #[allow(clippy::too_many_arguments)]
    pub fn get(&self, pe: i32, dst_offset: u64, src_offset: u64, elem_type: ElemType, dst_stride: i64, src_stride: i64, bsize: usize, nelems: usize) -> Result<()> {
        if dst_stride == 1 && src_stride == 1 && bsize == 1 {
            let nbytes = nelems * elem_type.size();
            return self.rma_single(Op::Get, pe, dst_offset, src_offset, elem_type, nelems as u64, 1, 1, 1, nbytes, |h, t, r| {
                rma::local_get(h, t, r, pe, dst_offset, src_offset, nbytes)
            });
        }
        if DeviceContext::is_active() {
            let mut req = Request::new(Op::Iget, elem_type, pe);
            req.dst = dst_offset;
            req.src = src_offset;
            req.nelems = nelems as u64;
            req.dst_stride = dst_stride;
            req.src_stride = src_stride;
            req.bsize_or_value = bsize as u64;
            return self.ring_roundtrip(req);
        }
        rma::local_iget(&self.heap, &self.topology, self.runtime.as_ref(), pe, dst_offset, src_offset, elem_type.size(), dst_stride, src_stride, bsize, nelems)
    }

    /// `ishmem_put_nbi`/`ishmem_get_nbi`: this engine has no distinct
    /// asynchronous execution context to post into (§9), so the `_nbi`
    /// forms execute synchronously like their blocking counterparts;
    /// `quiet`/`fence` are correspondingly no-ops (see [`Engine::quiet`]).
    pub fn put_nbi(&self, pe: i32, dst_offset: u64, src_offset: u64, elem_type: ElemType, nelems: usize) -> Result<()> {
        self.put(pe, dst_offset, src_offset, elem_type, 1, 1, 1, nelems)
    }

    pub fn get_nbi(&self, pe: i32, dst_offset: u64, src_offset: u64, elem_type: ElemType, nelems: usize) -> Result<()> {
        self.get(pe, dst_offset, src_offset, elem_type, 1, 1, 1, nelems)
    }

    /// `ishmem_p`: scalar store.
    pub fn p(&self, pe: i32, dst_offset: u64, elem_type: ElemType, value: u64) -> Result<()> {
        if DeviceContext::is_active() && !rma::is_fast_path(&self.topology, pe, elem_type.size(), self.config.rma_cutover) {
            let mut req = Request::new(Op::P, elem_type, pe);
            req.dst = dst_offset;
            req.bsize_or_value = value;
            return self.ring_roundtrip(req);
        }
        rma::local_p(&self.heap, &self.topology, self.runtime.as_ref(), pe, dst_offset, elem_type.size(), value)
    }

    /// `ishmem_g`: scalar fetch.
    pub fn g(&self, pe: i32, src_offset: u64, elem_type: ElemType) -> Result<u64> {
        if DeviceContext::is_active() && !rma::is_fast_path(&self.topology, pe, elem_type.size(), self.config.rma_cutover) {
            let mut req = Request::new(Op::G, elem_type, pe);
            req.src = src_offset;
            let sequence = self.ring.submit(req);
            let completion = self.ring.wait_completion(sequence, self.config.proxy_spin_budget());
            self.ring.free(sequence);
            return Ok(completion.ret);
        }
        rma::local_g(&self.heap, &self.topology, self.runtime.as_ref(), pe, src_offset, elem_type.size())
    }

    #[allow(clippy::too_many_arguments)]
    fn rma_single(
        &self,
        op: Op,
        pe: i32,
        dst_offset: u64,
        src_offset: u64,
        elem_type: ElemType,
        nelems: u64,
        dst_stride: i64,
        src_stride: i64,
        bsize: u64,
        nbytes: usize,
        fast: impl FnOnce(&SymmetricHeap, &Topology, &dyn Runtime) -> Result<()>,
    ) -> Result<()> {
        if DeviceContext::is_active() {
            if rma::is_fast_path(&self.topology, pe, nbytes, self.config.rma_cutover) {
                return fast(&self.heap, &self.topology, self.runtime.as_ref());
            }
            let mut req = Request::new(op, elem_type, pe);
            req.dst = dst_offset;
            req.src = src_offset;
            req.nelems = nelems;
            req.dst_stride = dst_stride;
            req.src_stride = src_stride;
            req.bsize_or_value = bsize;
            return self.ring_roundtrip(req);
        }
        fast(&self.heap, &self.topology, self.runtime.as_ref())
    }

    fn ring_roundtrip(&self, req: Request) -> Result<()> {
        let sequence = self.ring.submit(req);
        let completion = self.ring.wait_completion(sequence, self.config.proxy_spin_budget());
        self.ring.free(sequence);
        if completion.status() == 0 {
            Ok(())
        } else {
            Err(IshmemError::PluginFailure(completion.status()))
        }
    }

    // ---- AMO (§4.F) -----------------------------------------------------

    pub fn amo(&self, pe: i32, offset: usize, elem_type: ElemType, op: AmoKind, value: u64, cond: Option<u64>) -> Result<u64> {
        if DeviceContext::is_active() && !self.topology.is_mappable(pe) && pe != self.my_pe() {
            let mut req = Request::new(wire_op_for_amo(op), elem_type, pe);
            req.dst = offset as u64;
            req.bsize_or_value = value;
            if let Some(c) = cond {
                req.src = c;
            }
            let sequence = self.ring.submit(req);
            let completion = self.ring.wait_completion(sequence, self.config.proxy_spin_budget());
            self.ring.free(sequence);
            return Ok(completion.ret);
        }
        amo::atomic_op(&self.heap, &self.topology, self.runtime.as_ref(), pe, offset, elem_type, op, value, cond)
    }

    // ---- Signalling & wait/test (§4.G) ----------------------------------

    /// Always executed synchronously regardless of device context: composing
    /// the put and the signal-AMO from two independent ring round trips
    /// would let the proxy interleave other producers between them,
    /// breaking the "data before signal" ordering guarantee (see DESIGN.md).
    #[allow(clippy::too_many_arguments)]
    pub fn put_signal(&self, pe: i32, dst_offset: u64, src_offset: u64, nbytes: usize, sig_offset: u64, sig_value: u64, sig_op: SignalOp) -> Result<()> {
        signal::put_signal(&self.heap, &self.topology, self.runtime.as_ref(), pe, dst_offset, src_offset, nbytes, sig_offset, sig_value, sig_op)
    }

    pub fn signal_set(&self, pe: i32, sig_offset: u64, value: u64) -> Result<()> {
        signal::signal_update(&self.heap, &self.topology, self.runtime.as_ref(), pe, sig_offset, value, SignalOp::Set)
    }

    pub fn signal_add(&self, pe: i32, sig_offset: u64, value: u64) -> Result<()> {
        signal::signal_update(&self.heap, &self.topology, self.runtime.as_ref(), pe, sig_offset, value, SignalOp::Add)
    }

    pub fn signal_fetch(&self, sig_offset: u64) -> u64 {
        signal::signal_fetch(&self.heap, sig_offset)
    }

    pub fn wait_until(&self, cond: WaitCond) {
        signal::wait_until(&self.heap, cond)
    }

    pub fn test(&self, cond: WaitCond) -> bool {
        signal::test(&self.heap, cond)
    }

    pub fn wait_until_all(&self, conds: &[WaitCond], status: Option<&[bool]>) {
        signal::wait_until_all(&self.heap, conds, status)
    }

    pub fn test_all(&self, conds: &[WaitCond], status: Option<&[bool]>) -> bool {
        signal::test_all(&self.heap, conds, status)
    }

    pub fn wait_until_any(&self, conds: &[WaitCond], status: Option<&[bool]>) -> Option<usize> {
        signal::wait_until_any(&self.heap, conds, status)
    }

    pub fn test_any(&self, conds: &[WaitCond], status: Option<&[bool]>) -> Option<usize> {
        signal::test_any(&self.heap, conds, status)
    }

    pub fn wait_until_some(&self, conds: &[WaitCond], status: Option<&[bool]>) -> Vec<usize> {
        signal::wait_until_some(&self.heap, conds, status)
    }

    pub fn test_some(&self, conds: &[WaitCond], status: Option<&[bool]>) -> Vec<usize> {
        signal::test_some(&self.heap, conds, status)
    }

    // ---- Ordering (§5) ---------------------------------------------------

    /// `ishmem_quiet`/`ishmem_fence`: no outstanding-NBI queue to drain in
    /// this engine (every `_nbi` call already completed synchronously), so
    /// on the host these are no-ops; in device context they still round-trip
    /// through the ring so the proxy's FIFO ordering is honored relative to
    /// requests queued ahead of them.
    pub fn quiet(&self) {
        if DeviceContext::is_active() {
            let _ = self.ring_roundtrip(Request::new(Op::Quiet, ElemType::None, self.my_pe()));
        }
    }

    pub fn fence(&self) {
        if DeviceContext::is_active() {
            let _ = self.ring_roundtrip(Request::new(Op::Fence, ElemType::None, self.my_pe()));
        }
    }

    // ---- Sync / teams (§4.H) ---------------------------------------------

    pub fn barrier_all(&self) {
        let world = self.team(teams::WORLD).expect("WORLD team always registered");
        collectives::barrier(&world, &self.heap, &self.topology, self.runtime.as_ref());
    }

    pub fn sync_all(&self) {
        self.barrier_all();
    }

    pub fn team_sync(&self, team_id: TeamId) -> Result<()> {
        let team = self.team(team_id).ok_or(IshmemError::InvalidTeam(team_id))?;
        collectives::barrier(&team, &self.heap, &self.topology, self.runtime.as_ref());
        Ok(())
    }

    pub fn team_split_strided(&self, parent_id: TeamId, start: i32, stride: i32, size: i32) -> Result<TeamId> {
        let parent = self.team(parent_id).ok_or(IshmemError::InvalidTeam(parent_id))?;
        let candidate = self.team_pool.local_avail_bitmap().trailing_zeros() as i32;
        let child = teams::team_split_strided(&self.team_pool, &parent, candidate, start, stride, size, self.my_pe(), self.topology.node_size(), &self.heap, self.runtime.as_ref())?;
        let id = child.id();
        self.teams.lock().unwrap().insert(id, Arc::new(child));
        Ok(id)
    }

    pub fn team_split_2d(&self, parent_id: TeamId, xrange: i32) -> Result<(TeamId, TeamId)> {
        let parent = self.team(parent_id).ok_or(IshmemError::InvalidTeam(parent_id))?;
        let bitmap = self.team_pool.local_avail_bitmap();
        let x_id = bitmap.trailing_zeros() as i32;
        let y_id = (bitmap & !(1u64 << x_id)).trailing_zeros() as i32;
        let (xteam, yteam) = teams::team_split_2d(&self.team_pool, &parent, xrange, x_id, y_id, self.my_pe(), self.topology.node_size(), &self.heap, self.runtime.as_ref())?;
        let (xid, yid) = (xteam.id(), yteam.id());
        self.teams.lock().unwrap().insert(xid, Arc::new(xteam));
        self.teams.lock().unwrap().insert(yid, Arc::new(yteam));
        Ok((xid, yid))
    }

    pub fn team_destroy(&self, team_id: TeamId) -> Result<()> {
        let team = self.teams.lock().unwrap().remove(&team_id).ok_or(IshmemError::InvalidTeam(team_id))?;
        teams::team_destroy(&self.team_pool, &team);
        self.runtime.team_destroy(team.members());
        Ok(())
    }

    pub fn team_my_pe(&self, team_id: TeamId) -> Result<i32> {
        Ok(self.team(team_id).ok_or(IshmemError::InvalidTeam(team_id))?.my_pe())
    }

    pub fn team_n_pes(&self, team_id: TeamId) -> Result<i32> {
        Ok(self.team(team_id).ok_or(IshmemError::InvalidTeam(team_id))?.n_pes())
    }

    pub fn team_translate_pe(&self, src_id: TeamId, pe_in_src: i32, dst_id: TeamId) -> Result<i32> {
        let src = self.team(src_id).ok_or(IshmemError::InvalidTeam(src_id))?;
        let dst = self.team(dst_id).ok_or(IshmemError::InvalidTeam(dst_id))?;
        Ok(src.translate_pe(pe_in_src, &dst))
    }

    // ---- Collectives (§4.I) -----------------------------------------------

    pub fn broadcast(&self, team_id: TeamId, root_team_rank: i32, buf: &mut [u8]) -> Result<()> {
        let team = self.team(team_id).ok_or(IshmemError::InvalidTeam(team_id))?;
        collectives::broadcast(&team, root_team_rank, buf, self.runtime.as_ref())
    }

    pub fn fcollect(&self, team_id: TeamId, my_chunk: &[u8]) -> Result<Vec<u8>> {
        let team = self.team(team_id).ok_or(IshmemError::InvalidTeam(team_id))?;
        Ok(collectives::fcollect(&team, my_chunk, self.runtime.as_ref()))
    }

    pub fn collect(&self, team_id: TeamId, my_chunk: &[u8]) -> Result<Vec<u8>> {
        let team = self.team(team_id).ok_or(IshmemError::InvalidTeam(team_id))?;
        Ok(collectives::collect(&team, my_chunk, self.runtime.as_ref()))
    }

    pub fn alltoall(&self, team_id: TeamId, my_data: &[u8]) -> Result<Vec<u8>> {
        let team = self.team(team_id).ok_or(IshmemError::InvalidTeam(team_id))?;
        collectives::alltoall(&team, my_data, self.runtime.as_ref())
    }

    pub fn reduce(&self, team_id: TeamId, op: ReduceOp, elem_type: ElemType, my_data: &[u8]) -> Result<Vec<u8>> {
        let team = self.team(team_id).ok_or(IshmemError::InvalidTeam(team_id))?;
        collectives::reduce_chunked(&team, op, elem_type, my_data, self.runtime.as_ref(), self.config.reduce_buffer_size)
    }

    pub fn scan(&self, team_id: TeamId, inclusive: bool, elem_type: ElemType, my_value: &[u8]) -> Result<Vec<u8>> {
        let team = self.team(team_id).ok_or(IshmemError::InvalidTeam(team_id))?;
        collectives::scan(&team, inclusive, elem_type, my_value, self.runtime.as_ref())
    }

    // ---- On-queue adapter (§4.J) -------------------------------------------

    pub fn queue_create(&self) -> QueueId {
        self.queues.create()
    }

    pub fn queue_destroy(&self, id: QueueId) {
        self.queues.destroy(id)
    }

    /// `*_on_queue`: enqueue `job` on `id`, ordered after whatever was
    /// previously submitted to that queue.
    pub fn submit_on_queue(&self, id: QueueId, job: impl FnOnce() + Send + 'static) -> Option<QueueEvent> {
        self.queues.submit(id, job)
    }

    // ---- Diagnostics (§4.D "library-provided handlers") --------------------

    pub fn print(&self, value: u64) {
        if DeviceContext::is_active() {
            let mut req = Request::new(Op::Print, ElemType::None, self.my_pe());
            req.bsize_or_value = value;
            let _ = self.ring_roundtrip_ignore_status(req);
        } else {
            log::info!("ishmem_print from pe {}: value={value}", self.my_pe());
        }
    }

    pub fn timestamp(&self) -> u64 {
        if DeviceContext::is_active() {
            let req = Request::new(Op::Timestamp, ElemType::None, self.my_pe());
            let sequence = self.ring.submit(req);
            let completion = self.ring.wait_completion(sequence, self.config.proxy_spin_budget());
            self.ring.free(sequence);
            completion.ret
        } else {
            std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or(0)
        }
    }

    pub fn nop(&self) {
        if DeviceContext::is_active() {
            let _ = self.ring_roundtrip_ignore_status(Request::new(Op::Nop, ElemType::None, self.my_pe()));
        }
    }

    pub fn debug_test(&self) -> bool {
        if DeviceContext::is_active() {
            self.ring_roundtrip_ignore_status(Request::new(Op::DebugTest, ElemType::None, self.my_pe())).is_ok()
        } else {
            true
        }
    }

    fn ring_roundtrip_ignore_status(&self, req: Request) -> Result<()> {
        self.ring_roundtrip(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runtime::loopback::LoopbackRuntime;
    use std::sync::Arc as StdArc;

    fn make_engine(fabric: &StdArc<runtime::loopback::LoopbackFabric>, pe: i32) -> Arc<Engine> {
        std::env::set_var("ISHMEM_SYMMETRIC_SIZE", "65536");
        let rt = LoopbackRuntime::attach(fabric, pe);
        let engine = Engine::init(Box::new(rt));
        fabric.register_heap(pe, engine.heap().base(), engine.heap().size());
        engine
    }

    #[test]
    fn put_get_round_trip_host_mainline() {
        let fabric = LoopbackRuntime::new_fabric(2, 1);
        let e0 = make_engine(&fabric, 0);
        let e1 = make_engine(&fabric, 1);

        let off = e0.malloc(64).unwrap();
        unsafe { *e0.heap().ptr_at(off).cast::<u32>() = 0xfeed_face };
        e0.put(1, off as u64, off as u64, ElemType::Uint32, 1, 1, 1, 1).unwrap();
        assert_eq!(unsafe { *e1.heap().ptr_at(off).cast::<u32>() }, 0xfeed_face);

        e0.finalize();
        e1.finalize();
    }

    #[test]
    fn amo_fetch_add_is_consistent_across_pes() {
        let fabric = LoopbackRuntime::new_fabric(2, 1);
        let e0 = make_engine(&fabric, 0);
        let e1 = make_engine(&fabric, 1);
        let off = e0.malloc(8).unwrap();
        let _ = e1.malloc(8).unwrap();

        let prev = e0.amo(1, off, ElemType::Uint32, AmoKind::Add, 5, None).unwrap();
        assert_eq!(prev, 0);
        let prev2 = e0.amo(1, off, ElemType::Uint32, AmoKind::Add, 5, None).unwrap();
        assert_eq!(prev2, 5);

        e0.finalize();
        e1.finalize();
    }

    #[test]
    fn reduce_sums_every_pe_contribution() {
        let fabric = LoopbackRuntime::new_fabric(3, 3);
        let engines: Vec<_> = (0..3).map(|pe| make_engine(&fabric, pe)).collect();
        let handles: Vec<_> = engines
            .into_iter()
            .map(|engine| {
                std::thread::spawn(move || {
                    let my_pe = engine.my_pe() as u32;
                    let out = engine.reduce(teams::WORLD, ReduceOp::Sum, ElemType::Uint32, &my_pe.to_le_bytes()).unwrap();
                    let sum = u32::from_le_bytes(out.try_into().unwrap());
                    engine.finalize();
                    sum
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), 0 + 1 + 2);
        }
    }
}
