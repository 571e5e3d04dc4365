//! Team data model, the psync dissemination sync algorithm, and team
//! split/destroy/translate (§4.H).
//!
//! A team's two psync cells live in the symmetric heap (allocated once, at
//! matching offsets on every member, exactly like any other collective
//! `malloc`) rather than as private per-PE state, so the dissemination
//! algorithm can reach a peer's cell the same way the RMA fast path reaches
//! any other symmetric offset: through [`crate::heap::Topology::ptr`].

use crate::error::{IshmemError, Result};
use crate::heap::{SymmetricHeap, Topology};
use crate::runtime::{ReduceOp, Runtime};
use ishmem_wire::ElemType;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;

pub type TeamId = i32;

pub const WORLD: TeamId = 0;
pub const SHARED: TeamId = 1;
pub const NODE: TeamId = 2;
pub const INVALID: TeamId = -1;

/// Psync cells rotate per sync so back-to-back syncs don't interfere (§3).
pub const N_PSYNCS_PER_TEAM: usize = 2;

/// A sub-group of PEs plus its sync/reduce scratch state.
pub struct Team {
    id: TeamId,
    /// Absolute world PE numbers, in team-rank order. The single source of
    /// truth for membership; `start`/`stride`/`size` below are descriptive
    /// metadata only (kept because spec.md's team record carries them).
    members: Vec<i32>,
    start: i32,
    stride: i32,
    size: i32,
    my_pe_in_team: i32,
    last_pe: i32,
    only_intra_node: bool,
    n_local_pes: i32,
    psync_offset: usize,
    psync_idx: AtomicUsize,
    reduce_scratch: Mutex<Vec<u8>>,
    fcollect_nelems_scratch: Mutex<Vec<usize>>,
}

impl Team {
    pub fn new(
        id: TeamId,
        members: Vec<i32>,
        my_world_pe: i32,
        only_intra_node: bool,
        n_local_pes: i32,
        psync_offset: usize,
    ) -> Self {
        let my_pe_in_team = members.iter().position(|&p| p == my_world_pe).map(|r| r as i32).unwrap_or(-1);
        let last_pe = *members.last().unwrap_or(&-1);
        let start = *members.first().unwrap_or(&-1);
        let stride = if members.len() > 1 { members[1] - members[0] } else { 1 };
        let size = members.len() as i32;
        Team {
            id,
            members,
            start,
            stride,
            size,
            my_pe_in_team,
            last_pe,
            only_intra_node,
            n_local_pes,
            psync_offset,
            psync_idx: AtomicUsize::new(0),
            reduce_scratch: Mutex::new(Vec::new()),
            fcollect_nelems_scratch: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> TeamId {
        self.id
    }

    pub fn members(&self) -> &[i32] {
        &self.members
    }

    pub fn my_pe(&self) -> i32 {
        self.my_pe_in_team
    }

    pub fn n_pes(&self) -> i32 {
        self.size
    }

    pub fn last_pe(&self) -> i32 {
        self.last_pe
    }

    pub fn only_intra_node(&self) -> bool {
        self.only_intra_node
    }

    pub fn n_local_pes(&self) -> i32 {
        self.n_local_pes
    }

    pub fn rank_of(&self, pe: i32) -> Option<i32> {
        self.members.iter().position(|&p| p == pe).map(|r| r as i32)
    }

    /// `team_translate_pe`: map `pe_in_src`'s rank in `self` to its rank in
    /// `dst`, or `-1` if not a `dst` member.
    pub fn translate_pe(&self, pe_in_src: i32, dst: &Team) -> i32 {
        match self.members.get(pe_in_src as usize) {
            Some(&global) => dst.rank_of(global).unwrap_or(-1),
            None => -1,
        }
    }

    pub fn reduce_scratch(&self, min_len: usize) -> std::sync::MutexGuard<'_, Vec<u8>> {
        let mut guard = self.reduce_scratch.lock().unwrap();
        if guard.len() < min_len {
            guard.resize(min_len, 0);
        }
        guard
    }

    pub fn fcollect_scratch(&self, min_len: usize) -> std::sync::MutexGuard<'_, Vec<usize>> {
        let mut guard = self.fcollect_nelems_scratch.lock().unwrap();
        if guard.len() < min_len {
            guard.resize(min_len, 0);
        }
        guard
    }

    /// `team_sync`: the dissemination psync algorithm for intra-node teams
    /// (§4.I "sync (team)"), proxy `TEAM_SYNC` otherwise.
    pub fn sync(&self, heap: &SymmetricHeap, topology: &Topology, runtime: &dyn Runtime) {
        if !self.only_intra_node {
            runtime.barrier(&self.members);
            return;
        }
        let idx = self.psync_idx.load(Ordering::Relaxed) % N_PSYNCS_PER_TEAM;
        let cell_offset = self.psync_offset + idx * 8;
        let local_ptr = heap.ptr_at(cell_offset);

        for &peer in &self.members {
            if peer == topology.my_pe() {
                continue;
            }
            let peer_ptr = topology
                .ptr(local_ptr, peer)
                .expect("only_intra_node team member must be mappable");
            let atomic = unsafe { &*(peer_ptr as *const AtomicI64) };
            atomic.fetch_add(1, Ordering::Relaxed);
        }

        let local_atomic = unsafe { &*(local_ptr as *const AtomicI64) };
        while local_atomic.load(Ordering::SeqCst) < self.size as i64 {
            std::hint::spin_loop();
        }
        local_atomic.store(0, Ordering::SeqCst);
        self.psync_idx.fetch_add(1, Ordering::Relaxed);
    }
}

/// `pe_in_active_set`: whether `world_pe` is a member of the strided range
/// `(start, stride, size)` (§4.H step 1).
pub fn pe_in_active_set(world_pe: i32, start: i32, stride: i32, size: i32) -> bool {
    if stride <= 0 || size <= 0 {
        return false;
    }
    let diff = world_pe - start;
    diff >= 0 && diff % stride == 0 && diff / stride < size
}

/// Bitmap of free team-pool slots, `[0, teams_max)`, bounded to 64 slots so
/// it can be AND/MAX-reduced as a single `u64` (§4.H step 2). `teams_max`
/// above 64 is clamped; `ISHMEM_TEAMS_MAX` defaults to 32 (§4.K), well
/// within range.
pub struct TeamPool {
    capacity: usize,
    avail: Mutex<u64>,
}

impl TeamPool {
    /// `reserved` predefined teams (WORLD/SHARED/NODE) occupy the
    /// low-order bits and are never freed.
    pub fn new(teams_max: usize, reserved: usize) -> Self {
        let capacity = teams_max.min(64);
        let mut bits = u64::MAX;
        if capacity < 64 {
            bits &= (1u64 << capacity) - 1;
        }
        bits &= !((1u64 << reserved) - 1);
        TeamPool {
            capacity,
            avail: Mutex::new(bits),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn local_avail_bitmap(&self) -> u64 {
        *self.avail.lock().unwrap()
    }

    fn try_reserve(&self, slot: usize) -> bool {
        let mut avail = self.avail.lock().unwrap();
        let mask = 1u64 << slot;
        if *avail & mask != 0 {
            *avail &= !mask;
            true
        } else {
            false
        }
    }

    pub fn release(&self, slot: usize) {
        let mut avail = self.avail.lock().unwrap();
        *avail |= 1u64 << slot;
    }
}

/// `team_split_strided`: collective over `parent`. `start`/`stride`/`size`
/// address PEs by *rank within `parent`*, mirroring spec.md's definition
/// (translated to world PE numbers via `parent.members()`).
pub fn team_split_strided(
    pool: &TeamPool,
    parent: &Team,
    child_id: TeamId,
    start: i32,
    stride: i32,
    size: i32,
    my_world_pe: i32,
    node_size: i32,
    heap: &SymmetricHeap,
    runtime: &dyn Runtime,
) -> Result<Team> {
    let my_rank_in_parent = parent.rank_of(my_world_pe).ok_or(IshmemError::InvalidTeam(parent.id()))?;
    let is_member = pe_in_active_set(my_rank_in_parent, start, stride, size);

    let (slot, ok) = if is_member {
        let children: Vec<i32> = (0..size).map(|k| parent.members()[(start + k * stride) as usize]).collect();
        let my_avail = pool.local_avail_bitmap();
        let mut combined_bytes = [0u8; 8];
        runtime.reduce(&children, ReduceOp::And, ElemType::Uint64, &my_avail.to_le_bytes(), &mut combined_bytes);
        let combined = u64::from_le_bytes(combined_bytes);
        let free_bit = combined.trailing_zeros() as usize;
        if free_bit < pool.capacity() && pool.try_reserve(free_bit) {
            let _ = runtime.team_split_strided(&children);
            (free_bit, true)
        } else {
            (usize::MAX, false)
        }
    } else {
        (usize::MAX, false)
    };

    let mut disseminate = [0u8; 4];
    disseminate.copy_from_slice(&(ok as i32).to_le_bytes());
    let mut disseminated = [0u8; 4];
    runtime.reduce(parent.members(), ReduceOp::Max, ElemType::Int32, &disseminate, &mut disseminated);
    let global_ok = i32::from_le_bytes(disseminated) != 0;

    if !global_ok {
        if ok {
            pool.release(slot);
        }
        return Err(IshmemError::InvalidTeam(INVALID));
    }
    if !is_member {
        return Err(IshmemError::InvalidTeam(INVALID));
    }

    let children: Vec<i32> = (0..size).map(|k| parent.members()[(start + k * stride) as usize]).collect();
    let only_intra = node_size > 0
        && children.iter().all(|&p| p / node_size == my_world_pe / node_size);
    let n_local = if only_intra { children.len() as i32 } else { 0 };
    let psync_offset = heap.malloc(N_PSYNCS_PER_TEAM * 8)?;
    Ok(Team::new(child_id, children, my_world_pe, only_intra, n_local, psync_offset))
}

/// `team_split_2d`: splits `parent` into an `xrange`-wide row team and a
/// matching column team, clamping `xrange` to `parent`'s size when it would
/// otherwise exceed it (§4.H / §9 Open Question resolution).
pub fn team_split_2d(
    pool: &TeamPool,
    parent: &Team,
    xrange: i32,
    x_id: TeamId,
    y_id: TeamId,
    my_world_pe: i32,
    node_size: i32,
    heap: &SymmetricHeap,
    runtime: &dyn Runtime,
) -> Result<(Team, Team)> {
    let parent_size = parent.n_pes();
    let xrange = xrange.min(parent_size).max(1);
    let my_rank = parent.rank_of(my_world_pe).ok_or(IshmemError::InvalidTeam(parent.id()))?;

    let x_start = (my_rank / xrange) * xrange;
    let x_size = xrange.min(parent_size - x_start);
    let xteam = team_split_strided(pool, parent, x_id, x_start, 1, x_size, my_world_pe, node_size, heap, runtime)?;

    let y_start = my_rank % xrange;
    let y_size = (parent_size - y_start + xrange - 1) / xrange;
    let yteam = team_split_strided(pool, parent, y_id, y_start, xrange, y_size, my_world_pe, node_size, heap, runtime)?;

    Ok((xteam, yteam))
}

pub fn team_destroy(pool: &TeamPool, team: &Team) {
    if team.id() > NODE {
        pool.release(team.id() as usize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pe_in_active_set_matches_strided_membership() {
        assert!(pe_in_active_set(4, 0, 2, 4));
        assert!(!pe_in_active_set(3, 0, 2, 4));
        assert!(!pe_in_active_set(8, 0, 2, 4));
    }

    #[test]
    fn team_pool_reserves_and_releases() {
        let pool = TeamPool::new(8, 3);
        assert_eq!(pool.local_avail_bitmap().trailing_zeros(), 3);
        assert!(pool.try_reserve(3));
        assert_eq!(pool.local_avail_bitmap().trailing_zeros(), 4);
        pool.release(3);
        assert_eq!(pool.local_avail_bitmap().trailing_zeros(), 3);
    }

    #[test]
    fn translate_pe_maps_between_teams() {
        let world = Team::new(WORLD, vec![0, 1, 2, 3], 0, true, 4, 0);
        let evens = Team::new(3, vec![0, 2], 0, true, 2, 16);
        assert_eq!(world.translate_pe(2, &evens), 1);
        assert_eq!(world.translate_pe(1, &evens), -1);
    }
}
