//! The external scale-out runtime plugin contract (§6).
//!
//! Real ISHMEM loads this from a shared library named by `*_LIB_NAME` and
//! calls through a function-pointer grid. Process bootstrap, dynamic
//! library loading, and the `OPENSHMEM`/`MPI`/`PMI` backends themselves are
//! external collaborators out of scope for this crate (§1) — what *is* in
//! scope is the shape of the contract and a couple of concrete
//! implementations the engine can run against: [`loopback::LoopbackRuntime`]
//! (single process, PEs are threads) and [`shm::ShmRuntime`] (multi-process,
//! PEs are OS processes rendezvousing over POSIX shared memory).

pub mod loopback;
pub mod shm;

use crate::error::Result;
use ishmem_wire::ElemType;

/// Reduction operator, as enumerated in spec.md §4.I.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    And,
    Or,
    Xor,
    Max,
    Min,
    Sum,
    Prod,
}

impl ReduceOp {
    /// AND/OR/XOR are integer-only; MAX/MIN/SUM/PROD accept integer and
    /// floating types (§4.I).
    pub fn supports(self, elem_type: ElemType) -> bool {
        match self {
            ReduceOp::And | ReduceOp::Or | ReduceOp::Xor => elem_type.is_integer(),
            ReduceOp::Max | ReduceOp::Min | ReduceOp::Sum | ReduceOp::Prod => elem_type.is_numeric(),
        }
    }
}

/// The plugin contract a scale-out transport must satisfy (§6). All
/// collective-shaped methods here are the **proxy fallback** stratum from
/// §4.I: the engine only calls into them when a team (or pair of PEs) is
/// not fully intra-node, or for operations with no on-device fast path at
/// all (scan, per §4.I/§9).
///
/// `members` is always the team's global PE list in rank order; this
/// trait does not carry an opaque plugin-side team handle because neither
/// concrete backend here needs one to address a PE subset (see DESIGN.md).
pub trait Runtime: Send + Sync {
    fn my_pe(&self) -> i32;
    fn n_pes(&self) -> i32;
    /// Rank within this PE's node.
    fn node_rank(&self, pe: i32) -> i32;
    fn node_size(&self) -> i32;

    /// Collective barrier over `members`. Every PE in `members` must call
    /// this with the same `members` list.
    fn barrier(&self, members: &[i32]);

    /// `broadcast`: `buf` holds `root`'s data on input for the root PE and
    /// is overwritten with it on every member on return.
    fn broadcast(&self, members: &[i32], root: i32, buf: &mut [u8]);

    /// `fcollect`: every member contributes an equal-size `my_chunk`; `out`
    /// must be `members.len() * my_chunk.len()` bytes and receives each
    /// member's chunk at `out[rank * chunk_len ..]`, in team-rank order.
    fn fcollect(&self, members: &[i32], my_chunk: &[u8], out: &mut [u8]);

    /// `collect`: members may contribute different-length chunks; returns
    /// the concatenation in team-rank order.
    fn collect(&self, members: &[i32], my_chunk: &[u8]) -> Vec<u8>;

    /// Element-wise reduction of `my_chunk` across `members` into `out`
    /// (same length as `my_chunk`), interpreting bytes per `elem_type`.
    fn reduce(&self, members: &[i32], op: ReduceOp, elem_type: ElemType, my_chunk: &[u8], out: &mut [u8]);

    /// SUM inclusive/exclusive scan (§4.I: "always routed through proxy").
    fn scan(&self, members: &[i32], inclusive: bool, elem_type: ElemType, my_value: &[u8], out: &mut [u8]);

    /// Register (or validate) a child team's membership with the plugin.
    /// Real backends would create a communicator/group handle here; our
    /// backends only need to confirm every member agrees on the set.
    fn team_split_strided(&self, members: &[i32]) -> Result<()>;
    fn team_destroy(&self, members: &[i32]);

    /// Proxy fallback for an RMA op the engine could not satisfy on the
    /// fast path (peer not mappable). Returns fetched bytes for `GET`-shaped
    /// ops, empty otherwise.
    fn proxy_put(&self, dest_pe: i32, dst_offset: u64, data: &[u8]) -> Result<()>;
    fn proxy_get(&self, src_pe: i32, src_offset: u64, len: usize) -> Result<Vec<u8>>;

    /// Proxy fallback for an AMO. `cond` is `Some` only for compare_swap.
    /// Returns the pre-operation value (used by fetching variants; ignored
    /// otherwise).
    fn proxy_amo(
        &self,
        dest_pe: i32,
        offset: u64,
        elem_type: ElemType,
        op: AmoKind,
        value: u64,
        cond: Option<u64>,
    ) -> Result<u64>;
}

/// Which atomic operation a proxied AMO request performs. Mirrors the
/// `AMO_*` tags in §3 without re-deriving them from `ishmem_wire::Op` (the
/// wire tag also distinguishes fetching/non-fetching/`_nbi`, which the
/// runtime backend does not need to know about).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmoKind {
    Fetch,
    Set,
    Inc,
    Add,
    And,
    Or,
    Xor,
    Swap,
    CompareSwap,
}

/// Exclusive or inclusive prefix sum over `counts`, used by `collect`'s
/// offset computation (§4.I: "each PE computes the prefix-sum offset").
pub fn prefix_sum(counts: &[usize]) -> Vec<usize> {
    let mut out = Vec::with_capacity(counts.len());
    let mut running = 0usize;
    for &c in counts {
        out.push(running);
        running += c;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_sum_is_exclusive() {
        assert_eq!(prefix_sum(&[3, 1, 2]), vec![0, 3, 4]);
        assert_eq!(prefix_sum(&[]), Vec::<usize>::new());
    }

    #[test]
    fn reduce_op_support_matrix() {
        assert!(ReduceOp::And.supports(ElemType::Uint32));
        assert!(!ReduceOp::And.supports(ElemType::Float32));
        assert!(ReduceOp::Sum.supports(ElemType::Float64));
    }
}
