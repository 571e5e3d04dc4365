//! The host proxy's upcall dispatch table (§4.C/§4.D): a grid indexed by
//! `(Op, ElemType)` that the proxy consults once per serviced request,
//! exactly as `ishmemi_proxy_funcs[op][type]` does in
//! `original_source/src/proxy_func.cpp`.
//!
//! Unlike the C++ original — where each `(op, type)` cell is a distinct
//! template instantiation — one handler here serves every element type for
//! a given op, since the type is read out of the request as data rather
//! than selected at compile time (§1: "per-type API surface expansion is
//! mechanical and out of scope"). The grid shape is kept anyway: it is
//! still how a corrupted or unsupported `(op, type)` pair is told apart
//! from a real gap in what the proxy implements.
//!
//! Collectives (`BROADCAST`/`ALLTOALL`/`COLLECT`/`FCOLLECT`/`*_REDUCE`/
//! `*SCAN`) and signalling (`PUT_SIGNAL`/`SIGNAL_*`) never reach this table:
//! see DESIGN.md for why (collectives always address a whole team and go
//! straight to [`crate::runtime::Runtime`]; signalling is composed from a
//! `Put` plus an `Amo*` ring request rather than carried as one request,
//! since [`ishmem_wire::Request`] has no room left for a signal offset on
//! top of an RMA payload's own fields). Both tags still decode cleanly
//! through [`ishmem_wire::Op`] for interface completeness; this engine's own
//! producers simply never emit them onto the ring.

use crate::runtime::AmoKind;
use crate::Engine;
use ishmem_wire::{ALL_OPS, ALL_TYPES, Completion, ElemType, Op, Request};

type Handler = fn(&Engine, &Request) -> Completion;

fn ok(sequence: u16) -> Completion {
    let mut c = Completion::pending(sequence);
    c.set_status(0);
    c
}

fn err(sequence: u16) -> Completion {
    let mut c = Completion::pending(sequence);
    c.set_status(-1);
    c
}

fn scalar(sequence: u16, bits: u64) -> Completion {
    let mut c = Completion::pending(sequence);
    c.set_scalar_bits(bits);
    c
}

fn handle_put(engine: &Engine, req: &Request) -> Completion {
    let ty = req.elem_type().unwrap_or(ElemType::None);
    let nbytes = req.nelems as usize * ty.size().max(1);
    match crate::rma::local_put(engine.heap(), engine.topology(), engine.runtime(), req.dest_pe, req.dst, req.src, nbytes) {
        Ok(()) => ok(req.sequence),
        Err(_) => err(req.sequence),
    }
}

fn handle_get(engine: &Engine, req: &Request) -> Completion {
    let ty = req.elem_type().unwrap_or(ElemType::None);
    let nbytes = req.nelems as usize * ty.size().max(1);
    match crate::rma::local_get(engine.heap(), engine.topology(), engine.runtime(), req.dest_pe, req.dst, req.src, nbytes) {
        Ok(()) => ok(req.sequence),
        Err(_) => err(req.sequence),
    }
}

fn handle_iput(engine: &Engine, req: &Request) -> Completion {
    let ty = req.elem_type().unwrap_or(ElemType::None);
    let bsize = req.bsize_or_value.max(1) as usize;
    match crate::rma::local_iput(
        engine.heap(),
        engine.topology(),
        engine.runtime(),
        req.dest_pe,
        req.dst,
        req.src,
        ty.size().max(1),
        req.dst_stride,
        req.src_stride,
        bsize,
        req.nelems as usize,
    ) {
        Ok(()) => ok(req.sequence),
        Err(_) => err(req.sequence),
    }
}

fn handle_iget(engine: &Engine, req: &Request) -> Completion {
    let ty = req.elem_type().unwrap_or(ElemType::None);
    let bsize = req.bsize_or_value.max(1) as usize;
    match crate::rma::local_iget(
        engine.heap(),
        engine.topology(),
        engine.runtime(),
        req.dest_pe,
        req.dst,
        req.src,
        ty.size().max(1),
        req.dst_stride,
        req.src_stride,
        bsize,
        req.nelems as usize,
    ) {
        Ok(()) => ok(req.sequence),
        Err(_) => err(req.sequence),
    }
}

fn handle_p(engine: &Engine, req: &Request) -> Completion {
    let ty = req.elem_type().unwrap_or(ElemType::None);
    match crate::rma::local_p(engine.heap(), engine.topology(), engine.runtime(), req.dest_pe, req.dst, ty.size().max(1), req.bsize_or_value) {
        Ok(()) => ok(req.sequence),
        Err(_) => err(req.sequence),
    }
}

fn handle_g(engine: &Engine, req: &Request) -> Completion {
    let ty = req.elem_type().unwrap_or(ElemType::None);
    match crate::rma::local_g(engine.heap(), engine.topology(), engine.runtime(), req.dest_pe, req.src, ty.size().max(1)) {
        Ok(bits) => scalar(req.sequence, bits),
        Err(_) => err(req.sequence),
    }
}

/// One table entry per `AMO_*` tag; `cond` comes from `req.src` (repurposed:
/// AMOs need no source address, only an immediate, so the otherwise-unused
/// address field carries the compare_swap comparand — see DESIGN.md).
fn amo_kind_of(op: Op) -> Option<AmoKind> {
    use Op::*;
    match op {
        AmoFetch | AmoFetchNbi => Some(AmoKind::Fetch),
        AmoSet => Some(AmoKind::Set),
        AmoInc => Some(AmoKind::Inc),
        AmoFetchInc | AmoFetchIncNbi => Some(AmoKind::Inc),
        AmoAdd => Some(AmoKind::Add),
        AmoFetchAdd | AmoFetchAddNbi => Some(AmoKind::Add),
        AmoAnd => Some(AmoKind::And),
        AmoFetchAnd | AmoFetchAndNbi => Some(AmoKind::And),
        AmoOr => Some(AmoKind::Or),
        AmoFetchOr | AmoFetchOrNbi => Some(AmoKind::Or),
        AmoXor => Some(AmoKind::Xor),
        AmoFetchXor | AmoFetchXorNbi => Some(AmoKind::Xor),
        AmoSwap | AmoSwapNbi => Some(AmoKind::Swap),
        AmoCompareSwap | AmoCompareSwapNbi => Some(AmoKind::CompareSwap),
        _ => None,
    }
}

fn handle_amo(engine: &Engine, req: &Request) -> Completion {
    let ty = req.elem_type().unwrap_or(ElemType::None);
    let op = req.op().ok().and_then(amo_kind_of);
    let Some(op) = op else { return err(req.sequence) };
    let cond = matches!(op, AmoKind::CompareSwap).then_some(req.src);
    match crate::amo::atomic_op(engine.heap(), engine.topology(), engine.runtime(), req.dest_pe, req.dst as usize, ty, op, req.bsize_or_value, cond) {
        Ok(bits) => scalar(req.sequence, bits),
        Err(_) => err(req.sequence),
    }
}

fn handle_barrier(engine: &Engine, req: &Request) -> Completion {
    match engine.team(req.dest_pe) {
        Some(team) => {
            crate::collectives::barrier(&team, engine.heap(), engine.topology(), engine.runtime());
            ok(req.sequence)
        }
        None => err(req.sequence),
    }
}

fn handle_quiet_or_fence(_engine: &Engine, req: &Request) -> Completion {
    // Every local_* call above already completes synchronously before its
    // ring completion is posted, so there is no outstanding-NBI queue for
    // quiet/fence to drain here (§9 "no distinct async execution model").
    ok(req.sequence)
}

fn handle_nop(_engine: &Engine, req: &Request) -> Completion {
    ok(req.sequence)
}

fn handle_print(_engine: &Engine, req: &Request) -> Completion {
    log::info!("ishmem_print from pe {}: value={}", req.dest_pe, req.bsize_or_value);
    ok(req.sequence)
}

fn handle_timestamp(_engine: &Engine, req: &Request) -> Completion {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    scalar(req.sequence, nanos)
}

fn handle_debug_test(_engine: &Engine, req: &Request) -> Completion {
    ok(req.sequence)
}

/// The `(Op, ElemType)` upcall grid, built once at proxy start-up.
pub struct UpcallTable {
    rows: Vec<Vec<Option<Handler>>>,
}

impl UpcallTable {
    pub fn build() -> Self {
        let mut rows: Vec<Vec<Option<Handler>>> = ALL_OPS.iter().map(|_| vec![None; ALL_TYPES.len()]).collect();
        let op_idx = |op: Op| ALL_OPS.iter().position(|&o| o == op).expect("op in ALL_OPS");
        let ty_idx = |ty: ElemType| ALL_TYPES.iter().position(|&t| t == ty).expect("type in ALL_TYPES");

        let mut register_all_types = |op: Op, f: Handler| {
            let oi = op_idx(op);
            for &ty in ALL_TYPES {
                rows[oi][ty_idx(ty)] = Some(f);
            }
        };

        register_all_types(Op::Nop, handle_nop);
        register_all_types(Op::DebugTest, handle_debug_test);
        register_all_types(Op::Print, handle_print);
        register_all_types(Op::Timestamp, handle_timestamp);
        register_all_types(Op::TimestampNbi, handle_timestamp);

        register_all_types(Op::Put, handle_put);
        register_all_types(Op::Get, handle_get);
        register_all_types(Op::PutNbi, handle_put);
        register_all_types(Op::GetNbi, handle_get);
        register_all_types(Op::Iput, handle_iput);
        register_all_types(Op::Iget, handle_iget);
        register_all_types(Op::Ibput, handle_iput);
        register_all_types(Op::Ibget, handle_iget);
        register_all_types(Op::P, handle_p);
        register_all_types(Op::G, handle_g);

        for &op in &[
            Op::AmoFetch,
            Op::AmoSet,
            Op::AmoInc,
            Op::AmoFetchInc,
            Op::AmoAdd,
            Op::AmoFetchAdd,
            Op::AmoAnd,
            Op::AmoFetchAnd,
            Op::AmoOr,
            Op::AmoFetchOr,
            Op::AmoXor,
            Op::AmoFetchXor,
            Op::AmoSwap,
            Op::AmoCompareSwap,
            Op::AmoFetchNbi,
            Op::AmoFetchIncNbi,
            Op::AmoFetchAddNbi,
            Op::AmoFetchAndNbi,
            Op::AmoFetchOrNbi,
            Op::AmoFetchXorNbi,
            Op::AmoSwapNbi,
            Op::AmoCompareSwapNbi,
        ] {
            register_all_types(op, handle_amo);
        }

        register_all_types(Op::Barrier, handle_barrier);
        register_all_types(Op::Quiet, handle_quiet_or_fence);
        register_all_types(Op::Fence, handle_quiet_or_fence);
        register_all_types(Op::TeamSync, handle_barrier);

        UpcallTable { rows }
    }

    /// Look up and run the handler for `req`'s `(op, type)`. `None` means
    /// either a ring request for an op this proxy deliberately never
    /// services (a collective or signal tag, see module docs) or a
    /// corrupted request.
    pub fn dispatch(&self, engine: &Engine, req: &Request) -> Completion {
        let Ok(op) = req.op() else { return err(req.sequence) };
        let Ok(ty) = req.elem_type() else { return err(req.sequence) };
        let oi = ALL_OPS.iter().position(|&o| o == op).unwrap();
        let ti = ALL_TYPES.iter().position(|&t| t == ty).unwrap();
        match self.rows[oi][ti] {
            Some(f) => f(engine, req),
            None => err(req.sequence),
        }
    }
}

impl Default for UpcallTable {
    fn default() -> Self {
        Self::build()
    }
}
