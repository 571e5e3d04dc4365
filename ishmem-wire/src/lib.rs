//! Shared wire-format definitions for the ishmem request ring.
//!
//! This crate has no knowledge of the engine, the proxy, or any particular
//! runtime backend: it only defines the 64-byte [`Request`]/[`Completion`]
//! records that cross the host/device boundary, and the `(op, type)` tags
//! carried inside them. Keeping this as its own crate means a future
//! device-side build (real GPU kernels) can depend on the wire format alone
//! without pulling in the host proxy, the symmetric heap, or std-only code.
//!
//! # Wire layout
//!
//! ```text
//! Request (64 bytes, little-endian):
//!   offset 0  uint16 sequence
//!          2  uint8  op
//!          3  uint8  type
//!          4  uint16 completion_index
//!          8  int32  dest_pe / team
//!          12 int32  root
//!          16 uintptr src
//!          24 uintptr dst
//!          32 uint64 nelems
//!          40 int64  dst_stride
//!          48 int64  src_stride
//!          56 uint64 bsize / value
//!
//! Completion (64 bytes):
//!   offset 0  uint16 sequence
//!          2  uint8  lock
//!          3  uint8  _pad
//!          8  uint64 ret (status in low 32 bits, or typed scalar bits)
//!          16..64    reserved padding to fill the cache line
//! ```

use bytemuck::{Pod, Zeroable};
use std::fmt;

/// Number of slots in the request ring. Must be a power of two (§3 Invariants).
pub const RING_SIZE: usize = 1024;

/// `RING_SIZE - 1`, used to mask a monotonically increasing index into a slot.
pub const RING_MASK: u16 = (RING_SIZE - 1) as u16;

/// Operation tag carried by a [`Request`]. Mirrors spec.md §3's op enumeration;
/// every op that can cross the ring gets one variant. `wait_until`/`test` and
/// their array forms never cross the ring (they are pure spin predicates), so
/// they have no tag here.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Nop = 0,
    DebugTest = 1,
    Print = 2,
    Timestamp = 3,
    TimestampNbi = 4,

    Put = 10,
    Get = 11,
    PutNbi = 12,
    GetNbi = 13,
    Iput = 14,
    Iget = 15,
    Ibput = 16,
    Ibget = 17,
    P = 18,
    G = 19,

    AmoFetch = 30,
    AmoSet = 31,
    AmoInc = 32,
    AmoFetchInc = 33,
    AmoAdd = 34,
    AmoFetchAdd = 35,
    AmoAnd = 36,
    AmoFetchAnd = 37,
    AmoOr = 38,
    AmoFetchOr = 39,
    AmoXor = 40,
    AmoFetchXor = 41,
    AmoSwap = 42,
    AmoCompareSwap = 43,
    AmoFetchNbi = 44,
    AmoFetchIncNbi = 45,
    AmoFetchAddNbi = 46,
    AmoFetchAndNbi = 47,
    AmoFetchOrNbi = 48,
    AmoFetchXorNbi = 49,
    AmoSwapNbi = 50,
    AmoCompareSwapNbi = 51,

    PutSignal = 60,
    SignalSet = 61,
    SignalAdd = 62,
    SignalFetch = 63,

    Barrier = 70,
    Quiet = 71,
    Fence = 72,
    TeamSync = 73,

    Broadcast = 80,
    Alltoall = 81,
    Collect = 82,
    Fcollect = 83,

    AndReduce = 90,
    OrReduce = 91,
    XorReduce = 92,
    MaxReduce = 93,
    MinReduce = 94,
    SumReduce = 95,
    ProdReduce = 96,

    Inscan = 100,
    Exscan = 101,
}

/// Every `Op` that exists, for building dispatch tables without duplicating
/// the list by hand.
pub const ALL_OPS: &[Op] = &[
    Op::Nop,
    Op::DebugTest,
    Op::Print,
    Op::Timestamp,
    Op::TimestampNbi,
    Op::Put,
    Op::Get,
    Op::PutNbi,
    Op::GetNbi,
    Op::Iput,
    Op::Iget,
    Op::Ibput,
    Op::Ibget,
    Op::P,
    Op::G,
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
    Op::PutSignal,
    Op::SignalSet,
    Op::SignalAdd,
    Op::SignalFetch,
    Op::Barrier,
    Op::Quiet,
    Op::Fence,
    Op::TeamSync,
    Op::Broadcast,
    Op::Alltoall,
    Op::Collect,
    Op::Fcollect,
    Op::AndReduce,
    Op::OrReduce,
    Op::XorReduce,
    Op::MaxReduce,
    Op::MinReduce,
    Op::SumReduce,
    Op::ProdReduce,
    Op::Inscan,
    Op::Exscan,
];

/// Element type tag. Numeric-type fan-out (§1 Out-of-scope: "per-type API
/// surface expansion") is mechanical, so the engine carries the element
/// width/signedness/float-ness as data rather than generating one entry
/// point per C type.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElemType {
    None = 0,
    Uint8 = 1,
    Uint16 = 2,
    Uint32 = 3,
    Uint64 = 4,
    Int8 = 5,
    Int16 = 6,
    Int32 = 7,
    Int64 = 8,
    Float32 = 9,
    Float64 = 10,
}

impl ElemType {
    /// Byte width of one element of this type.
    pub const fn size(self) -> usize {
        match self {
            ElemType::None => 0,
            ElemType::Uint8 | ElemType::Int8 => 1,
            ElemType::Uint16 | ElemType::Int16 => 2,
            ElemType::Uint32 | ElemType::Int32 | ElemType::Float32 => 4,
            ElemType::Uint64 | ElemType::Int64 | ElemType::Float64 => 8,
        }
    }

    /// Reduction is only defined over integer and floating types, never `None`.
    pub const fn is_numeric(self) -> bool {
        !matches!(self, ElemType::None)
    }

    /// AND/OR/XOR reductions are integer-only (§4.I).
    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            ElemType::Uint8
                | ElemType::Uint16
                | ElemType::Uint32
                | ElemType::Uint64
                | ElemType::Int8
                | ElemType::Int16
                | ElemType::Int32
                | ElemType::Int64
        )
    }
}

/// All element types, for building `[[T; NUM_TYPES]; NUM_OPS]` dispatch tables.
pub const ALL_TYPES: &[ElemType] = &[
    ElemType::None,
    ElemType::Uint8,
    ElemType::Uint16,
    ElemType::Uint32,
    ElemType::Uint64,
    ElemType::Int8,
    ElemType::Int16,
    ElemType::Int32,
    ElemType::Int64,
    ElemType::Float32,
    ElemType::Float64,
];

/// Error returned when a wire byte does not name a known [`Op`]/[`ElemType`].
/// A corrupted ring slot is a recoverable error (it cannot happen by
/// construction on our own producers, but a hostile/buggy peer should not be
/// able to turn a bad byte into UB), never UB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownTag(pub u8);

impl fmt::Display for UnknownTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unrecognized wire tag byte {}", self.0)
    }
}

impl std::error::Error for UnknownTag {}

impl TryFrom<u8> for Op {
    type Error = UnknownTag;
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        ALL_OPS
            .iter()
            .copied()
            .find(|op| *op as u8 == v)
            .ok_or(UnknownTag(v))
    }
}

impl TryFrom<u8> for ElemType {
    type Error = UnknownTag;
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        ALL_TYPES
            .iter()
            .copied()
            .find(|t| *t as u8 == v)
            .ok_or(UnknownTag(v))
    }
}

/// A request posted by a device producer and consumed by the host proxy.
/// Fixed 64-byte cache-line record (§3, §6).
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Request {
    pub sequence: u16,
    pub op: u8,
    pub elem_type: u8,
    pub completion_index: u16,
    pub _pad0: u16,
    /// Destination PE, or team id for collectives.
    pub dest_pe: i32,
    pub root: i32,
    pub src: u64,
    pub dst: u64,
    pub nelems: u64,
    pub dst_stride: i64,
    pub src_stride: i64,
    /// Block size for I[B]PUT/I[B]GET, or an AMO's immediate `value`.
    pub bsize_or_value: u64,
}

impl Request {
    pub const SIZE: usize = std::mem::size_of::<Request>();

    pub fn new(op: Op, elem_type: ElemType, dest_pe: i32) -> Self {
        Request {
            sequence: 0,
            op: op as u8,
            elem_type: elem_type as u8,
            completion_index: 0,
            _pad0: 0,
            dest_pe,
            root: -1,
            src: 0,
            dst: 0,
            nelems: 0,
            dst_stride: 1,
            src_stride: 1,
            bsize_or_value: 0,
        }
    }

    pub fn op(&self) -> Result<Op, UnknownTag> {
        Op::try_from(self.op)
    }

    pub fn elem_type(&self) -> Result<ElemType, UnknownTag> {
        ElemType::try_from(self.elem_type)
    }
}

/// Lock state of a [`Completion`] slot (§3 "Completion").
pub mod lock_state {
    /// The device producer has not yet observed and freed this slot.
    pub const LOCKED: u8 = 1;
    /// The device producer has observed the result and the slot may be reused.
    pub const FREE: u8 = 0;
}

/// A completion record written by the proxy and read by the producing device
/// thread. 64 bytes so it can be published with a single streaming store
/// (§4.B).
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Completion {
    pub sequence: u16,
    pub lock: u8,
    pub _pad0: [u8; 5],
    /// Either a status code (negative = error, per §7) in the low 32 bits,
    /// or the raw bits of a fetched scalar (interpreted per the request's
    /// `elem_type`).
    pub ret: u64,
    pub _pad1: [u8; 48],
}

impl Completion {
    pub const SIZE: usize = std::mem::size_of::<Completion>();

    pub fn pending(sequence: u16) -> Self {
        Completion {
            sequence,
            lock: lock_state::LOCKED,
            _pad0: [0; 5],
            ret: 0,
            _pad1: [0; 48],
        }
    }

    pub fn status(&self) -> i32 {
        self.ret as i32
    }

    pub fn set_status(&mut self, status: i32) {
        self.ret = status as u32 as u64;
    }

    pub fn set_scalar_bits(&mut self, bits: u64) {
        self.ret = bits;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_is_one_cache_line() {
        assert_eq!(Request::SIZE, 64);
    }

    #[test]
    fn completion_is_one_cache_line() {
        assert_eq!(Completion::SIZE, 64);
    }

    #[test]
    fn op_round_trips_through_u8() {
        for op in ALL_OPS {
            let byte = *op as u8;
            assert_eq!(Op::try_from(byte).unwrap() as u8, byte);
        }
    }

    #[test]
    fn elem_type_round_trips_through_u8() {
        for t in ALL_TYPES {
            let byte = *t as u8;
            assert_eq!(ElemType::try_from(byte).unwrap() as u8, byte);
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert!(Op::try_from(200u8).is_err());
        assert!(ElemType::try_from(200u8).is_err());
    }

    #[test]
    fn elem_type_sizes() {
        assert_eq!(ElemType::Uint8.size(), 1);
        assert_eq!(ElemType::Int64.size(), 8);
        assert_eq!(ElemType::Float64.size(), 8);
        assert_eq!(ElemType::None.size(), 0);
    }

    #[test]
    fn ring_size_is_power_of_two() {
        assert_eq!(RING_SIZE & (RING_SIZE - 1), 0);
    }
}
