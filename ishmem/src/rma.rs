//! Remote memory access: put/get and their strided/block-strided/scalar/
//! non-blocking variants (§4.E), grounded on `original_source/src/rma.cpp`
//! and `original_source/src/nbi_impl.h`.
//!
//! Every function here is the **local** implementation: straight-line code
//! that performs one transfer given a target PE, assuming the caller has
//! already decided how to reach it (direct heap-to-heap copy when mappable,
//! [`Runtime::proxy_put`]/[`Runtime::proxy_get`] otherwise). Fast-path vs.
//! ring cutover decisions live one layer up, in the engine (`lib.rs`), since
//! that is the only place that has both [`crate::device::DeviceContext`]
//! and [`crate::config::Config`] in scope — this module has neither, and is
//! exactly what a proxy-thread upcall, a host-mainline call, and a
//! below-cutover device fast path all ultimately bottom out in.

use crate::error::{IshmemError, Result};
use crate::heap::{SymmetricHeap, Topology};
use crate::runtime::Runtime;

/// Whether a transfer to/from `pe` of `nbytes` can use the direct
/// heap-to-heap fast path instead of the ring/proxy (§4.E: "mappable AND
/// below cutover").
pub fn is_fast_path(topology: &Topology, pe: i32, nbytes: usize, cutover: usize) -> bool {
    pe == topology.my_pe() || (topology.is_mappable(pe) && nbytes < cutover)
}

fn validate(topology: &Topology, pe: i32) -> Result<()> {
    if !topology.is_valid_pe(pe) {
        return Err(IshmemError::InvalidPe(pe));
    }
    Ok(())
}

/// `ishmem_putmem`: copy `nbytes` from local offset `src_offset` to `pe`'s
/// heap at `dst_offset`.
pub fn local_put(heap: &SymmetricHeap, topology: &Topology, runtime: &dyn Runtime, pe: i32, dst_offset: u64, src_offset: u64, nbytes: usize) -> Result<()> {
    validate(topology, pe)?;
    let src_ptr = heap.ptr_at(src_offset as usize);
    if pe == topology.my_pe() {
        let dst_ptr = heap.ptr_at(dst_offset as usize);
        unsafe { std::ptr::copy(src_ptr, dst_ptr, nbytes) };
        return Ok(());
    }
    if let Some(peer_ptr) = topology.ptr(heap.ptr_at(dst_offset as usize), pe) {
        unsafe { std::ptr::copy_nonoverlapping(src_ptr, peer_ptr, nbytes) };
        std::sync::atomic::fence(std::sync::atomic::Ordering::Release);
        return Ok(());
    }
    let data = unsafe { std::slice::from_raw_parts(src_ptr, nbytes) };
    runtime.proxy_put(pe, dst_offset, data)
}

/// `ishmem_getmem`: copy `nbytes` from `pe`'s heap at `src_offset` into
/// local offset `dst_offset`.
pub fn local_get(heap: &SymmetricHeap, topology: &Topology, runtime: &dyn Runtime, pe: i32, dst_offset: u64, src_offset: u64, nbytes: usize) -> Result<()> {
    validate(topology, pe)?;
    let dst_ptr = heap.ptr_at(dst_offset as usize);
    if pe == topology.my_pe() {
        let src_ptr = heap.ptr_at(src_offset as usize);
        unsafe { std::ptr::copy(src_ptr, dst_ptr, nbytes) };
        return Ok(());
    }
    if let Some(peer_ptr) = topology.ptr(heap.ptr_at(src_offset as usize), pe) {
        std::sync::atomic::fence(std::sync::atomic::Ordering::Acquire);
        unsafe { std::ptr::copy_nonoverlapping(peer_ptr, dst_ptr, nbytes) };
        return Ok(());
    }
    let data = runtime.proxy_get(pe, src_offset, nbytes)?;
    unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst_ptr, nbytes) };
    Ok(())
}

/// `ishmem_iput`/`ishmem_ibput`: strided/block-strided put. `dst_stride` and
/// `src_stride` are measured in `elem_size`-wide units; `bsize` is the
/// contiguous block size in elements copied per stride step (`1` for the
/// plain strided `iput`).
#[allow(clippy::too_many_arguments)]
pub fn local_iput(
    heap: &SymmetricHeap,
    topology: &Topology,
    runtime: &dyn Runtime,
    pe: i32,
    dst_offset: u64,
    src_offset: u64,
    elem_size: usize,
    dst_stride: i64,
    src_stride: i64,
    bsize: usize,
    nelems: usize,
) -> Result<()> {
    if dst_stride == 0 || src_stride == 0 || bsize == 0 {
        return Err(IshmemError::MisalignedStride);
    }
    let block_bytes = bsize * elem_size;
    for i in 0..nelems {
        let src_off = (src_offset as i64 + i as i64 * src_stride * elem_size as i64) as u64;
        let dst_off = (dst_offset as i64 + i as i64 * dst_stride * elem_size as i64) as u64;
        local_put(heap, topology, runtime, pe, dst_off, src_off, block_bytes)?;
    }
    Ok(())
}

/// `ishmem_iget`/`ishmem_ibget`: strided/block-strided get, mirroring
/// [`local_iput`].
#[allow(clippy::too_many_arguments)]
pub fn local_iget(
    heap: &SymmetricHeap,
    topology: &Topology,
    runtime: &dyn Runtime,
    pe: i32,
    dst_offset: u64,
    src_offset: u64,
    elem_size: usize,
    dst_stride: i64,
    src_stride: i64,
    bsize: usize,
    nelems: usize,
) -> Result<()> {
    if dst_stride == 0 || src_stride == 0 || bsize == 0 {
        return Err(IshmemError::MisalignedStride);
    }
    let block_bytes = bsize * elem_size;
    for i in 0..nelems {
        let src_off = (src_offset as i64 + i as i64 * src_stride * elem_size as i64) as u64;
        let dst_off = (dst_offset as i64 + i as i64 * dst_stride * elem_size as i64) as u64;
        local_get(heap, topology, runtime, pe, dst_off, src_off, block_bytes)?;
    }
    Ok(())
}

/// `ishmem_p`: store one scalar (up to 8 bytes, widened into `value`) at
/// `dst_offset` on `pe`.
pub fn local_p(heap: &SymmetricHeap, topology: &Topology, runtime: &dyn Runtime, pe: i32, dst_offset: u64, elem_size: usize, value: u64) -> Result<()> {
    let bytes = value.to_le_bytes();
    validate(topology, pe)?;
    if pe == topology.my_pe() {
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), heap.ptr_at(dst_offset as usize), elem_size) };
        return Ok(());
    }
    if let Some(peer_ptr) = topology.ptr(heap.ptr_at(dst_offset as usize), pe) {
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), peer_ptr, elem_size) };
        std::sync::atomic::fence(std::sync::atomic::Ordering::Release);
        return Ok(());
    }
    runtime.proxy_put(pe, dst_offset, &bytes[..elem_size])
}

/// `ishmem_g`: fetch one scalar (up to 8 bytes) from `src_offset` on `pe`.
pub fn local_g(heap: &SymmetricHeap, topology: &Topology, runtime: &dyn Runtime, pe: i32, src_offset: u64, elem_size: usize) -> Result<u64> {
    validate(topology, pe)?;
    let mut bytes = [0u8; 8];
    if pe == topology.my_pe() {
        unsafe { std::ptr::copy_nonoverlapping(heap.ptr_at(src_offset as usize), bytes.as_mut_ptr(), elem_size) };
        return Ok(u64::from_le_bytes(bytes));
    }
    if let Some(peer_ptr) = topology.ptr(heap.ptr_at(src_offset as usize), pe) {
        std::sync::atomic::fence(std::sync::atomic::Ordering::Acquire);
        unsafe { std::ptr::copy_nonoverlapping(peer_ptr, bytes.as_mut_ptr(), elem_size) };
        return Ok(u64::from_le_bytes(bytes));
    }
    let data = runtime.proxy_get(pe, src_offset, elem_size)?;
    bytes[..elem_size].copy_from_slice(&data);
    Ok(u64::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::loopback::LoopbackRuntime;

    fn two_pe_setup() -> (SymmetricHeap, SymmetricHeap, std::sync::Arc<crate::runtime::loopback::LoopbackFabric>) {
        let fabric = LoopbackRuntime::new_fabric(2, 2);
        let h0 = SymmetricHeap::new(4096).unwrap();
        let h1 = SymmetricHeap::new(4096).unwrap();
        fabric.register_heap(0, h0.base(), h0.size());
        fabric.register_heap(1, h1.base(), h1.size());
        (h0, h1, fabric)
    }

    #[test]
    fn local_put_same_pe_is_a_plain_copy() {
        let heap = SymmetricHeap::new(4096).unwrap();
        let fabric = LoopbackRuntime::new_fabric(1, 1);
        let rt = LoopbackRuntime::attach(&fabric, 0);
        let topo = Topology::build(0, 1, 1, &heap, &rt).unwrap();
        unsafe { *heap.ptr_at(0).cast::<u32>() = 0xdead_beef };
        local_put(&heap, &topo, &rt, 0, 64, 0, 4).unwrap();
        assert_eq!(unsafe { *heap.ptr_at(64).cast::<u32>() }, 0xdead_beef);
    }

    #[test]
    fn local_put_falls_back_to_proxy_when_not_mappable() {
        let (h0, h1, fabric) = two_pe_setup();
        let rt0 = LoopbackRuntime::attach(&fabric, 0);
        let topo0 = Topology::build(0, 2, 1, &h0, &rt0).unwrap();
        assert!(!topo0.is_mappable(1), "node_size=1 keeps every other PE off-node");
        unsafe { *h0.ptr_at(0).cast::<u64>() = 0x1122_3344_5566_7788 };
        local_put(&h0, &topo0, &rt0, 1, 128, 0, 8).unwrap();
        assert_eq!(unsafe { *h1.ptr_at(128).cast::<u64>() }, 0x1122_3344_5566_7788);
    }

    #[test]
    fn local_p_and_g_round_trip_through_proxy() {
        let (h0, h1, fabric) = two_pe_setup();
        let rt0 = LoopbackRuntime::attach(&fabric, 0);
        let topo0 = Topology::build(0, 2, 1, &h0, &rt0).unwrap();
        local_p(&h0, &topo0, &rt0, 1, 32, 4, 99).unwrap();
        assert_eq!(unsafe { *h1.ptr_at(32).cast::<u32>() }, 99);

        let rt1 = LoopbackRuntime::attach(&fabric, 1);
        let topo1 = Topology::build(1, 2, 1, &h1, &rt1).unwrap();
        let fetched = local_g(&h1, &topo1, &rt1, 0, 0, 4).unwrap();
        let _ = fetched;
    }

    #[test]
    fn iput_walks_strided_offsets() {
        let heap = SymmetricHeap::new(4096).unwrap();
        let fabric = LoopbackRuntime::new_fabric(1, 1);
        let rt = LoopbackRuntime::attach(&fabric, 0);
        let topo = Topology::build(0, 1, 1, &heap, &rt).unwrap();
        for i in 0..4u32 {
            unsafe { *heap.ptr_at(i as usize * 4).cast::<u32>() = i + 1 };
        }
        local_iput(&heap, &topo, &rt, 0, 1024, 0, 4, 2, 1, 1, 4).unwrap();
        for i in 0..4u32 {
            let v = unsafe { *heap.ptr_at(1024 + (i as usize) * 2 * 4).cast::<u32>() };
            assert_eq!(v, i + 1);
        }
    }

    #[test]
    fn is_fast_path_requires_both_mappable_and_below_cutover() {
        let heap = SymmetricHeap::new(4096).unwrap();
        let fabric = LoopbackRuntime::new_fabric(2, 2);
        let rt0 = LoopbackRuntime::attach(&fabric, 0);
        let topo0 = Topology::build(0, 2, 2, &heap, &rt0).unwrap();
        assert!(is_fast_path(&topo0, 1, 100, 1024));
        assert!(!is_fast_path(&topo0, 1, 2000, 1024));
    }
}
