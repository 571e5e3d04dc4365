//! Multi-PE integration tests over `LoopbackRuntime`, one per concrete
//! end-to-end scenario named in spec.md §8.

use ishmem::runtime::loopback::LoopbackRuntime;
use ishmem::teams::{self, WORLD};
use ishmem::{AmoKind, ElemType, Engine, ReduceOp};
use std::sync::Arc;

fn make_engine(fabric: &Arc<ishmem::runtime::loopback::LoopbackFabric>, pe: i32) -> Arc<Engine> {
    std::env::set_var("ISHMEM_SYMMETRIC_SIZE", "65536");
    let rt = LoopbackRuntime::attach(fabric, pe);
    let engine = Engine::init(Box::new(rt));
    fabric.register_heap(pe, engine.heap().base(), engine.heap().size());
    engine
}

/// 1. Put ring verification (2 PEs, contiguous): PE `p` writes
/// `src[i] = (p << 16) | i` then puts it into PE `(p+1) % 2`'s `dst`; after
/// a barrier every PE must observe its neighbor's tagged values.
#[test]
fn put_ring_verification() {
    let fabric = LoopbackRuntime::new_fabric(2, 2);
    let engines = [make_engine(&fabric, 0), make_engine(&fabric, 1)];
    let handles: Vec<_> = engines
        .into_iter()
        .map(|engine| {
            std::thread::spawn(move || {
                let p = engine.my_pe();
                let src = engine.malloc(10 * 4).unwrap();
                let dst = engine.malloc(10 * 4).unwrap();
                for i in 0..10u32 {
                    let val = ((p as u32) << 16) | i;
                    unsafe { *engine.heap().ptr_at(src + i as usize * 4).cast::<u32>() = val };
                }
                let peer = (p + 1) % 2;
                engine.put(peer, dst as u64, src as u64, ElemType::Uint32, 1, 1, 1, 10).unwrap();
                engine.barrier_all();
                let expected_tag = ((p + 1) % 2) as u32;
                for i in 0..10u32 {
                    let got = unsafe { *engine.heap().ptr_at(dst + i as usize * 4).cast::<u32>() };
                    assert_eq!(got, (expected_tag << 16) | i);
                }
                engine.finalize();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}

/// 2. Atomic fetch-add accumulation: every PE does one `fetch_add(1)` onto
/// PE 0's counter; the final counter equals `n_pes` and the multiset of
/// observed "old values" is exactly `{0, ..., n_pes-1}`.
#[test]
fn atomic_fetch_add_accumulation() {
    let n_pes = 4;
    let fabric = LoopbackRuntime::new_fabric(n_pes, n_pes);
    let engines: Vec<_> = (0..n_pes).map(|pe| make_engine(&fabric, pe)).collect();
    let counter_offsets: Vec<usize> = engines.iter().map(|e| e.malloc(8).unwrap()).collect();
    assert!(counter_offsets.windows(2).all(|w| w[0] == w[1]), "symmetric malloc must match across PEs");

    let handles: Vec<_> = engines
        .into_iter()
        .map(|engine| {
            let counter = counter_offsets[0];
            std::thread::spawn(move || {
                let prev = engine.amo(0, counter, ElemType::Uint64, AmoKind::Add, 1, None).unwrap();
                engine.barrier_all();
                let total = if engine.my_pe() == 0 { Some(unsafe { *engine.heap().ptr_at(counter).cast::<u64>() }) } else { None };
                engine.finalize();
                (prev, total)
            })
        })
        .collect();

    let results: Vec<(u64, Option<u64>)> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let mut old_values: Vec<u64> = results.iter().map(|(prev, _)| *prev).collect();
    old_values.sort();
    assert_eq!(old_values, (0..n_pes as u64).collect::<Vec<_>>());
    let total = results.into_iter().find_map(|(_, total)| total).expect("pe 0 observed the total");
    assert_eq!(total, n_pes as u64);
}

/// 3. Sum reduction: every PE contributes `my_pe`; every PE must read back
/// `n_pes*(n_pes-1)/2`.
#[test]
fn sum_reduction_over_world() {
    let n_pes = 5;
    let fabric = LoopbackRuntime::new_fabric(n_pes, n_pes);
    let engines: Vec<_> = (0..n_pes).map(|pe| make_engine(&fabric, pe)).collect();
    let handles: Vec<_> = engines
        .into_iter()
        .map(|engine| {
            std::thread::spawn(move || {
                let my_pe = engine.my_pe() as u32;
                let out = engine.reduce(WORLD, ReduceOp::Sum, ElemType::Uint32, &my_pe.to_le_bytes()).unwrap();
                engine.finalize();
                u32::from_le_bytes(out.try_into().unwrap())
            })
        })
        .collect();
    let expected = (n_pes * (n_pes - 1) / 2) as u32;
    for h in handles {
        assert_eq!(h.join().unwrap(), expected);
    }
}

/// 4. Broadcast: PE 0 sets `src_bcast = 42`; every PE must read `dst == 42`,
/// and calling it a second time (idempotence under repetition) must not
/// change the result.
#[test]
fn broadcast_from_root() {
    let n_pes = 4;
    let fabric = LoopbackRuntime::new_fabric(n_pes, n_pes);
    let engines: Vec<_> = (0..n_pes).map(|pe| make_engine(&fabric, pe)).collect();
    let handles: Vec<_> = engines
        .into_iter()
        .map(|engine| {
            std::thread::spawn(move || {
                let mut buf = if engine.my_pe() == 0 { 42i32.to_le_bytes() } else { 0i32.to_le_bytes() };
                engine.broadcast(WORLD, 0, &mut buf).unwrap();
                assert_eq!(i32::from_le_bytes(buf), 42);
                engine.broadcast(WORLD, 0, &mut buf).unwrap();
                assert_eq!(i32::from_le_bytes(buf), 42);
                engine.finalize();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}

/// 5. Alltoall symmetry: PE `p` sends chunk `[encode(p, d*4), .., encode(p,
/// d*4+3)]` (`Uint32`, 4 elements) to destination rank `d`; after the
/// exchange PE `p` must hold, in the slot for source `q`, exactly
/// `encode(q, p*4+j)`.
#[test]
fn alltoall_is_a_personalized_transpose() {
    let n_pes = 4i32;
    let fabric = LoopbackRuntime::new_fabric(n_pes, n_pes);
    let engines: Vec<_> = (0..n_pes).map(|pe| make_engine(&fabric, pe)).collect();
    let encode = |p: i32, i: i32| -> u32 { ((p as u32) << 16) | (i as u32) };
    let handles: Vec<_> = engines
        .into_iter()
        .map(|engine| {
            std::thread::spawn(move || {
                let p = engine.my_pe();
                let mut src = Vec::with_capacity(4 * n_pes as usize * 4);
                for i in 0..4 * n_pes {
                    src.extend_from_slice(&encode(p, i).to_le_bytes());
                }
                let dst = engine.alltoall(WORLD, &src).unwrap();
                for q in 0..n_pes {
                    for j in 0..4 {
                        let idx = (q * 4 + j) as usize;
                        let got = u32::from_le_bytes(dst[idx * 4..idx * 4 + 4].try_into().unwrap());
                        assert_eq!(got, encode(q, p * 4 + j));
                    }
                }
                engine.finalize();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}

/// 6. Team split + reduction: split WORLD into the even-PE team; every PE
/// must call the split together even though only evens end up members
/// (the split's membership-agreement reduce spans all of WORLD). Odd PEs
/// must see `team_split_strided` fail (the spec's `INVALID` team) and skip;
/// even PEs reduce their team rank and must see `t_size*(t_size-1)/2`.
#[test]
fn team_split_then_reduce_on_even_pes() {
    let n_pes = 6i32;
    let fabric = LoopbackRuntime::new_fabric(n_pes, n_pes);
    let engines: Vec<_> = (0..n_pes).map(|pe| make_engine(&fabric, pe)).collect();
    let t_size = (n_pes + 1) / 2;
    let handles: Vec<_> = engines
        .into_iter()
        .map(|engine| {
            std::thread::spawn(move || {
                let p = engine.my_pe();
                let split = engine.team_split_strided(WORLD, 0, 2, t_size);
                if p % 2 == 0 {
                    let team = split.expect("even pe must join the split");
                    let my_team_pe = engine.team_my_pe(team).unwrap();
                    let out = engine.reduce(team, ReduceOp::Sum, ElemType::Uint32, &(my_team_pe as u32).to_le_bytes()).unwrap();
                    let sum = u32::from_le_bytes(out.try_into().unwrap());
                    assert_eq!(sum, (t_size * (t_size - 1) / 2) as u32);
                    engine.team_destroy(team).unwrap();
                } else {
                    match split {
                        Err(ishmem::IshmemError::InvalidTeam(id)) => assert_eq!(id, teams::INVALID),
                        other => panic!("odd pe must see the even-PE team as invalid, got {other:?}"),
                    }
                }
                engine.finalize();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}
