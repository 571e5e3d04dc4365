//! `ishmem-cli`: spawns N loopback PEs in-process and drives a scenario
//! (put/get, fetch-add, broadcast, sum-reduce, team split + reduce) end to
//! end, for manual smoke-testing and as a runnable example of the public
//! `ishmem::Engine` API (SPEC_FULL §2 component N).

use clap::Parser;
use ishmem::runtime::loopback::LoopbackRuntime;
use ishmem::{AmoKind, ElemType, Engine, ReduceOp};
use ishmem::teams::WORLD;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "ishmem-cli")]
#[command(about = "Drive the ishmem PGAS engine through a scripted multi-PE scenario")]
struct Args {
    /// Number of simulated processing elements.
    #[arg(long, default_value_t = 4)]
    pes: i32,
    /// Number of PEs per simulated node (controls which peers take the
    /// intra-node fast path vs. the proxy).
    #[arg(long, default_value_t = 4)]
    node_size: i32,
}

fn main() {
    let _ = env_logger::builder().filter_level(log::LevelFilter::Info).is_test(false).try_init();
    let args = Args::parse();
    if args.pes < 2 {
        eprintln!("ishmem-cli: --pes must be at least 2");
        std::process::exit(1);
    }

    let fabric = LoopbackRuntime::new_fabric(args.pes, args.node_size);
    let engines: Vec<Arc<Engine>> = (0..args.pes)
        .map(|pe| {
            let rt = LoopbackRuntime::attach(&fabric, pe);
            let engine = Engine::init(Box::new(rt));
            fabric.register_heap(pe, engine.heap().base(), engine.heap().size());
            engine
        })
        .collect();

    let handles: Vec<_> = engines
        .into_iter()
        .map(|engine| std::thread::spawn(move || run_scenario(&engine)))
        .collect();

    for h in handles {
        h.join().expect("PE thread panicked");
    }
    println!("ishmem-cli: all {} PEs completed the demo scenario", args.pes);
}

fn run_scenario(engine: &Arc<Engine>) {
    let my_pe = engine.my_pe();
    let n_pes = engine.n_pes();

    // 1. Put ring verification: every PE puts into its right neighbor.
    let src = engine.malloc(4).expect("malloc src");
    let dst = engine.malloc(4).expect("malloc dst");
    unsafe { *engine.heap().ptr_at(src).cast::<u32>() = my_pe as u32 };
    let neighbor = (my_pe + 1) % n_pes;
    engine.put(neighbor, dst as u64, src as u64, ElemType::Uint32, 1, 1, 1, 1).expect("put");
    engine.barrier_all();
    let received = unsafe { *engine.heap().ptr_at(dst).cast::<u32>() };
    let expected = ((my_pe + n_pes - 1) % n_pes) as u32;
    log::info!("pe {my_pe}: put/get neighbor exchange got {received}, expected {expected}");

    // 2. Atomic fetch-add accumulation onto PE 0.
    let counter = engine.malloc(8).expect("malloc counter");
    engine.barrier_all();
    let prev = engine.amo(0, counter, ElemType::Uint64, AmoKind::Add, 1, None).expect("fetch_add");
    engine.barrier_all();
    log::info!("pe {my_pe}: fetch_add observed previous value {prev}");
    if my_pe == 0 {
        let total = unsafe { *engine.heap().ptr_at(counter).cast::<u64>() };
        println!("pe 0: counter after fetch_add from every PE = {total} (n_pes = {n_pes})");
    }

    // 3. Sum reduction over WORLD.
    let my_value = (my_pe as u32).to_le_bytes();
    let sum_bytes = engine.reduce(WORLD, ReduceOp::Sum, ElemType::Uint32, &my_value).expect("sum_reduce");
    let sum = u32::from_le_bytes(sum_bytes.try_into().unwrap());
    log::info!("pe {my_pe}: sum_reduce(WORLD) = {sum}");

    // 4. Broadcast from root 0.
    let mut bcast_buf = if my_pe == 0 { 42i32.to_le_bytes() } else { 0i32.to_le_bytes() };
    engine.broadcast(WORLD, 0, &mut bcast_buf).expect("broadcast");
    log::info!("pe {my_pe}: broadcast value = {}", i32::from_le_bytes(bcast_buf));

    // 5. Team split: every PE must call this together (the split protocol
    // disseminates membership across all of WORLD, not just the evens), but
    // only even-numbered PEs end up as members of the resulting sub-team.
    let evens = (n_pes + 1) / 2;
    match engine.team_split_strided(WORLD, 0, 2, evens) {
        Ok(team) => {
            let my_team_pe = engine.team_my_pe(team).unwrap_or(-1);
            let contribution = (my_team_pe as u32).to_le_bytes();
            let team_sum = engine.reduce(team, ReduceOp::Sum, ElemType::Uint32, &contribution).expect("team sum_reduce");
            let team_sum = u32::from_le_bytes(team_sum.try_into().unwrap());
            log::info!("pe {my_pe}: even-team rank {my_team_pe}, team sum_reduce = {team_sum}");
            let _ = engine.team_destroy(team);
        }
        Err(_) => log::info!("pe {my_pe}: not a member of the even-PE team"),
    }

    engine.barrier_all();
    engine.finalize();
}
