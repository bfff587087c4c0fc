//! Compiles a two-rank allgather and prints the resulting per-rank
//! threadblock schedule. Run with `cargo run --example allgather_ring
//! --features testing`.

use ccl_ir::buffer::BufferName;
use ccl_ir::testing::{AllGather, FullyConnected};
use ccl_ir::{begin_program, check_program, end_program, send, ChunkRef};

fn main() {
    env_logger::init();

    let topology = FullyConnected::new(2, /* channels */ 1);
    let collective = AllGather { chunks_per_rank: 1 };

    begin_program("allgather-ring", "Simple", false, 1, false, &topology, &collective)
        .expect("starting the program should not fail on a fresh topology");

    for rank in 0..2u32 {
        let other = 1 - rank;
        let src = ChunkRef::new(rank, BufferName::Input, 0, 1);
        send(&src, &ChunkRef::new(other, BufferName::Output, rank, 1), -1, -1, -1).unwrap();
        send(&src, &ChunkRef::new(rank, BufferName::Output, rank, 1), -1, -1, -1).unwrap();
    }

    let program = end_program().expect("a two-rank exchange over a connected topology always compiles");
    println!("program '{}' targeting '{}', {} gpu(s)", program.name, program.collective, program.gpus.len());
    for gpu in &program.gpus {
        println!("  rank {}: {} threadblock(s)", gpu.rank, gpu.threadblocks.len());
        for tb in &gpu.threadblocks {
            println!("    tb {} (send={}, recv={}, channel={}): {} op(s)", tb.id, tb.send, tb.recv, tb.channel, tb.ops.len());
        }
    }

    let ok = check_program(&program, &collective);
    println!("oracle check: {}", if ok { "passed" } else { "FAILED" });
}
