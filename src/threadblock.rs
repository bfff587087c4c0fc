//! Threadblock assignment: grouping ops into the per-rank execution units
//! that the emitted program schedules independently.
//!
//! A threadblock talks to at most one peer rank over at most one channel;
//! ops that only touch local buffers (`copy`/`reduce`) are peer-free. The
//! front end can pin an op to a concrete threadblock id up front (manual
//! mode); any op left at `tb == -1` is assigned automatically here.

use std::collections::HashMap;

use crate::error::{CompileError, PeerDirection, Rank, Result, TbId};
use crate::op::{Instruction, OpId};
use crate::rank_dag::RankDag;

/// One rank-local execution unit: a fixed peer (or none) and channel,
/// running its `ops` in the order assigned.
#[derive(Debug, Clone)]
pub struct Threadblock {
    pub send: i32,
    pub recv: i32,
    pub channel: i32,
    pub ops: Vec<OpId>,
}

impl Threadblock {
    fn new(send: i32, recv: i32, channel: i32) -> Self {
        Threadblock { send, recv, channel, ops: Vec::new() }
    }

    /// `(send_peer, recv_peer)`, each `-1` if the op has no such side. A
    /// fused op like `recv_copy_send` has both: it receives from one peer
    /// and forwards to another, so it needs a threadblock bound to both.
    fn peer_of(op: &crate::op::Op) -> (i32, i32) {
        let send_peer = if op.inst.is_send() {
            op.dst.as_ref().map(|r| r.rank as i32).unwrap_or(-1)
        } else {
            -1
        };
        let recv_peer = if op.inst.is_recv() {
            op.src.as_ref().map(|r| r.rank as i32).unwrap_or(-1)
        } else {
            -1
        };
        (send_peer, recv_peer)
    }
}

/// Assigns every op in `dag` a final `tb` (index into its rank's
/// threadblock list) and `step` (index within that threadblock), honoring
/// any non-negative `tb` hints already present and auto-assigning the
/// rest.
///
/// Manual ids are taken as given, one threadblock per distinct id per
/// rank; two ops sharing a manual id must agree on which peer/channel they
/// talk to, or the schedule is contradictory. Automatic ops are bucketed
/// one threadblock per distinct `(peer, channel)` pair on their rank,
/// where a pure send to peer P and a pure recv from peer P on the same
/// channel share one threadblock (it ends up with both `send` and `recv`
/// set to P); local-only ops each get their own threadblock — a
/// simplification of the original's bin-packing search, grounded
/// directly in the peer-exclusivity invariant rather than in a specific
/// algorithm (see `DESIGN.md`).
pub fn assign_threadblocks(dag: &mut RankDag) -> Result<()> {
    for rank in 0..dag.num_ranks() {
        assign_rank(dag, rank)?;
    }
    Ok(())
}

fn assign_rank(dag: &mut RankDag, rank: Rank) -> Result<()> {
    let rank_ops: Vec<OpId> = dag
        .all_op_ids()
        .filter(|&id| dag.op(id).rank == rank && !is_start(dag, id))
        .collect();

    let mut manual: HashMap<i32, Threadblock> = HashMap::new();
    let mut auto_keys: HashMap<(i32, i32, i32), usize> = HashMap::new();
    let mut buckets: Vec<Threadblock> = Vec::new();
    let mut manual_members: HashMap<i32, Vec<OpId>> = HashMap::new();
    let mut auto_members: Vec<Vec<OpId>> = Vec::new();

    for &id in &rank_ops {
        let op = dag.op(id);
        let (send, recv) = Threadblock::peer_of(op);
        let channel = op.channel;

        if op.tb >= 0 {
            let tb = manual.entry(op.tb).or_insert_with(|| Threadblock::new(-1, -1, channel));
            if send != -1 {
                if tb.send == -1 {
                    tb.send = send;
                } else if tb.send != send {
                    return Err(conflict(rank, op.tb, PeerDirection::Send, tb.send, send));
                }
            }
            if recv != -1 {
                if tb.recv == -1 {
                    tb.recv = recv;
                } else if tb.recv != recv {
                    return Err(conflict(rank, op.tb, PeerDirection::Recv, tb.recv, recv));
                }
            }
            manual_members.entry(op.tb).or_default().push(id);
        } else if send == -1 && recv == -1 {
            // Local-only op: its own threadblock.
            buckets.push(Threadblock::new(-1, -1, -1));
            auto_members.push(vec![id]);
        } else {
            // A pure send to P and a pure recv from P share a bucket key so
            // they land in the same threadblock; a fused op already binds
            // both sides itself and keys on the exact pair.
            let key = if send != -1 && recv != -1 {
                (send, recv, channel)
            } else {
                let peer = if send != -1 { send } else { recv };
                (peer, peer, channel)
            };
            let idx = *auto_keys.entry(key).or_insert_with(|| {
                buckets.push(Threadblock::new(-1, -1, channel));
                auto_members.push(Vec::new());
                buckets.len() - 1
            });
            let tb = &mut buckets[idx];
            if send != -1 {
                tb.send = send;
            }
            if recv != -1 {
                tb.recv = recv;
            }
            auto_members[idx].push(id);
        }
    }

    let mut manual_ids: Vec<i32> = manual.keys().copied().collect();
    manual_ids.sort_unstable();

    let mut final_tbs: Vec<Threadblock> = Vec::new();
    for manual_id in manual_ids {
        let mut tb = manual.remove(&manual_id).unwrap();
        tb.ops = manual_members.remove(&manual_id).unwrap_or_default();
        final_tbs.push(tb);
    }
    for (mut tb, members) in buckets.into_iter().zip(auto_members.into_iter()) {
        tb.ops = members;
        final_tbs.push(tb);
    }

    for tb in &mut final_tbs {
        tb.ops.sort_by_key(|&id| dag.op(id).scheduling_key(id));
        for (step, &id) in tb.ops.iter().enumerate() {
            dag.op_mut(id).step = step as i32;
        }
    }
    for (tb_id, tb) in final_tbs.iter().enumerate() {
        for &id in &tb.ops {
            dag.op_mut(id).tb = tb_id as i32;
        }
    }

    dag.tbs[rank as usize] = final_tbs;
    Ok(())
}

fn is_start(dag: &RankDag, id: OpId) -> bool {
    dag.op(id).inst == Instruction::Start
}

fn conflict(rank: Rank, tb: i32, direction: PeerDirection, existing: i32, requested: i32) -> CompileError {
    CompileError::ThreadblockPeerConflict {
        rank,
        tb: tb as TbId,
        direction,
        existing: existing as Rank,
        requested: requested as Rank,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferName;
    use crate::op::ChunkRef;
    use crate::rank_dag::RankDag;

    #[test]
    fn auto_assignment_separates_distinct_peers() {
        let mut dag = RankDag::new(3);
        let seed = ChunkRef::new(0, BufferName::Input, 0, 1);
        dag.add_start(0, seed.clone());
        let to1 = ChunkRef::new(1, BufferName::Output, 0, 1);
        let to2 = ChunkRef::new(2, BufferName::Output, 0, 1);
        dag.add_send(0, seed.clone(), to1, 0, 0, -1, -1);
        dag.add_send(0, seed, to2, 0, 0, -1, -1);

        assign_threadblocks(&mut dag).unwrap();
        assert_eq!(dag.tbs[0].len(), 2);
        assert_ne!(dag.tbs[0][0].send, dag.tbs[0][1].send);
    }

    #[test]
    fn auto_assignment_merges_same_peer_send_and_recv() {
        let mut dag = RankDag::new(2);
        let seed = ChunkRef::new(0, BufferName::Input, 0, 1);
        dag.add_start(0, seed.clone());
        let to1 = ChunkRef::new(1, BufferName::Output, 0, 1);
        dag.add_send(0, seed, to1, 0, 0, -1, -1);

        let from1 = ChunkRef::new(1, BufferName::Input, 0, 1);
        let local = ChunkRef::new(0, BufferName::Output, 1, 1);
        dag.add_recv(0, from1, local, 1, 1, -1, -1);

        assign_threadblocks(&mut dag).unwrap();
        assert_eq!(dag.tbs[0].len(), 1);
        assert_eq!(dag.tbs[0][0].send, 1);
        assert_eq!(dag.tbs[0][0].recv, 1);
    }

    #[test]
    fn manual_peer_conflict_is_rejected() {
        let mut dag = RankDag::new(3);
        let seed = ChunkRef::new(0, BufferName::Input, 0, 1);
        dag.add_start(0, seed.clone());
        let to1 = ChunkRef::new(1, BufferName::Output, 0, 1);
        let to2 = ChunkRef::new(2, BufferName::Output, 0, 1);
        dag.add_send(0, seed.clone(), to1, 0, 0, 5, -1);
        dag.add_send(0, seed, to2, 0, 0, 5, -1);

        assert!(assign_threadblocks(&mut dag).is_err());
    }
}
