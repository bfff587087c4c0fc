//! Post-scheduling structural checks: the final graph across threadblocks
//! must be acyclic, and matched send/recv pairs must agree on relative
//! order. Both run once, after dependency inference and before
//! replication — replication instantiates the schedule `instances` times
//! with no cross-instance edges, so acyclicity and ordering hold for the
//! replicated graph iff they hold here.

use std::collections::{HashMap, HashSet};

use crate::error::{CompileError, Rank, Result, TbId};
use crate::op::OpId;
use crate::rank_dag::RankDag;

/// A threadblock identified globally, across ranks.
type TbKey = (Rank, i32);

pub fn validate(dag: &RankDag) -> Result<()> {
    check_matched(dag)?;
    check_acyclic(dag)?;
    check_send_recv_ordering(dag)?;
    Ok(())
}

/// Every send-family op must have a matching recv-family op on the peer
/// rank, and vice versa: `matched` is filled in both directions by
/// `RankDag::link_match` when the chunk DAG lowers a cross-rank edge, so
/// an empty list here means an op crossed ranks without ever being paired.
fn check_matched(dag: &RankDag) -> Result<()> {
    for id in dag.all_op_ids() {
        let op = dag.op(id);
        if !op.matched.is_empty() {
            continue;
        }
        if op.inst.is_send() {
            let dst_rank = op.dst.as_ref().map(|r| r.rank).unwrap_or(op.rank);
            return Err(CompileError::UnmatchedSend { src_rank: op.rank, dst_rank });
        }
        if op.inst.is_recv() {
            let src_rank = op.src.as_ref().map(|r| r.rank).unwrap_or(op.rank);
            return Err(CompileError::UnmatchedSend { src_rank, dst_rank: op.rank });
        }
    }
    Ok(())
}

fn check_acyclic(dag: &RankDag) -> Result<()> {
    let mut adjacency: HashMap<TbKey, HashSet<TbKey>> = HashMap::new();
    for id in dag.all_op_ids() {
        let op = dag.op(id);
        if op.tb < 0 {
            continue;
        }
        let node = (op.rank, op.tb);
        for &dep in &op.depends {
            let dep_op = dag.op(dep);
            let from = (dep_op.rank, dep_op.tb);
            if from != node {
                adjacency.entry(from).or_default().insert(node);
            }
        }
        adjacency.entry(node).or_default();
    }

    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Visiting,
        Done,
    }
    let mut marks: HashMap<TbKey, Mark> = HashMap::new();
    let nodes: Vec<TbKey> = adjacency.keys().copied().collect();
    for start in nodes {
        if marks.contains_key(&start) {
            continue;
        }
        let mut stack = vec![(start, adjacency.get(&start).into_iter().flatten().copied().collect::<Vec<_>>().into_iter())];
        marks.insert(start, Mark::Visiting);
        while let Some((node, iter)) = stack.last_mut() {
            let node = *node;
            match iter.next() {
                Some(next) => match marks.get(&next) {
                    Some(Mark::Visiting) => {
                        return Err(CompileError::DependencyCycle { rank: next.0, tb: next.1 as TbId });
                    },
                    Some(Mark::Done) => {},
                    None => {
                        marks.insert(next, Mark::Visiting);
                        stack.push((next, adjacency.get(&next).into_iter().flatten().copied().collect::<Vec<_>>().into_iter()));
                    },
                },
                None => {
                    marks.insert(node, Mark::Done);
                    stack.pop();
                },
            }
        }
    }
    Ok(())
}

/// For every pair of matched send/recv ops that share a `(peer, channel)`
/// conversation, their relative order by `chunk_step` must match their
/// relative order by final in-threadblock `step` on both sides — a send
/// scheduled after another to the same peer/channel must not be received
/// before it.
fn check_send_recv_ordering(dag: &RankDag) -> Result<()> {
    let mut by_channel: HashMap<(Rank, Rank, i32), Vec<OpId>> = HashMap::new();
    for id in dag.all_op_ids() {
        let op = dag.op(id);
        if !op.inst.is_send() || op.matched.is_empty() {
            continue;
        }
        let Some(dst) = &op.dst else { continue };
        by_channel.entry((op.rank, dst.rank, op.channel)).or_default().push(id);
    }

    for sends in by_channel.values() {
        let mut ordered = sends.clone();
        ordered.sort_by_key(|&id| dag.op(id).chunk_step);
        for pair in ordered.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            let a_op = dag.op(a);
            let b_op = dag.op(b);
            if a_op.tb == b_op.tb && a_op.step > b_op.step {
                return Err(CompileError::OrderingViolation {
                    a_rank: a_op.rank,
                    a_tb: a_op.tb as TbId,
                    b_rank: b_op.rank,
                    b_tb: b_op.tb as TbId,
                });
            }
            if let (Some(&sa), Some(&sb)) = (a_op.matched.first(), b_op.matched.first()) {
                let ra = dag.op(sa);
                let rb = dag.op(sb);
                if ra.tb == rb.tb && ra.step > rb.step {
                    return Err(CompileError::OrderingViolation {
                        a_rank: ra.rank,
                        a_tb: ra.tb as TbId,
                        b_rank: rb.rank,
                        b_tb: rb.tb as TbId,
                    });
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferName;
    use crate::op::ChunkRef;

    #[test]
    fn two_node_cycle_is_rejected() {
        let mut dag = RankDag::new(1);
        let r = ChunkRef::new(0, BufferName::Input, 0, 1);
        let a = dag.add_start(0, r.clone());
        let out = ChunkRef::new(0, BufferName::Output, 0, 1);
        let b = dag.add_copy(0, r, out, 0, 0, 0);
        dag.op_mut(a).tb = 0;
        dag.op_mut(a).step = 0;
        dag.op_mut(b).tb = 1;
        dag.op_mut(b).step = 0;
        dag.op_mut(b).depends = vec![a];
        dag.op_mut(a).depends = vec![b];

        assert!(check_acyclic(&dag).is_err());
    }

    #[test]
    fn send_without_matching_recv_is_rejected() {
        let mut dag = RankDag::new(2);
        let seed = ChunkRef::new(0, BufferName::Input, 0, 1);
        dag.add_start(0, seed.clone());
        let out = ChunkRef::new(1, BufferName::Output, 0, 1);
        dag.add_send(0, seed, out, 0, 0, -1, -1);
        // No corresponding add_recv/link_match on rank 1.

        assert!(matches!(check_matched(&dag), Err(CompileError::UnmatchedSend { .. })));
    }

    #[test]
    fn recv_without_matching_send_is_rejected() {
        let mut dag = RankDag::new(2);
        let from0 = ChunkRef::new(0, BufferName::Input, 0, 1);
        let local = ChunkRef::new(1, BufferName::Output, 0, 1);
        dag.add_recv(1, from0, local, 0, 0, -1, -1);
        // No corresponding add_send/link_match on rank 0.

        assert!(matches!(check_matched(&dag), Err(CompileError::UnmatchedSend { .. })));
    }

    #[test]
    fn acyclic_chain_passes() {
        let mut dag = RankDag::new(1);
        let r = ChunkRef::new(0, BufferName::Input, 0, 1);
        let a = dag.add_start(0, r.clone());
        let out = ChunkRef::new(0, BufferName::Output, 0, 1);
        let b = dag.add_copy(0, r, out, 0, 0, 0);
        dag.op_mut(a).tb = 0;
        dag.op_mut(b).tb = 1;
        dag.op_mut(b).depends = vec![a];

        assert!(check_acyclic(&dag).is_ok());
    }
}
