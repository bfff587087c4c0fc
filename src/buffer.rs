//! Per-rank buffer model.
//!
//! Input and output buffers are fixed-size, sized once by the collective's
//! `init_buffers()`. Named scratch buffers grow monotonically as the front
//! end appends slabs to them and are later assigned a contiguous offset
//! inside one global per-rank scratch region (`lower_buffers`).

use std::collections::HashMap;

use crate::chunk::ChunkValue;
use crate::error::{CompileError, Rank, Result};

/// The tagged key identifying which buffer a slot lives in: one of the two
/// built-in kinds, or a user-named scratch buffer. Slots are keyed by the
/// triple `(rank, buffer, index)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BufferName {
    Input,
    Output,
    Scratch(String),
}

/// A single `(rank, buffer, index)` triple.
pub type Slot = (Rank, BufferName, u32);

struct ScratchBuffer {
    name: String,
    slots: Vec<Option<ChunkValue>>,
    /// Offset into the rank's global scratch region, assigned by
    /// [`RankBuffers::lower_scratch_layout`]; `None` before lowering.
    offset: Option<u32>,
}

impl ScratchBuffer {
    fn new(name: String) -> Self {
        ScratchBuffer { name, slots: Vec::new(), offset: None }
    }

    fn instance_size(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Appends a new slab of `size` empty slots and returns the index of
    /// its first slot — the "-1 means allocate the next slab" behavior in
    /// `Ref::send`.
    fn append_slab(&mut self, size: u32) -> u32 {
        let index = self.slots.len() as u32;
        self.slots.resize_with(self.slots.len() + size as usize, || None);
        index
    }

    fn ensure_len(&mut self, len: u32) {
        if (len as usize) > self.slots.len() {
            self.slots.resize_with(len as usize, || None);
        }
    }
}

/// The buffer table for a single rank: one input, one output, and zero or
/// more named scratch buffers, plus the shadow simulation the front end
/// consults for provenance queries.
pub struct RankBuffers {
    input: Vec<Option<ChunkValue>>,
    output: Vec<Option<ChunkValue>>,
    scratch: Vec<ScratchBuffer>,
    scratch_index: HashMap<String, usize>,
}

impl RankBuffers {
    pub fn new(input_size: u32, output_size: u32) -> Self {
        RankBuffers {
            input: (0..input_size).map(|_| None).collect(),
            output: (0..output_size).map(|_| None).collect(),
            scratch: Vec::new(),
            scratch_index: HashMap::new(),
        }
    }

    pub fn seed_input(&mut self, index: u32, value: ChunkValue) {
        self.input[index as usize] = Some(value);
    }

    pub fn input_len(&self) -> u32 {
        self.input.len() as u32
    }

    pub fn output_len(&self) -> u32 {
        self.output.len() as u32
    }

    /// Registers a scratch buffer by name if it doesn't exist yet
    /// (`check_buffer_exists` in the original).
    pub fn ensure_scratch(&mut self, name: &str) {
        if !self.scratch_index.contains_key(name) {
            self.scratch_index.insert(name.to_string(), self.scratch.len());
            self.scratch.push(ScratchBuffer::new(name.to_string()));
        }
    }

    fn scratch_mut(&mut self, name: &str) -> &mut ScratchBuffer {
        self.ensure_scratch(name);
        let idx = self.scratch_index[name];
        &mut self.scratch[idx]
    }

    fn scratch_ref(&self, name: &str) -> Option<&ScratchBuffer> {
        self.scratch_index.get(name).map(|&i| &self.scratch[i])
    }

    pub fn scratch_instance_size(&self, name: &str) -> u32 {
        self.scratch_ref(name).map(ScratchBuffer::instance_size).unwrap_or(0)
    }

    /// Allocates the next slab of `size` slots in scratch buffer `name`,
    /// returning its starting local index.
    pub fn append_scratch_slab(&mut self, name: &str, size: u32) -> u32 {
        self.scratch_mut(name).append_slab(size)
    }

    pub fn get(&self, buffer: &BufferName, index: u32) -> Option<&ChunkValue> {
        match buffer {
            BufferName::Input => self.input[index as usize].as_ref(),
            BufferName::Output => self.output[index as usize].as_ref(),
            BufferName::Scratch(name) => {
                self.scratch_ref(name).and_then(|b| b.slots[index as usize].as_ref())
            },
        }
    }

    pub fn missing_in_range(&self, buffer: &BufferName, index: u32, size: u32) -> Vec<u32> {
        (index..index + size).filter(|&i| self.get(buffer, i).is_none()).collect()
    }

    pub fn set(&mut self, buffer: &BufferName, index: u32, value: ChunkValue) -> Result<()> {
        match buffer {
            BufferName::Input => self.input[index as usize] = Some(value),
            BufferName::Output => self.output[index as usize] = Some(value),
            BufferName::Scratch(name) => {
                let buf = self.scratch_mut(name);
                buf.ensure_len(index + 1);
                buf.slots[index as usize] = Some(value);
            },
        }
        Ok(())
    }

    /// Assigns each scratch buffer a contiguous offset into one global
    /// per-rank scratch region, in insertion order, scaled by `instances`.
    /// Returns the total size of that region.
    pub fn lower_scratch_layout(&mut self, instances: u32) -> u32 {
        let mut offset = 0u32;
        for buf in &mut self.scratch {
            buf.offset = Some(offset);
            offset += buf.instance_size() * instances;
        }
        offset
    }

    pub fn scratch_offset(&self, name: &str) -> Option<u32> {
        self.scratch_ref(name).and_then(|b| b.offset)
    }

    pub fn scratch_names(&self) -> impl Iterator<Item = &str> {
        self.scratch.iter().map(|b| b.name.as_str())
    }
}

/// Validates that `(rank, buffer, index..index+size)` lies within the
/// buffer's currently-allocated range. Scratch buffers are exempt before
/// lowering, since they grow on demand.
pub fn check_in_range(
    buffers: &RankBuffers,
    rank: Rank,
    buffer: &BufferName,
    index: u32,
    size: u32,
) -> Result<()> {
    let len = match buffer {
        BufferName::Input => buffers.input_len(),
        BufferName::Output => buffers.output_len(),
        BufferName::Scratch(name) => buffers.scratch_instance_size(name),
    };
    if index + size > len {
        return Err(CompileError::UnreachableSlot {
            rank,
            buffer: buffer.clone(),
            index,
            inst: crate::op::Instruction::Nop,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_grows_monotonically() {
        let mut buffers = RankBuffers::new(4, 4);
        let a = buffers.append_scratch_slab("s", 3);
        let b = buffers.append_scratch_slab("s", 5);
        assert_eq!(a, 0);
        assert_eq!(b, 3);
        assert_eq!(buffers.scratch_instance_size("s"), 8);
    }

    #[test]
    fn scratch_layout_offsets_scale_with_instances() {
        let mut buffers = RankBuffers::new(0, 0);
        buffers.append_scratch_slab("a", 3);
        buffers.append_scratch_slab("b", 5);
        let total = buffers.lower_scratch_layout(2);
        assert_eq!(buffers.scratch_offset("a"), Some(0));
        assert_eq!(buffers.scratch_offset("b"), Some(6));
        assert_eq!(total, 16);
    }
}
