//! Reference model for a backing chain
//!
//! The model keeps a full copy of every allocated block per layer and
//! answers reads by scanning from the top layer down to the base. It is
//! deliberately simple and slow; tests compare the engine against it.

use std::collections::{BTreeMap, BTreeSet};

/// Naive model of one backing chain, base at index 0
#[derive(Debug, Clone)]
pub struct ReferenceChain {
    block_size: u64,
    size: u64,
    /// Per layer: block index -> block contents
    layers: Vec<BTreeMap<u64, Vec<u8>>>,
}

impl ReferenceChain {
    /// Create a chain with a single empty base layer
    pub fn new(block_size: u64, size: u64) -> Self {
        ReferenceChain {
            block_size,
            size,
            layers: vec![BTreeMap::new()],
        }
    }

    /// Number of layers in the chain
    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    /// Index of the active (top) layer
    pub fn top(&self) -> usize {
        self.layers.len() - 1
    }

    /// Add a new empty active layer on top
    pub fn push_layer(&mut self) -> usize {
        self.layers.push(BTreeMap::new());
        self.top()
    }

    /// Copy-on-write `data` into the active layer at `offset`
    pub fn write(&mut self, offset: u64, data: &[u8]) {
        let bs = self.block_size;
        let end = offset + data.len() as u64;
        let top = self.top();
        let mut block = offset / bs;
        while block * bs < end {
            let block_start = block * bs;
            let mut contents = self.read_block_from(top, 0, block);
            let from = offset.max(block_start);
            let to = end.min(block_start + bs);
            let dst = (from - block_start) as usize..(to - block_start) as usize;
            let src = (from - offset) as usize..(to - offset) as usize;
            contents[dst].copy_from_slice(&data[src]);
            self.layers[top].insert(block, contents);
            block += 1;
        }
    }

    /// Logical content of the active layer
    pub fn read(&self, offset: u64, len: u64) -> Vec<u8> {
        self.read_layer(self.top(), offset, len)
    }

    /// Logical content seen through layer `layer` and everything below it
    pub fn read_layer(&self, layer: usize, offset: u64, len: u64) -> Vec<u8> {
        let bs = self.block_size;
        let mut out = Vec::with_capacity(len as usize);
        let mut pos = offset;
        let end = offset + len;
        while pos < end {
            let block = pos / bs;
            let contents = self.read_block_from(layer, 0, block);
            let in_block = (pos % bs) as usize;
            let n = ((bs - pos % bs).min(end - pos)) as usize;
            out.extend_from_slice(&contents[in_block..in_block + n]);
            pos += n as u64;
        }
        out
    }

    /// Forward merge into the active layer; `base` stays (or none if None)
    pub fn pull(&mut self, base: Option<usize>) {
        let top = self.top();
        let floor = base.map(|b| b + 1).unwrap_or(0);
        let blocks = self.blocks_in(floor, top);
        for block in blocks {
            if !self.layers[top].contains_key(&block) {
                let contents = self.read_block_from(top - 1, floor, block);
                self.layers[top].insert(block, contents);
            }
        }
        self.layers.drain(floor..top);
    }

    /// Backward merge of layers `(base, top]` into `base`
    pub fn commit(&mut self, base: usize, top: usize) {
        let blocks = self.blocks_in(base + 1, top + 1);
        for block in blocks {
            let contents = self.read_block_from(top, base + 1, block);
            self.layers[base].insert(block, contents);
        }
        self.layers.drain(base + 1..=top);
    }

    /// Total logical size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    fn blocks_in(&self, from: usize, to: usize) -> BTreeSet<u64> {
        self.layers[from..to]
            .iter()
            .flat_map(|layer| layer.keys().copied())
            .collect()
    }

    /// Block contents scanning layers `top..=floor` downward
    fn read_block_from(&self, top: usize, floor: usize, block: u64) -> Vec<u8> {
        (floor..=top)
            .rev()
            .find_map(|i| self.layers[i].get(&block).cloned())
            .unwrap_or_else(|| vec![0u8; self.block_size as usize])
    }
}
