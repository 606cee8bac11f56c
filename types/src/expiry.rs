use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
};

use crate::{Deployment, OrgId};

/// What the expiry scheduler needs to tear an org down: who, when, and which
/// provider owns the VPS.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExpiryEntry {
    pub org: OrgId,
    pub expiry: u64,
    pub provider: String,
}

impl From<Deployment> for ExpiryEntry {
    fn from(dep: Deployment) -> Self {
        Self {
            org: dep.org,
            expiry: dep.expiry,
            provider: dep.provider,
        }
    }
}

/// Index of pending expiries: a min-heap of distinct expiry blocks plus the
/// two maps `block -> {org -> entry}` and `org -> block`.
///
/// Updates use lazy heap deletion: moving an org out of a bucket may leave a
/// stale key in the heap, which [`peek`](Self::peek) filters out. Coherence
/// invariant: an org is in `org_to_block` at block `b` iff it is in the
/// bucket for `b`, and every live bucket's block is present in the heap.
#[derive(Debug, Default)]
pub struct ExpiryIndex {
    block_to_deps: HashMap<u64, HashMap<OrgId, ExpiryEntry>>,
    org_to_block: HashMap<OrgId, u64>,
    blocks: BinaryHeap<Reverse<u64>>,
}

impl ExpiryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an org not currently tracked. Used for the startup bulk load;
    /// live updates go through [`add_or_update`](Self::add_or_update).
    pub fn add(&mut self, entry: ExpiryEntry) {
        let block = entry.expiry;
        self.org_to_block.insert(entry.org, block);
        match self.block_to_deps.get_mut(&block) {
            Some(orgs) => {
                orgs.insert(entry.org, entry);
            }
            None => {
                let mut orgs = HashMap::new();
                orgs.insert(entry.org, entry);
                self.block_to_deps.insert(block, orgs);
                self.blocks.push(Reverse(block));
            }
        }
    }

    /// Insert an org, or move it to a new expiry block if already tracked.
    pub fn add_or_update(&mut self, entry: ExpiryEntry) {
        if let Some(prev) = self.org_to_block.get(&entry.org).copied() {
            if let Some(orgs) = self.block_to_deps.get_mut(&prev) {
                // the emptied bucket's heap key goes stale; peek skips it
                orgs.remove(&entry.org);
            }
        }
        self.add(entry);
    }

    /// Drop an org from the index, e.g. after an explicit stop.
    pub fn remove(&mut self, org: &OrgId) {
        if let Some(block) = self.org_to_block.remove(org) {
            if let Some(orgs) = self.block_to_deps.get_mut(&block) {
                orgs.remove(org);
            }
        }
    }

    /// The soonest expiry block with at least one org in its bucket.
    ///
    /// Discards stale heap keys (buckets emptied by updates) on the way.
    pub fn peek(&mut self) -> Option<u64> {
        while let Some(Reverse(block)) = self.blocks.peek().copied() {
            match self.block_to_deps.get(&block) {
                Some(orgs) if !orgs.is_empty() => return Some(block),
                _ => {
                    self.blocks.pop();
                    self.block_to_deps.remove(&block);
                }
            }
        }
        None
    }

    /// The bucket for a given block, if any org is deadlined there.
    pub fn bucket(&self, block: u64) -> Option<&HashMap<OrgId, ExpiryEntry>> {
        self.block_to_deps.get(&block)
    }

    /// Remove and return the bucket at the current minimum. All orgs sharing
    /// the block are evicted atomically; empty if the index is empty.
    pub fn pop_bucket(&mut self) -> HashMap<OrgId, ExpiryEntry> {
        let Some(block) = self.peek() else {
            return HashMap::new();
        };
        let orgs = self.block_to_deps.remove(&block).unwrap_or_default();
        for org in orgs.keys() {
            self.org_to_block.remove(org);
        }
        self.blocks.pop();
        orgs
    }

    pub fn is_empty(&self) -> bool {
        self.org_to_block.is_empty()
    }

    #[cfg(test)]
    fn assert_coherent(&self) {
        use std::collections::HashSet;

        for (org, block) in &self.org_to_block {
            let bucket = self
                .block_to_deps
                .get(block)
                .unwrap_or_else(|| panic!("org {org} points at missing bucket {block}"));
            assert!(bucket.contains_key(org), "org {org} missing from bucket {block}");
        }
        let heap: HashSet<u64> = self.blocks.iter().map(|Reverse(b)| *b).collect();
        for (block, orgs) in &self.block_to_deps {
            for (org, entry) in orgs {
                assert_eq!(self.org_to_block.get(org), Some(block));
                assert_eq!(entry.expiry, *block);
            }
            if !orgs.is_empty() {
                assert!(heap.contains(block), "live bucket {block} not in heap");
            }
        }
    }
}
