//! Membership views and key ownership.
//!
//! Keys hash to one of `num_segments` segments. Each segment ranks every
//! member by a rendezvous weight of `(segment, member)`; the first
//! `num_owners` members of that ranking own the segment. Adding or removing
//! one member only changes the rankings in which that member participates, so
//! roughly `1/|members|` of the keys move.

use std::hash::Hash;

use crate::error::{CacheError, Result};
use crate::topology::hash::{mix64, stable_hash};
use crate::topology::Address;

// == Membership View ==
/// Immutable snapshot of the cluster membership.
///
/// Views are replaced wholesale on each topology change.
#[derive(Debug, Clone)]
pub struct MembershipView {
    topology_id: u64,
    members: Vec<Address>,
    num_segments: u32,
    /// Member indices per segment, best rendezvous weight first
    rankings: Vec<Vec<usize>>,
}

impl MembershipView {
    // == Constructor ==
    /// Creates a view over `members`. Duplicates are dropped, order is kept.
    pub fn new(topology_id: u64, members: Vec<Address>, num_segments: u32) -> Self {
        let mut unique: Vec<Address> = Vec::with_capacity(members.len());
        for member in members {
            if !unique.contains(&member) {
                unique.push(member);
            }
        }
        let num_segments = num_segments.max(1);
        let member_hashes: Vec<u64> = unique.iter().map(|m| stable_hash(m.name())).collect();

        let rankings = (0..num_segments)
            .map(|segment| {
                let segment_seed = mix64(segment as u64 ^ 0x9e37_79b9_7f4a_7c15);
                let mut ranked: Vec<(u64, usize)> = member_hashes
                    .iter()
                    .enumerate()
                    .map(|(idx, h)| (mix64(h ^ segment_seed), idx))
                    .collect();
                // ties broken by member order so every node ranks identically
                ranked.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
                ranked.into_iter().map(|(_, idx)| idx).collect()
            })
            .collect();

        Self {
            topology_id,
            members: unique,
            num_segments,
            rankings,
        }
    }

    /// An empty view, used before the first member joins.
    pub fn empty(num_segments: u32) -> Self {
        Self::new(0, Vec::new(), num_segments)
    }

    pub fn topology_id(&self) -> u64 {
        self.topology_id
    }

    pub fn members(&self) -> &[Address] {
        &self.members
    }

    pub fn num_segments(&self) -> u32 {
        self.num_segments
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.members.contains(address)
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Oldest member, used as the singleton-store coordinator.
    pub fn coordinator(&self) -> Option<&Address> {
        self.members.first()
    }

    // == Segment Of ==
    /// Maps a key to its hash segment.
    pub fn segment_of<K: Hash + ?Sized>(&self, key: &K) -> u32 {
        (stable_hash(key) % self.num_segments as u64) as u32
    }

    // == Segment Owners ==
    /// Owners of a segment, primary first.
    pub fn segment_owners(&self, segment: u32, num_owners: usize) -> Result<Vec<Address>> {
        if self.members.is_empty() {
            return Err(CacheError::InvalidTopology(format!(
                "view {} has no members",
                self.topology_id
            )));
        }
        let count = num_owners.clamp(1, self.members.len());
        let ranking = &self.rankings[(segment % self.num_segments) as usize];
        Ok(ranking
            .iter()
            .take(count)
            .map(|idx| self.members[*idx].clone())
            .collect())
    }

    // == Owners ==
    /// Owners of a key, primary first.
    pub fn owners<K: Hash + ?Sized>(&self, key: &K, num_owners: usize) -> Result<Vec<Address>> {
        self.segment_owners(self.segment_of(key), num_owners)
    }

    /// Primary owner of a key.
    pub fn primary_owner<K: Hash + ?Sized>(&self, key: &K) -> Result<Address> {
        let mut owners = self.owners(key, 1)?;
        Ok(owners.remove(0))
    }

    pub fn is_owner<K: Hash + ?Sized>(
        &self,
        key: &K,
        address: &Address,
        num_owners: usize,
    ) -> Result<bool> {
        Ok(self.owners(key, num_owners)?.contains(address))
    }

    /// Segments for which `address` is one of the first `num_owners` owners.
    pub fn locally_owned_segments(&self, address: &Address, num_owners: usize) -> Vec<u32> {
        let Some(member_idx) = self.members.iter().position(|m| m == address) else {
            return Vec::new();
        };
        let count = num_owners.clamp(1, self.members.len().max(1));
        (0..self.num_segments)
            .filter(|segment| {
                self.rankings[*segment as usize]
                    .iter()
                    .take(count)
                    .any(|idx| *idx == member_idx)
            })
            .collect()
    }

    // == Successor Views ==
    /// New view with `address` appended.
    pub fn with_member(&self, address: Address) -> Self {
        let mut members = self.members.clone();
        members.push(address);
        Self::new(self.topology_id + 1, members, self.num_segments)
    }

    /// New view without `address`.
    pub fn without_member(&self, address: &Address) -> Self {
        let members = self.members.iter().filter(|m| *m != address).cloned().collect();
        Self::new(self.topology_id + 1, members, self.num_segments)
    }
}

/// Free-function form of the ownership contract.
pub fn owners<K: Hash + ?Sized>(
    key: &K,
    view: &MembershipView,
    num_owners: usize,
) -> Result<Vec<Address>> {
    view.owners(key, num_owners)
}
