//! Consistent Hash Ring
//!
//! Maps keys onto a dynamic set of node identifiers with minimal
//! reshuffling when membership changes. Each node owns several
//! virtual positions on a 32-bit circle; a key belongs to the node at
//! the first position at or after the key's own hash, wrapping at the
//! top.
//!
//! Every party that routes by key must hash identically, so positions
//! are FNV-1a over `"<node>:<replica>"` and lookups are FNV-1a over
//! the raw key bytes. Two nodes landing on the same position is
//! resolved to the lexicographically smallest identifier, determined
//! purely by the membership set, never by insertion order.

use crate::hash::fnv1a32;
use std::collections::{BTreeMap, BTreeSet};

/// Virtual positions per node. More positions smooth the load split;
/// this default matches what the routing clients expect.
pub const DEFAULT_REPLICAS: usize = 20;

#[derive(Debug, Clone)]
pub struct HashRing {
    replicas: usize,
    /// position -> every node whose virtual point landed there.
    positions: BTreeMap<u32, BTreeSet<String>>,
    nodes: BTreeSet<String>,
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new(DEFAULT_REPLICAS)
    }
}

impl HashRing {
    pub fn new(replicas: usize) -> Self {
        assert!(replicas > 0, "a node needs at least one position");
        Self {
            replicas,
            positions: BTreeMap::new(),
            nodes: BTreeSet::new(),
        }
    }

    /// Adds a node's virtual positions. Re-adding is a no-op.
    pub fn add(&mut self, node: &str) {
        if !self.nodes.insert(node.to_string()) {
            return;
        }
        for i in 0..self.replicas {
            let position = fnv1a32(format!("{node}:{i}").as_bytes());
            self.positions
                .entry(position)
                .or_default()
                .insert(node.to_string());
        }
    }

    /// Removes every position owned by `node`.
    pub fn remove(&mut self, node: &str) {
        if !self.nodes.remove(node) {
            return;
        }
        for i in 0..self.replicas {
            let position = fnv1a32(format!("{node}:{i}").as_bytes());
            if let Some(owners) = self.positions.get_mut(&position) {
                owners.remove(node);
                if owners.is_empty() {
                    self.positions.remove(&position);
                }
            }
        }
    }

    /// The node responsible for `key`, or `None` on an empty ring.
    pub fn get(&self, key: &str) -> Option<&str> {
        if self.positions.is_empty() {
            return None;
        }
        let hash = fnv1a32(key.as_bytes());
        let owners = self
            .positions
            .range(hash..)
            .next()
            .or_else(|| self.positions.iter().next())
            .map(|(_, owners)| owners)?;
        owners.iter().next().map(String::as_str)
    }

    pub fn contains(&self, node: &str) -> bool {
        self.nodes.contains(node)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::distributions::Alphanumeric;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;

    fn random_keys(n: usize) -> Vec<String> {
        // Seeded so the distribution assertions cannot flake.
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        (0..n)
            .map(|_| (&mut rng).sample_iter(&Alphanumeric).take(12).map(char::from).collect())
            .collect()
    }

    #[test]
    fn empty_ring_has_no_owner() {
        let ring = HashRing::default();
        assert_eq!(ring.get("anything"), None);
    }

    #[test]
    fn single_node_owns_everything() {
        let mut ring = HashRing::default();
        ring.add("n1");

        assert_eq!(ring.get("anything"), Some("n1"));
        assert_eq!(ring.get("else"), Some("n1"));
    }

    #[test]
    fn mapping_ignores_insertion_order() {
        let mut forward = HashRing::default();
        forward.add("alpha");
        forward.add("beta");
        forward.add("gamma");

        let mut reverse = HashRing::default();
        reverse.add("gamma");
        reverse.add("beta");
        reverse.add("alpha");

        for key in random_keys(500) {
            assert_eq!(forward.get(&key), reverse.get(&key));
        }
    }

    #[test]
    fn remove_and_re_add_restores_the_mapping() {
        let mut ring = HashRing::default();
        ring.add("n1");
        ring.add("n2");
        ring.add("n3");

        let keys = random_keys(500);
        let before: Vec<_> = keys.iter().map(|k| ring.get(k).unwrap().to_string()).collect();

        ring.remove("n2");
        ring.add("n2");

        for (key, owner) in keys.iter().zip(&before) {
            assert_eq!(ring.get(key), Some(owner.as_str()));
        }
    }

    #[test]
    fn removal_never_moves_keys_between_survivors() {
        let mut ring = HashRing::default();
        ring.add("n1");
        ring.add("n2");

        let keys = random_keys(1000);
        let owned_by_n2: Vec<_> = keys
            .iter()
            .filter(|k| ring.get(k) == Some("n2"))
            .cloned()
            .collect();
        assert!(!owned_by_n2.is_empty());

        ring.remove("n1");
        // Everything lands on n2 now, and in particular nothing that
        // was already on n2 moved.
        for key in &keys {
            assert_eq!(ring.get(key), Some("n2"));
        }
        for key in &owned_by_n2 {
            assert_eq!(ring.get(key), Some("n2"));
        }
    }

    #[test]
    fn removing_one_of_three_reassigns_about_a_third() {
        let mut ring = HashRing::default();
        ring.add("n1");
        ring.add("n2");
        ring.add("n3");

        let keys = random_keys(10_000);
        let before: HashMap<&String, String> = keys
            .iter()
            .map(|k| (k, ring.get(k).unwrap().to_string()))
            .collect();

        ring.remove("n3");

        let moved = keys
            .iter()
            .filter(|k| before[*k] != ring.get(k).unwrap())
            .count();
        let lost = keys.iter().filter(|k| before[*k] == "n3").count();

        // Only keys that belonged to the removed node move.
        assert_eq!(moved, lost);
        assert!(moved > 0);
        // At most about a third of the keyspace, with 20% slack for
        // the lumpiness of 20 virtual nodes.
        assert!(moved <= 4_000, "moved {moved} of 10000");
    }

    #[test]
    fn duplicate_add_is_idempotent() {
        let mut ring = HashRing::default();
        ring.add("n1");
        let snapshot: Vec<_> = random_keys(100)
            .iter()
            .map(|k| ring.get(k).unwrap().to_string())
            .collect();

        ring.add("n1");
        assert_eq!(ring.len(), 1);
        for (key, owner) in random_keys(100).iter().zip(&snapshot) {
            assert_eq!(ring.get(key), Some(owner.as_str()));
        }
    }
}
