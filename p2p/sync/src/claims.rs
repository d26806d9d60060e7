//! Claim Registry.
use std::hash::Hash;

use dashmap::{mapref::entry::Entry, DashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Claim {
    InFlight,
    Fulfilled,
}

/// Tracks which keys of a fetch are still wanted.
///
/// Every state change happens under the key's map shard lock, of any number of racing
/// [`ClaimRegistry::fulfill`] calls for one key exactly one returns `true`.
#[derive(Debug)]
pub struct ClaimRegistry<K: Eq + Hash> {
    claims: DashMap<K, Claim>,
}

impl<K: Eq + Hash> Default for ClaimRegistry<K> {
    fn default() -> Self {
        Self {
            claims: DashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone> ClaimRegistry<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `key` as wanted.
    ///
    /// Returns `false` if the key was already registered.
    pub fn register(&self, key: K) -> bool {
        match self.claims.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(e) => {
                e.insert(Claim::InFlight);
                true
            }
        }
    }

    /// Fulfills a registered key.
    ///
    /// Returns `true` if this call fulfilled it, `false` if it was already fulfilled or never
    /// registered.
    pub fn fulfill(&self, key: &K) -> bool {
        self.claims.get_mut(key).is_some_and(|mut claim| {
            let won = *claim == Claim::InFlight;
            *claim = Claim::Fulfilled;
            won
        })
    }

    /// Fulfills `key`, registering it first if needed.
    ///
    /// Used for keys that are only known once they arrive, like the items of a range.
    /// Returns `true` if this call fulfilled the key.
    pub fn fulfill_or_insert(&self, key: K) -> bool {
        match self.claims.entry(key) {
            Entry::Occupied(mut e) => {
                let won = *e.get() == Claim::InFlight;
                e.insert(Claim::Fulfilled);
                won
            }
            Entry::Vacant(e) => {
                e.insert(Claim::Fulfilled);
                true
            }
        }
    }

    pub fn is_fulfilled(&self, key: &K) -> bool {
        self.claims
            .get(key)
            .is_some_and(|claim| *claim == Claim::Fulfilled)
    }

    /// The registered keys that are not fulfilled yet.
    pub fn pending(&self) -> Vec<K> {
        self.claims
            .iter()
            .filter(|claim| *claim.value() == Claim::InFlight)
            .map(|claim| claim.key().clone())
            .collect()
    }
}
