//! Forks.
//!
//! A [`ForkSchedule`] maps chain time (epochs) and [`ForkDigest`]s to [`Fork`]s, a [`ForkContext`]
//! additionally tracks the current epoch.
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use serde::{Deserialize, Serialize};

use beacon_ssz::{hash_tree_root, ContainerBuilder, TypeDescriptor, Value};

use crate::{constants::FORK_DIGEST_LEN, ChainConfig, ConfigError, Root};

/// The protocol forks, in order of activation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ForkName {
    Phase0,
    Altair,
    Bellatrix,
    Capella,
    Deneb,
}

/// The first 4 bytes of the root of a fork's version and the genesis validators root.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ForkDigest(pub [u8; FORK_DIGEST_LEN]);

impl fmt::Display for ForkDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for ForkDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ForkDigest({self})")
    }
}

impl ForkDigest {
    /// Computes the digest of `version` for a chain with `genesis_validators_root`.
    ///
    /// # Errors
    ///
    /// Only fails if the fork data container can't be merkleized, which can't happen for well
    /// formed inputs.
    pub fn compute(
        version: [u8; 4],
        genesis_validators_root: Root,
    ) -> Result<Self, beacon_ssz::EncodeError> {
        let fork_data = ContainerBuilder::new("ForkData")
            .field("current_version", TypeDescriptor::byte_vector(4))
            .field("genesis_validators_root", TypeDescriptor::byte_vector(32))
            .build();

        let root = hash_tree_root(
            &Value::Container(vec![
                Value::Bytes(version.to_vec()),
                Value::Bytes(genesis_validators_root.to_vec()),
            ]),
            &fork_data,
        )?;

        let mut digest = [0; FORK_DIGEST_LEN];
        digest.copy_from_slice(&root[..FORK_DIGEST_LEN]);
        Ok(Self(digest))
    }
}

/// A fork in the [`ForkSchedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fork {
    /// The fork.
    pub name: ForkName,
    /// The fork version.
    pub version: [u8; 4],
    /// The epoch this fork activates at.
    pub epoch: u64,
    /// The digest of this fork.
    pub digest: ForkDigest,
}

/// The schedule of forks of a network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkSchedule {
    /// The forks, sorted by activation epoch, the first activates at genesis.
    forks: Vec<Fork>,
    slots_per_epoch: u64,
}

impl ForkSchedule {
    /// Builds the schedule from a [`ChainConfig`].
    ///
    /// # Errors
    ///
    /// Returns an error if the schedule is empty, does not start at epoch 0 or is out of order.
    pub fn new(config: &ChainConfig) -> Result<Self, ConfigError> {
        let first = config.forks.first().ok_or(ConfigError::EmptyForkSchedule)?;
        if first.epoch != 0 {
            return Err(ConfigError::GenesisForkNotAtZero);
        }

        let ordered = config
            .forks
            .windows(2)
            .all(|w| w[0].epoch <= w[1].epoch && w[0].name < w[1].name);
        if !ordered {
            return Err(ConfigError::ForksOutOfOrder);
        }

        let forks = config
            .forks
            .iter()
            .map(|f| {
                let version = f.version.to_be_bytes();
                Ok(Fork {
                    name: f.name,
                    version,
                    epoch: f.epoch,
                    digest: ForkDigest::compute(version, config.genesis_validators_root)?,
                })
            })
            .collect::<Result<_, ConfigError>>()?;

        Ok(Self {
            forks,
            slots_per_epoch: config.slots_per_epoch.max(1),
        })
    }

    /// Returns the fork active at `epoch`.
    pub fn fork_at_epoch(&self, epoch: u64) -> &Fork {
        self.forks
            .iter()
            .rev()
            .find(|f| f.epoch <= epoch)
            .unwrap_or(&self.forks[0])
    }

    /// Returns the fork active at `slot`.
    pub fn fork_at_slot(&self, slot: u64) -> &Fork {
        self.fork_at_epoch(slot / self.slots_per_epoch)
    }

    /// Returns the fork with `digest`, if it is in this schedule.
    pub fn fork_by_digest(&self, digest: &ForkDigest) -> Option<&Fork> {
        self.forks.iter().find(|f| &f.digest == digest)
    }

    /// Returns the scheduled fork called `name`.
    pub fn fork(&self, name: ForkName) -> Option<&Fork> {
        self.forks.iter().find(|f| f.name == name)
    }

    /// Returns all scheduled forks, in order of activation.
    pub fn forks(&self) -> &[Fork] {
        &self.forks
    }

    /// Returns the amount of slots in an epoch.
    pub const fn slots_per_epoch(&self) -> u64 {
        self.slots_per_epoch
    }
}

/// A [`ForkSchedule`] together with the current epoch.
///
/// The epoch is updated by whoever drives chain time, readers always see the latest value.
#[derive(Debug, Clone)]
pub struct ForkContext {
    schedule: Arc<ForkSchedule>,
    current_epoch: Arc<AtomicU64>,
}

impl ForkContext {
    /// Creates a new [`ForkContext`] starting at `epoch`.
    pub fn new(schedule: Arc<ForkSchedule>, epoch: u64) -> Self {
        Self {
            schedule,
            current_epoch: Arc::new(AtomicU64::new(epoch)),
        }
    }

    /// Sets the current epoch.
    pub fn set_epoch(&self, epoch: u64) {
        self.current_epoch.store(epoch, Ordering::Release);
    }

    /// Returns the current epoch.
    pub fn current_epoch(&self) -> u64 {
        self.current_epoch.load(Ordering::Acquire)
    }

    /// Returns the fork active at the current epoch.
    pub fn current_fork(&self) -> &Fork {
        self.schedule.fork_at_epoch(self.current_epoch())
    }

    /// Returns the underlying [`ForkSchedule`].
    pub fn schedule(&self) -> &ForkSchedule {
        &self.schedule
    }
}
