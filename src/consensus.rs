//! Consensus parameters gating soft fork deployments, plus the built-in
//! parameter sets for the public chains and the dev chain.

use crate::error::SpecError;
use crate::versionbits::{
    ActiveMode, Deployment, DeploymentPos, ThresholdState, ThresholdStateStatistics, Versionbits,
    VersionbitsCache, VersionbitsConditionChecker, VersionbitsIndexer, NO_TIMEOUT,
    VERSIONBITS_NUM_BITS, VERSIONBITS_TOP_BITS,
};
use crate::{BlockId, BlockNumber, Version};
use log::debug;
use std::collections::HashMap;

/// Signalling window length on the public chains.
pub const DEFAULT_MINER_CONFIRMATION_WINDOW: BlockNumber = 2016;
/// Mainnet lock-in threshold, 95% of the window.
pub const MAINNET_ACTIVATION_THRESHOLD: u64 = 1916;
/// Testnet lock-in threshold, 75% of the window.
pub const TESTNET_ACTIVATION_THRESHOLD: u64 = 1512;
/// Dev chain signalling window length.
pub const DEV_MINER_CONFIRMATION_WINDOW: BlockNumber = 144;
/// Dev chain lock-in threshold, 75% of the window.
pub const DEV_ACTIVATION_THRESHOLD: u64 = 108;

/// Frozen consensus parameters plus the shared threshold state cache.
///
/// Constructed through [`ConsensusBuilder`] (or a chain spec), which
/// validates the deployment table; parameters are immutable afterwards.
#[derive(Clone, Debug)]
pub struct Consensus {
    /// Chain name.
    pub id: String,
    /// Length in blocks of one signalling window.
    pub miner_confirmation_window: BlockNumber,
    /// Signalling blocks required within one window to lock a deployment in.
    pub activation_threshold: u64,
    /// Soft fork deployments gated on version bits.
    pub deployments: HashMap<DeploymentPos, Deployment>,
    /// Per-deployment threshold state caches, shared by all queries.
    pub versionbits_caches: VersionbitsCache,
}

impl Consensus {
    /// State of the deployment for the successor of `parent`.
    pub fn versionbits_state<I: VersionbitsIndexer>(
        &self,
        pos: DeploymentPos,
        parent: Option<BlockId>,
        indexer: &I,
    ) -> Option<ThresholdState> {
        let cache = self.versionbits_caches.cache(&pos)?;
        Versionbits::new(pos, self).get_state(parent, cache, indexer)
    }

    /// Lowest height at which the deployment's current state was reached.
    pub fn versionbits_state_since_height<I: VersionbitsIndexer>(
        &self,
        pos: DeploymentPos,
        parent: Option<BlockId>,
        indexer: &I,
    ) -> Option<BlockNumber> {
        let cache = self.versionbits_caches.cache(&pos)?;
        Versionbits::new(pos, self).get_state_since_height(parent, cache, indexer)
    }

    /// Signalling statistics for the window `block` belongs to.
    pub fn versionbits_statistics<I: VersionbitsIndexer>(
        &self,
        pos: DeploymentPos,
        block: BlockId,
        indexer: &I,
    ) -> Option<ThresholdStateStatistics> {
        self.deployments.get(&pos)?;
        Versionbits::new(pos, self).get_statistics(block, indexer)
    }

    /// Bit mask selecting the deployment's signalling bit.
    pub fn versionbits_mask(&self, pos: DeploymentPos) -> Option<Version> {
        self.deployments
            .get(&pos)
            .map(|deployment| 1u32 << u32::from(deployment.bit))
    }

    /// Version word a block mined on top of `parent` should carry: the top
    /// bits pattern, plus the bit of every deployment that is currently
    /// `Started` or `LockedIn`. Signalling continues through `LockedIn` so
    /// observers see intent until activation.
    pub fn compute_versionbits<I: VersionbitsIndexer>(
        &self,
        parent: Option<BlockId>,
        indexer: &I,
    ) -> Option<Version> {
        let mut version = VERSIONBITS_TOP_BITS;

        for pos in self.deployments.keys() {
            let vbits = Versionbits::new(*pos, self);
            let cache = self.versionbits_caches.cache(pos)?;
            let state = vbits.get_state(parent, cache, indexer)?;
            if matches!(state, ThresholdState::Started | ThresholdState::LockedIn) {
                version |= vbits.mask();
            }
        }

        Some(version)
    }

    /// Validates the deployment table against the window parameters.
    ///
    /// Runs before any evaluation; the builder calls it, so a `Consensus`
    /// obtained through the public path is already checked.
    pub fn check_deployments(&self) -> Result<(), SpecError> {
        let window = self.miner_confirmation_window;
        if window == 0 {
            return Err(SpecError::ZeroWindow);
        }
        if self.activation_threshold > window {
            return Err(SpecError::ThresholdTooLarge {
                threshold: self.activation_threshold,
                window,
            });
        }

        let mut entries: Vec<(DeploymentPos, &Deployment)> = self
            .deployments
            .iter()
            .map(|(pos, deployment)| (*pos, deployment))
            .collect();
        entries.sort_by_key(|(pos, _)| *pos);

        for (pos, deployment) in &entries {
            if deployment.bit >= VERSIONBITS_NUM_BITS {
                return Err(SpecError::InvalidBit {
                    pos: *pos,
                    bit: deployment.bit,
                });
            }
            match deployment.active_mode {
                ActiveMode::Always | ActiveMode::Never => {
                    if deployment.min_activation != 0 {
                        return Err(SpecError::SentinelActivation { pos: *pos });
                    }
                }
                ActiveMode::Normal => {
                    if deployment.timeout != NO_TIMEOUT && deployment.start >= deployment.timeout {
                        return Err(SpecError::InvalidWindow {
                            pos: *pos,
                            start: deployment.start,
                            timeout: deployment.timeout,
                        });
                    }
                    if deployment.start % window != 0 {
                        return Err(SpecError::UnalignedStart {
                            pos: *pos,
                            start: deployment.start,
                            window,
                        });
                    }
                    if deployment.min_activation % window != 0 {
                        return Err(SpecError::UnalignedActivation {
                            pos: *pos,
                            min_activation: deployment.min_activation,
                            window,
                        });
                    }
                }
            }
        }

        // Deployments sharing a bit must keep their signalling windows
        // disjoint, or a signal would count for both.
        for (i, (pos_a, a)) in entries.iter().enumerate() {
            if a.active_mode != ActiveMode::Normal {
                continue;
            }
            for (pos_b, b) in entries.iter().skip(i + 1) {
                if b.active_mode != ActiveMode::Normal || a.bit != b.bit {
                    continue;
                }
                if a.timeout > b.start && b.timeout > a.start {
                    return Err(SpecError::OverlappingBit {
                        first: *pos_a,
                        second: *pos_b,
                        bit: a.bit,
                    });
                }
            }
        }

        Ok(())
    }

    /// Drops all cached threshold states.
    pub fn clear_versionbits_caches(&self) {
        self.versionbits_caches.clear();
    }
}

/// Builder for [`Consensus`]; `build` validates the deployment table and
/// wires up the shared caches.
pub struct ConsensusBuilder {
    inner: Consensus,
}

impl ConsensusBuilder {
    /// Starts a builder from the window length and lock-in threshold.
    pub fn new(miner_confirmation_window: BlockNumber, activation_threshold: u64) -> Self {
        ConsensusBuilder {
            inner: Consensus {
                id: "main".to_owned(),
                miner_confirmation_window,
                activation_threshold,
                deployments: HashMap::new(),
                versionbits_caches: VersionbitsCache::default(),
            },
        }
    }

    /// Sets the chain name.
    pub fn id<S: Into<String>>(mut self, id: S) -> Self {
        self.inner.id = id.into();
        self
    }

    /// Sets the soft fork deployment table.
    pub fn softfork_deployments(mut self, deployments: HashMap<DeploymentPos, Deployment>) -> Self {
        self.inner.deployments = deployments;
        self
    }

    /// Validates the parameters and freezes them into a `Consensus`.
    pub fn build(self) -> Result<Consensus, SpecError> {
        let mut consensus = self.inner;
        consensus.check_deployments()?;
        consensus.versionbits_caches = VersionbitsCache::new(consensus.deployments.keys());
        debug!(
            "consensus {} loaded with {} softfork deployments",
            consensus.id,
            consensus.deployments.len()
        );
        Ok(consensus)
    }
}

/// Mainnet consensus parameters.
pub fn mainnet() -> Result<Consensus, SpecError> {
    let mut deployments = HashMap::new();
    deployments.insert(
        DeploymentPos::Testdummy,
        Deployment {
            bit: 27,
            start: 0,
            timeout: NO_TIMEOUT,
            min_activation: 0,
            lock_in_on_timeout: false,
            active_mode: ActiveMode::Never,
        },
    );
    deployments.insert(
        DeploymentPos::Taproot,
        Deployment {
            bit: 2,
            start: 687_456,
            timeout: 737_856,
            min_activation: 709_632,
            lock_in_on_timeout: false,
            active_mode: ActiveMode::Normal,
        },
    );

    ConsensusBuilder::new(DEFAULT_MINER_CONFIRMATION_WINDOW, MAINNET_ACTIVATION_THRESHOLD)
        .id("mainnet")
        .softfork_deployments(deployments)
        .build()
}

/// Testnet consensus parameters.
pub fn testnet() -> Result<Consensus, SpecError> {
    let mut deployments = HashMap::new();
    deployments.insert(
        DeploymentPos::Testdummy,
        Deployment {
            bit: 27,
            start: 0,
            timeout: NO_TIMEOUT,
            min_activation: 0,
            lock_in_on_timeout: false,
            active_mode: ActiveMode::Never,
        },
    );
    deployments.insert(
        DeploymentPos::Taproot,
        Deployment {
            bit: 2,
            start: 645_120,
            timeout: 695_520,
            min_activation: 0,
            lock_in_on_timeout: false,
            active_mode: ActiveMode::Normal,
        },
    );

    ConsensusBuilder::new(DEFAULT_MINER_CONFIRMATION_WINDOW, TESTNET_ACTIVATION_THRESHOLD)
        .id("testnet")
        .softfork_deployments(deployments)
        .build()
}

/// Dev chain consensus parameters, short windows for integration tests.
pub fn dev() -> Result<Consensus, SpecError> {
    let mut deployments = HashMap::new();
    deployments.insert(
        DeploymentPos::Testdummy,
        Deployment {
            bit: 27,
            start: 0,
            timeout: NO_TIMEOUT,
            min_activation: 0,
            lock_in_on_timeout: false,
            active_mode: ActiveMode::Normal,
        },
    );
    deployments.insert(
        DeploymentPos::Taproot,
        Deployment {
            bit: 2,
            start: 576,
            timeout: 1_584,
            min_activation: 2_592,
            lock_in_on_timeout: false,
            active_mode: ActiveMode::Normal,
        },
    );

    ConsensusBuilder::new(DEV_MINER_CONFIRMATION_WINDOW, DEV_ACTIVATION_THRESHOLD)
        .id("dev")
        .softfork_deployments(deployments)
        .build()
}
