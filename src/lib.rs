//! # The Soft Fork Deployment State Machine
//!
//! A full node decides, at every block, which optional consensus rules are
//! currently active by evaluating a per-deployment threshold automaton
//! ("version bits") over the ancestor chain. This crate owns that
//! automaton, the window-boundary cache that keeps evaluation amortized
//! O(1) per new tip, the block-version signalling computation derived from
//! it, and the static validation of deployment parameters.
//!
//! The block index belongs to the surrounding node and is reached through
//! [`versionbits::VersionbitsIndexer`]; this crate performs no I/O and
//! persists nothing.
//!
//! Chain parameters are either built in (see [`consensus::mainnet`] and
//! friends) or loaded from a TOML chain spec via [`ChainSpec`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::versionbits::{ActiveMode, Deployment, DeploymentPos, NO_TIMEOUT};

pub mod consensus;
pub mod error;
pub mod versionbits;

#[cfg(test)]
mod tests;

pub use crate::consensus::{Consensus, ConsensusBuilder};
pub use crate::error::SpecError;

/// Block height in the chain.
pub type BlockNumber = u64;

/// The 32-bit version word carried by each block.
pub type Version = u32;

/// Stable identity of one block index entry.
///
/// The surrounding node keeps its index entries in an arena; the value here
/// is the entry's arena offset, which survives relocation and reorgs.
/// Threshold cache keys are block identities rather than heights, so cached
/// entries stay valid when the tip moves to another branch.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct BlockId(pub u64);

/// A chain spec describes one chain: its name and the consensus parameters
/// of its soft fork deployments.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChainSpec {
    /// Chain name, e.g. `mainnet`.
    pub name: String,
    /// Consensus parameters.
    pub params: Params,
}

/// Consensus parameters section of a chain spec.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Params {
    /// Length in blocks of one signalling window.
    pub miner_confirmation_window: BlockNumber,
    /// Signalling blocks required within one window to lock a deployment in.
    pub activation_threshold: u64,
    /// Soft fork deployments; omitted deployments are not scheduled.
    #[serde(default)]
    pub deployments: DeploymentsConfig,
}

/// Deployments section of a chain spec, one optional entry per known
/// deployment.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeploymentsConfig {
    /// Dummy deployment for testing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub testdummy: Option<DeploymentConfig>,
    /// Taproot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub taproot: Option<DeploymentConfig>,
}

/// One deployment as written in a chain spec file.
///
/// Optional fields are completed with defaults: a missing `timeout` means
/// the deployment never expires, a missing `min_activation` activates at
/// the window following lock-in, and `active_mode` defaults to the normal
/// signalling life cycle.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeploymentConfig {
    /// Signalling bit position in the block version word.
    pub bit: u8,
    /// First height whose window tallies signalling.
    #[serde(default)]
    pub start: BlockNumber,
    /// Height at which signalling ends.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<BlockNumber>,
    /// Earliest height at which the deployment may activate.
    #[serde(default)]
    pub min_activation: BlockNumber,
    /// Whether the deployment locks in at timeout instead of failing.
    #[serde(default)]
    pub lock_in_on_timeout: bool,
    /// Normal signalling, or an always/never active sentinel.
    #[serde(default)]
    pub active_mode: ActiveMode,
}

impl ChainSpec {
    /// Parses a chain spec from its TOML source.
    pub fn from_toml(source: &str) -> Result<ChainSpec, SpecError> {
        toml::from_str(source).map_err(|err| SpecError::Malformed(err.to_string()))
    }

    /// Builds the frozen [`Consensus`] this spec describes.
    ///
    /// Deployment parameters are validated here; an invalid spec never
    /// produces a usable `Consensus`.
    pub fn build_consensus(&self) -> Result<Consensus, SpecError> {
        let configured = [
            (DeploymentPos::Testdummy, &self.params.deployments.testdummy),
            (DeploymentPos::Taproot, &self.params.deployments.taproot),
        ];
        let deployments: HashMap<DeploymentPos, Deployment> = configured
            .into_iter()
            .filter_map(|(pos, config)| {
                config.as_ref().map(|config| (pos, config.to_deployment()))
            })
            .collect();

        ConsensusBuilder::new(
            self.params.miner_confirmation_window,
            self.params.activation_threshold,
        )
        .id(self.name.clone())
        .softfork_deployments(deployments)
        .build()
    }
}

impl DeploymentConfig {
    fn to_deployment(&self) -> Deployment {
        Deployment {
            bit: self.bit,
            start: self.start,
            timeout: self.timeout.unwrap_or(NO_TIMEOUT),
            min_activation: self.min_activation,
            lock_in_on_timeout: self.lock_in_on_timeout,
            active_mode: self.active_mode,
        }
    }
}
