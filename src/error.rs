//! Errors raised while loading a chain spec or validating deployments.
//!
//! Validation is total: the first rule a deployment breaks is reported
//! with the deployment's name, and no evaluation runs until the
//! parameters pass. Steady-state evaluation itself has no error channel.

use crate::versionbits::DeploymentPos;
use crate::BlockNumber;
use thiserror::Error;

/// Chain spec and deployment parameter failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpecError {
    /// The chain spec source could not be parsed.
    #[error("ChainSpec: malformed spec: {0}")]
    Malformed(String),

    /// The signalling window length must be positive.
    #[error("miner confirmation window must be positive")]
    ZeroWindow,

    /// The activation threshold cannot exceed the window length.
    #[error("activation threshold {threshold} exceeds the {window}-block window")]
    ThresholdTooLarge {
        /// Configured threshold.
        threshold: u64,
        /// Window length.
        window: BlockNumber,
    },

    /// A deployment claims a bit outside the 28 usable signalling bits.
    #[error("deployment {pos}: bit {bit} overlaps the reserved top bits")]
    InvalidBit {
        /// Offending deployment.
        pos: DeploymentPos,
        /// Configured bit.
        bit: u8,
    },

    /// A deployment's start does not precede its timeout.
    #[error("deployment {pos}: start {start} must be below timeout {timeout}")]
    InvalidWindow {
        /// Offending deployment.
        pos: DeploymentPos,
        /// Configured start height.
        start: BlockNumber,
        /// Configured timeout height.
        timeout: BlockNumber,
    },

    /// A deployment's start is not aligned to the signalling window.
    #[error("deployment {pos}: start {start} is not a multiple of the {window}-block window")]
    UnalignedStart {
        /// Offending deployment.
        pos: DeploymentPos,
        /// Configured start height.
        start: BlockNumber,
        /// Window length.
        window: BlockNumber,
    },

    /// A deployment's minimum activation height is not aligned to the
    /// signalling window.
    #[error(
        "deployment {pos}: min_activation {min_activation} is not a multiple of the {window}-block window"
    )]
    UnalignedActivation {
        /// Offending deployment.
        pos: DeploymentPos,
        /// Configured minimum activation height.
        min_activation: BlockNumber,
        /// Window length.
        window: BlockNumber,
    },

    /// An always/never active deployment must not delay activation.
    #[error("deployment {pos}: always/never active deployments must keep min_activation at 0")]
    SentinelActivation {
        /// Offending deployment.
        pos: DeploymentPos,
    },

    /// Two deployments share a bit over overlapping signalling windows.
    #[error("deployments {first} and {second} share bit {bit} with overlapping signalling windows")]
    OverlappingBit {
        /// First deployment of the offending pair.
        first: DeploymentPos,
        /// Second deployment of the offending pair.
        second: DeploymentPos,
        /// The shared bit.
        bit: u8,
    },
}
