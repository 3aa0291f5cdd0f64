//! Version bits defines a finite-state-machine to deploy a soft fork in
//! multiple stages.
//!
//! Signalling is tallied over fixed-length windows of consecutive blocks.
//! The state of a window is a pure function of the chain and the deployment
//! parameters, canonicalized at the window boundary (the last block of the
//! previous window) and cached there, so evaluating a new tip costs one
//! window walk at most.

use crate::consensus::Consensus;
use crate::{BlockId, BlockNumber, Version};
use derive_more::Display;
use log::trace;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{hash_map, HashMap};
use std::sync::Arc;

/// What bits to set in version for versionbits blocks.
pub const VERSIONBITS_TOP_BITS: Version = 0x2000_0000;
/// What bitmask determines whether versionbits is in use.
pub const VERSIONBITS_TOP_MASK: Version = 0xE000_0000;
/// Total bits available for versionbits deployments.
pub const VERSIONBITS_NUM_BITS: u8 = 28;
/// Version word carried by blocks that predate version bits signalling.
pub const VERSIONBITS_LAST_OLD_BLOCK_VERSION: Version = 4;
/// Timeout sentinel for deployments that never expire.
pub const NO_TIMEOUT: BlockNumber = BlockNumber::MAX;

/// State of one deployment for one signalling window.
///
/// Transitions happen only at window boundaries; all blocks of a window
/// share the state. Without a transition the state is inherited from the
/// previous window.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ThresholdState {
    /// First state of every deployment. The window containing the genesis
    /// is by definition in this state.
    Defined,
    /// Signalling is being tallied, for windows past the start height.
    Started,
    /// The threshold was met (or the deployment locks in on timeout);
    /// activation is pending.
    LockedIn,
    /// Rules are enforced. Terminal.
    Active,
    /// The timeout passed without lock-in. Terminal.
    Failed,
}

/// Whether a deployment follows the normal signalling life cycle or is
/// pinned to one of the terminal states.
///
/// The sentinels exist so tests and chains with buried deployments don't
/// need to replay an activation.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveMode {
    /// Normal signalling and activation.
    #[default]
    Normal,
    /// The deployment is active for every block, including the empty chain.
    Always,
    /// The deployment is failed for every block.
    Never,
}

/// Identifier of each individual soft fork deployment.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
pub enum DeploymentPos {
    /// Dummy deployment for testing.
    Testdummy,
    /// Taproot (schnorr signatures and merklized script trees).
    Taproot,
}

/// Parameters of one soft fork deployment.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Deployment {
    /// Which bit in the block version word signals the deployment.
    /// Chosen from `{0, 1, ..., 27}`; the top four bits are reserved.
    pub bit: u8,
    /// First height whose window tallies signalling. Aligned to the window.
    pub start: BlockNumber,
    /// Height at which signalling ends. Once a window ends here without
    /// lock-in the deployment fails (or locks in, under
    /// `lock_in_on_timeout`) on all descendants. [`NO_TIMEOUT`] keeps
    /// signalling open forever.
    pub timeout: BlockNumber,
    /// Earliest height at which `LockedIn` may become `Active`. Aligned to
    /// the window; zero activates at the window following lock-in.
    pub min_activation: BlockNumber,
    /// Transition to `LockedIn` instead of `Failed` when the timeout is
    /// reached.
    pub lock_in_on_timeout: bool,
    /// Normal life cycle or an always/never active sentinel.
    pub active_mode: ActiveMode,
}

/// Per-deployment map from a window boundary to the state of the window
/// that follows it. Every key satisfies `(height + 1) % window == 0`;
/// entries are written once and never rewritten.
pub type Cache = Mutex<HashMap<BlockId, ThresholdState>>;

/// Caches the threshold state of every deployment at window boundaries.
///
/// Racing fills are harmless: the value is a pure function of the block
/// identity and the deployment parameters, so last-write-wins is
/// idempotent.
#[derive(Clone, Debug, Default)]
pub struct VersionbitsCache {
    caches: Arc<HashMap<DeploymentPos, Cache>>,
}

impl VersionbitsCache {
    /// Constructs a cache holding one map per deployment.
    pub fn new<'a>(deployments: impl Iterator<Item = &'a DeploymentPos>) -> Self {
        let caches: HashMap<_, _> = deployments
            .map(|pos| (*pos, Mutex::new(HashMap::new())))
            .collect();
        VersionbitsCache {
            caches: Arc::new(caches),
        }
    }

    /// Returns a reference to the cache corresponding to the deployment.
    pub fn cache(&self, pos: &DeploymentPos) -> Option<&Cache> {
        self.caches.get(pos)
    }

    /// Drops every cached state. Required when deployment parameters
    /// change, since cached states are a function of them.
    pub fn clear(&self) {
        for cache in self.caches.values() {
            cache.lock().clear();
        }
    }
}

/// Read access to the block index.
///
/// The surrounding node owns the index; the state machine only reads it.
/// Implementations are expected to override [`ancestor`] with an O(log n)
/// skip lookup; the provided method walks parent pointers.
///
/// Returning `None` from any method for a block the chain claims to
/// contain is a contract violation and aborts the evaluation.
///
/// [`ancestor`]: VersionbitsIndexer::ancestor
pub trait VersionbitsIndexer {
    /// Height of the block.
    fn block_number(&self, id: BlockId) -> Option<BlockNumber>;

    /// Version word the block carries.
    fn block_version(&self, id: BlockId) -> Option<Version>;

    /// Parent of the block, `None` for the genesis.
    fn parent(&self, id: BlockId) -> Option<BlockId>;

    /// The unique ancestor of `id` at `number`.
    fn ancestor(&self, id: BlockId, number: BlockNumber) -> Option<BlockId> {
        let mut current = id;
        let mut current_number = self.block_number(current)?;
        if current_number < number {
            return None;
        }
        while current_number > number {
            current = self.parent(current)?;
            current_number = self.block_number(current)?;
        }
        Some(current)
    }
}

/// Signalling statistics for the window a block belongs to.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct ThresholdStateStatistics {
    /// Window length in blocks.
    pub period: BlockNumber,
    /// Signalling blocks required to lock in.
    pub threshold: u64,
    /// Blocks of the window elapsed so far, the block itself included.
    pub elapsed: BlockNumber,
    /// Signalling blocks among the elapsed.
    pub count: u64,
    /// Whether the threshold can still be met within this window.
    pub possible: bool,
}

/// Threshold logic for one deployment.
///
/// The provided methods implement the automaton; implementors supply the
/// deployment descriptor and the signalling condition. Tests substitute
/// alternate descriptors by implementing this trait directly.
pub trait VersionbitsConditionChecker {
    /// First height whose window tallies signalling.
    fn start(&self) -> BlockNumber;
    /// Height at which signalling ends, or [`NO_TIMEOUT`].
    fn timeout(&self) -> BlockNumber;
    /// Earliest height at which the deployment may activate.
    fn min_activation(&self) -> BlockNumber;
    /// Whether the timeout locks the deployment in rather than failing it.
    fn lock_in_on_timeout(&self) -> bool;
    /// Normal life cycle or an always/never active sentinel.
    fn active_mode(&self) -> ActiveMode;
    /// Window length in blocks.
    fn period(&self) -> BlockNumber;
    /// Signalling blocks required within one window to lock in.
    fn threshold(&self) -> u64;
    /// Whether the block signals for the deployment.
    fn condition<I: VersionbitsIndexer>(&self, block: BlockId, indexer: &I) -> bool;

    /// Returns the state of the window containing the successor of
    /// `parent`. `None` as the parent denotes the empty chain.
    ///
    /// Walks window boundaries backward until a cached (or pre-start)
    /// boundary is found, then unwinds forward applying one transition per
    /// window and caching each boundary on the way.
    fn get_state<I: VersionbitsIndexer>(
        &self,
        parent: Option<BlockId>,
        cache: &Cache,
        indexer: &I,
    ) -> Option<ThresholdState> {
        match self.active_mode() {
            ActiveMode::Always => return Some(ThresholdState::Active),
            ActiveMode::Never => return Some(ThresholdState::Failed),
            ActiveMode::Normal => {}
        }

        let period = self.period();
        let start = self.start();
        let timeout = self.timeout();

        let parent = match parent {
            Some(id) => id,
            None => return Some(ThresholdState::Defined),
        };
        let parent_number = indexer.block_number(parent)?;
        if parent_number + 1 < period {
            return Some(ThresholdState::Defined);
        }

        // Normalize to the last block of the previous window, so that
        // (height + 1) % period == 0 holds for every cache key.
        let mut boundary =
            indexer.ancestor(parent, parent_number - ((parent_number + 1) % period))?;

        let mut g_cache = cache.lock();
        let mut to_compute = Vec::new();
        let mut state = loop {
            match g_cache.entry(boundary) {
                hash_map::Entry::Occupied(entry) => break *entry.get(),
                hash_map::Entry::Vacant(entry) => {
                    let number = indexer.block_number(boundary)?;
                    if number + 1 < start {
                        // Windows fully before the start height stay Defined.
                        entry.insert(ThresholdState::Defined);
                        break ThresholdState::Defined;
                    }
                    to_compute.push((boundary, number));
                    if number + 1 == period {
                        // Earliest boundary of the chain; the empty window
                        // before the genesis is Defined.
                        break ThresholdState::Defined;
                    }
                    boundary = indexer.ancestor(boundary, number - period)?;
                }
            }
        };

        while let Some((boundary, number)) = to_compute.pop() {
            let mut next_state = state;

            match state {
                ThresholdState::Defined => {
                    if number + 1 >= start {
                        next_state = ThresholdState::Started;
                    }
                }
                ThresholdState::Started => {
                    // The timeout test precedes the tally: a window ending
                    // at the timeout height resolves by timeout even when
                    // fully signalling.
                    if timeout != NO_TIMEOUT && number + 1 >= timeout {
                        next_state = if self.lock_in_on_timeout() {
                            ThresholdState::LockedIn
                        } else {
                            ThresholdState::Failed
                        };
                    } else {
                        // Tally the window that just ended, walking parent
                        // pointers so every block is visited exactly once.
                        let mut count = 0u64;
                        let mut block = Some(boundary);
                        for _ in 0..period {
                            let id = block?;
                            if self.condition(id, indexer) {
                                count += 1;
                            }
                            block = indexer.parent(id);
                        }
                        if count >= self.threshold() {
                            next_state = ThresholdState::LockedIn;
                        }
                    }
                }
                ThresholdState::LockedIn => {
                    if number + 1 >= self.min_activation() {
                        next_state = ThresholdState::Active;
                    }
                }
                ThresholdState::Active | ThresholdState::Failed => {
                    // Terminal states.
                }
            }

            state = next_state;
            trace!(
                "threshold state for window starting at {} is {:?}",
                number + 1,
                state
            );
            g_cache.insert(boundary, state);
        }

        Some(state)
    }

    /// Returns the lowest height at which the current state was reached,
    /// always a multiple of the window length. Sentinel deployments and
    /// `Defined` report 0.
    fn get_state_since_height<I: VersionbitsIndexer>(
        &self,
        parent: Option<BlockId>,
        cache: &Cache,
        indexer: &I,
    ) -> Option<BlockNumber> {
        if matches!(self.active_mode(), ActiveMode::Always | ActiveMode::Never) {
            return Some(0);
        }

        let init_state = self.get_state(parent, cache, indexer)?;
        if init_state == ThresholdState::Defined {
            return Some(0);
        }

        // Not Defined, so the chain extends past the first window and the
        // parent is present.
        let period = self.period();
        let parent = parent?;
        let parent_number = indexer.block_number(parent)?;
        let mut boundary =
            indexer.ancestor(parent, parent_number - ((parent_number + 1) % period))?;
        let mut boundary_number = indexer.block_number(boundary)?;

        // Step back one window at a time while the previous window carries
        // the same state; every probe is a cache hit after get_state above.
        while let Some(prev_number) = boundary_number.checked_sub(period) {
            let prev = indexer.ancestor(boundary, prev_number)?;
            if self.get_state(Some(prev), cache, indexer)? != init_state {
                break;
            }
            boundary = prev;
            boundary_number = prev_number;
        }

        Some(boundary_number + 1)
    }

    /// Signalling statistics for the window `block` belongs to.
    fn get_statistics<I: VersionbitsIndexer>(
        &self,
        block: BlockId,
        indexer: &I,
    ) -> Option<ThresholdStateStatistics> {
        let period = self.period();
        let threshold = self.threshold();
        let number = indexer.block_number(block)?;

        let elapsed = (number % period) + 1;

        let mut count = 0u64;
        let mut cursor = Some(block);
        for _ in 0..elapsed {
            let id = cursor?;
            if self.condition(id, indexer) {
                count += 1;
            }
            cursor = indexer.parent(id);
        }

        Some(ThresholdStateStatistics {
            period,
            threshold,
            elapsed,
            count,
            possible: period.saturating_sub(threshold) >= elapsed - count,
        })
    }
}

/// Checker for one deployment declared in a [`Consensus`].
pub struct Versionbits<'a> {
    pos: DeploymentPos,
    consensus: &'a Consensus,
}

impl<'a> Versionbits<'a> {
    /// Constructs a checker for the given deployment.
    pub fn new(pos: DeploymentPos, consensus: &'a Consensus) -> Self {
        Versionbits { pos, consensus }
    }

    fn deployment(&self) -> &Deployment {
        &self.consensus.deployments[&self.pos]
    }

    /// Bit mask selecting the deployment's signalling bit.
    pub fn mask(&self) -> Version {
        1u32 << u32::from(self.deployment().bit)
    }
}

impl VersionbitsConditionChecker for Versionbits<'_> {
    fn start(&self) -> BlockNumber {
        self.deployment().start
    }

    fn timeout(&self) -> BlockNumber {
        self.deployment().timeout
    }

    fn min_activation(&self) -> BlockNumber {
        self.deployment().min_activation
    }

    fn lock_in_on_timeout(&self) -> bool {
        self.deployment().lock_in_on_timeout
    }

    fn active_mode(&self) -> ActiveMode {
        self.deployment().active_mode
    }

    fn period(&self) -> BlockNumber {
        self.consensus.miner_confirmation_window
    }

    fn threshold(&self) -> u64 {
        self.consensus.activation_threshold
    }

    fn condition<I: VersionbitsIndexer>(&self, block: BlockId, indexer: &I) -> bool {
        match indexer.block_version(block) {
            Some(version) => {
                (version & VERSIONBITS_TOP_MASK) == VERSIONBITS_TOP_BITS
                    && (version & self.mask()) != 0
            }
            None => false,
        }
    }
}
