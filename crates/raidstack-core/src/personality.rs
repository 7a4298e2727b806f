//! RAID personalities and their registry.
//!
//! A personality maps logical I/O onto base-device I/O for one RAID level.
//! The engine only depends on the capability surface below; the mapping math
//! itself (striping, parity, mirror read policy) lives behind it.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use parking_lot::RwLock;
use raidstack_bdev::IoStatus;
use tracing::error;

use crate::array::RaidArray;
use crate::error::{RaidError, RaidResult};
use crate::io::RaidIo;
use crate::types::RaidLevel;

/// Degradation tolerance declared by a personality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constraint {
    /// All slots must stay operational.
    Unset,
    /// At most this many slots may be removed.
    MaxRemoved(u8),
    /// At least this many slots must stay operational.
    MinOperational(u8),
}

impl Constraint {
    /// Minimum operational slot count for an array of `num_base` slots.
    pub fn min_operational(&self, num_base: u8) -> RaidResult<u8> {
        let min = match self {
            Constraint::Unset => num_base,
            Constraint::MaxRemoved(removed) => num_base.checked_sub(*removed).unwrap_or(0),
            Constraint::MinOperational(min) => *min,
        };
        if min == 0 || min > num_base {
            return Err(RaidError::InvalidParameter(format!(
                "constraint {self:?} is invalid for {num_base} base devices"
            )));
        }
        Ok(min)
    }
}

/// Capability interface consumed by the engine.
///
/// `start`/`stop` bracket the array's ONLINE lifetime. `submit_rw` is the
/// only mandatory data-path hook; FLUSH and UNMAP are routed to
/// `submit_null_payload` only when `supports_null_payload` says so.
#[async_trait]
pub trait Personality: Send + Sync {
    fn level(&self) -> RaidLevel;

    /// Minimum number of slots an array of this level may have.
    fn min_base_devices(&self) -> u8;

    fn constraint(&self) -> Constraint {
        Constraint::Unset
    }

    /// Called during configuration; must set the array's block count.
    fn start(&self, array: &RaidArray) -> RaidResult<()>;

    /// Called during destruct. Returning `false` means the stop continues
    /// asynchronously and the personality will call
    /// [`RaidArray::personality_stop_done`] when finished.
    fn stop(&self, _array: &RaidArray) -> bool {
        true
    }

    fn supports_resize(&self) -> bool {
        false
    }

    /// Geometry update after a slot was added or a base device grew.
    fn resize(&self, _array: &RaidArray) -> RaidResult<()> {
        Err(RaidError::Unsupported("personality has no resize hook".into()))
    }

    fn supports_null_payload(&self) -> bool {
        false
    }

    fn memory_domains_supported(&self) -> bool {
        false
    }

    /// Optional personality-private context attached to every worker
    /// channel.
    fn make_channel_ctx(&self, _array: &RaidArray) -> Option<Box<dyn Any + Send + Sync>> {
        None
    }

    /// Submit a READ or WRITE. The personality decides the fan-out, sets the
    /// request's remaining count and reports child completions through
    /// [`RaidIo::complete_part`].
    async fn submit_rw(&self, io: &RaidIo);

    /// Submit a FLUSH or UNMAP. Only routed when `supports_null_payload`
    /// returns true.
    async fn submit_null_payload(&self, io: &RaidIo) {
        error!(level = %self.level(), "null-payload submission without support");
        io.complete(IoStatus::Failed);
    }
}

/// Table of installed personalities, keyed by level.
#[derive(Default)]
pub struct PersonalityRegistry {
    table: RwLock<HashMap<RaidLevel, Arc<dyn Personality>>>,
}

impl PersonalityRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a personality. Fails if one is already registered for the
    /// level.
    pub fn register(&self, personality: Arc<dyn Personality>) -> RaidResult<()> {
        let level = personality.level();
        let mut table = self.table.write();
        if table.contains_key(&level) {
            return Err(RaidError::AlreadyExists(format!(
                "personality for level '{level}'"
            )));
        }
        table.insert(level, personality);
        Ok(())
    }

    pub fn find(&self, level: RaidLevel) -> Option<Arc<dyn Personality>> {
        self.table.read().get(&level).map(Arc::clone)
    }

    /// The process-wide registry. Personalities register here once at
    /// process init.
    pub fn global() -> &'static Arc<PersonalityRegistry> {
        static GLOBAL: OnceLock<Arc<PersonalityRegistry>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(PersonalityRegistry::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constraint_unset_requires_all() {
        assert_eq!(Constraint::Unset.min_operational(4).unwrap(), 4);
    }

    #[test]
    fn test_constraint_max_removed() {
        assert_eq!(Constraint::MaxRemoved(1).min_operational(3).unwrap(), 2);
        // removing more slots than exist leaves an invalid minimum
        assert!(Constraint::MaxRemoved(4).min_operational(4).is_err());
    }

    #[test]
    fn test_constraint_min_operational() {
        assert_eq!(Constraint::MinOperational(1).min_operational(2).unwrap(), 1);
        assert!(Constraint::MinOperational(5).min_operational(4).is_err());
        assert!(Constraint::MinOperational(0).min_operational(4).is_err());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        use crate::test_util::MirrorPersona;

        let registry = PersonalityRegistry::new();
        registry.register(Arc::new(MirrorPersona)).unwrap();
        assert!(matches!(
            registry.register(Arc::new(MirrorPersona)),
            Err(RaidError::AlreadyExists(_))
        ));
    }
}
