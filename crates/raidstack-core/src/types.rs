//! Core enums shared across the engine.

use std::fmt;
use std::str::FromStr;

use crate::error::RaidError;

/// RAID level of an array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RaidLevel {
    /// Striping.
    Raid0,
    /// Mirroring.
    Raid1,
    /// Parity with single-failure tolerance.
    Raid5f,
    /// Simple concatenation.
    Concat,
}

const LEVEL_NAMES: &[(&str, RaidLevel)] = &[
    ("raid0", RaidLevel::Raid0),
    ("0", RaidLevel::Raid0),
    ("raid1", RaidLevel::Raid1),
    ("1", RaidLevel::Raid1),
    ("raid5f", RaidLevel::Raid5f),
    ("5f", RaidLevel::Raid5f),
    ("concat", RaidLevel::Concat),
];

impl RaidLevel {
    /// Wire encoding used in the on-disk superblock.
    #[must_use]
    pub fn to_wire(self) -> u32 {
        match self {
            RaidLevel::Raid0 => 0,
            RaidLevel::Raid1 => 1,
            RaidLevel::Raid5f => 95,
            RaidLevel::Concat => 99,
        }
    }

    /// Decode the superblock encoding.
    pub fn from_wire(value: u32) -> Result<Self, RaidError> {
        match value {
            0 => Ok(RaidLevel::Raid0),
            1 => Ok(RaidLevel::Raid1),
            95 => Ok(RaidLevel::Raid5f),
            99 => Ok(RaidLevel::Concat),
            other => Err(RaidError::InvalidParameter(format!(
                "unknown raid level encoding {other}"
            ))),
        }
    }
}

impl fmt::Display for RaidLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = LEVEL_NAMES
            .iter()
            .find(|(_, level)| level == self)
            .map(|(name, _)| *name)
            .unwrap_or("");
        f.write_str(name)
    }
}

impl FromStr for RaidLevel {
    type Err = RaidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LEVEL_NAMES
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(s))
            .map(|(_, level)| *level)
            .ok_or_else(|| RaidError::InvalidParameter(format!("unknown raid level '{s}'")))
    }
}

/// Lifecycle state of an array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaidState {
    /// Slots are still being discovered; no logical I/O is accepted.
    Configuring,
    /// Fully assembled and serving I/O.
    Online,
    /// Deconfigured; terminal for this array instance.
    Offline,
}

const STATE_NAMES: &[(&str, RaidState)] = &[
    ("online", RaidState::Online),
    ("configuring", RaidState::Configuring),
    ("offline", RaidState::Offline),
];

impl fmt::Display for RaidState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = STATE_NAMES
            .iter()
            .find(|(_, state)| state == self)
            .map(|(name, _)| *name)
            .unwrap_or("");
        f.write_str(name)
    }
}

impl FromStr for RaidState {
    type Err = RaidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        STATE_NAMES
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(s))
            .map(|(_, state)| *state)
            .ok_or_else(|| RaidError::InvalidParameter(format!("unknown raid state '{s}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parse_aliases() {
        assert_eq!("raid0".parse::<RaidLevel>().unwrap(), RaidLevel::Raid0);
        assert_eq!("0".parse::<RaidLevel>().unwrap(), RaidLevel::Raid0);
        assert_eq!("RAID1".parse::<RaidLevel>().unwrap(), RaidLevel::Raid1);
        assert_eq!("5f".parse::<RaidLevel>().unwrap(), RaidLevel::Raid5f);
        assert_eq!("concat".parse::<RaidLevel>().unwrap(), RaidLevel::Concat);
        assert!("raid6".parse::<RaidLevel>().is_err());
    }

    #[test]
    fn test_level_display_uses_canonical_name() {
        assert_eq!(RaidLevel::Raid0.to_string(), "raid0");
        assert_eq!(RaidLevel::Raid5f.to_string(), "raid5f");
    }

    #[test]
    fn test_state_roundtrip() {
        for state in [RaidState::Online, RaidState::Configuring, RaidState::Offline] {
            assert_eq!(state.to_string().parse::<RaidState>().unwrap(), state);
        }
    }
}
