use std::fmt;
use std::str::FromStr;

use postgres::types::{format_lsn, parse_lsn_u64};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

const INVENTORY_PREFIX: &str = "inventory:";

/// Progress marker of a record within the stream that produced it.
///
/// Positions of one producer strictly increase in emission order. Positions of different
/// kinds are never compared with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Position {
    /// Log sequence number of a replication stream message.
    Wal(u64),
    /// Row sequence number of a bulk copy.
    Inventory(u64),
}

impl Position {
    pub fn as_wal(&self) -> Option<u64> {
        match self {
            Position::Wal(lsn) => Some(*lsn),
            Position::Inventory(_) => None,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::Wal(lsn) => f.write_str(&format_lsn(*lsn)),
            Position::Inventory(sequence) => write!(f, "{INVENTORY_PREFIX}{sequence}"),
        }
    }
}

impl FromStr for Position {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix(INVENTORY_PREFIX) {
            Some(sequence) => Ok(Position::Inventory(sequence.parse()?)),
            None => Ok(Position::Wal(parse_lsn_u64(s)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wal_positions_use_lsn_text_form() {
        let position: Position = "0/14EFDB8".parse().unwrap();

        assert_eq!(position, Position::Wal(0x14EFDB8));
        assert_eq!(position.to_string(), "0/14EFDB8");
    }

    #[test]
    fn inventory_positions_round_trip_through_text() {
        let position: Position = "inventory:42".parse().unwrap();

        assert_eq!(position, Position::Inventory(42));
        assert_eq!(position.to_string(), "inventory:42");
    }

    #[test]
    fn positions_serialize_with_their_kind() {
        let json = serde_json::to_string(&Position::Wal(16)).unwrap();
        assert_eq!(json, r#"{"kind":"wal","value":16}"#);
        assert_eq!(serde_json::from_str::<Position>(&json).unwrap(), Position::Wal(16));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!("inventory:x".parse::<Position>().is_err());
        assert!("zz".parse::<Position>().is_err());
    }
}
