//! Snapshot identity and naming.

use crate::error::{Result, SnapshotError};
use flowmill_core::Position;
use std::fmt;

/// Width that fits the decimal rendering of any 64-bit field.
const FIELD_WIDTH: usize = 19;

/// The identity of a snapshot.
///
/// Field order matters: the derived ordering compares
/// `(processed_position, exported_position, index, term, ordinal)`
/// lexicographically, and [`SnapshotMetadata::file_name`] zero-pads every
/// field so that directory-name sort order equals this ordering. "Latest
/// snapshot" is therefore simply "largest name".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotMetadata {
    /// Lowest position the state machine has consumed and whose effects are
    /// in the database.
    pub processed_position: Position,
    /// Lowest position the exporter pipeline has externalized.
    pub exported_position: Position,
    /// Index of the raft log entry the snapshot is anchored at.
    pub index: u64,
    /// Term of that entry.
    pub term: u64,
    /// Monotonically increasing tie-breaker so that repeated snapshots at
    /// unchanged positions still produce distinct, increasing names.
    pub ordinal: u64,
}

impl SnapshotMetadata {
    pub fn new(
        processed_position: Position,
        exported_position: Position,
        index: u64,
        term: u64,
        ordinal: u64,
    ) -> Self {
        Self {
            processed_position,
            exported_position,
            index,
            term,
            ordinal,
        }
    }

    /// The lowest log position that must be retained; the log may be
    /// truncated below it.
    pub fn compaction_bound(&self) -> Position {
        self.processed_position.min(self.exported_position)
    }

    /// The tuple compared when deciding whether a new snapshot can still
    /// become the latest one; the ordinal only breaks ties.
    pub fn position_tuple(&self) -> (Position, Position, u64, u64) {
        (
            self.processed_position,
            self.exported_position,
            self.index,
            self.term,
        )
    }

    /// Directory name: `P-E-I-T-N`, every field zero-padded to 19 digits.
    pub fn file_name(&self) -> String {
        format!(
            "{:0w$}-{:0w$}-{:0w$}-{:0w$}-{:0w$}",
            self.processed_position,
            self.exported_position,
            self.index,
            self.term,
            self.ordinal,
            w = FIELD_WIDTH
        )
    }

    /// Parse a directory name produced by [`SnapshotMetadata::file_name`].
    pub fn parse(name: &str) -> Result<Self> {
        let fields: Vec<&str> = name.split('-').collect();
        if fields.len() != 5 {
            return Err(SnapshotError::InvalidName(name.to_string()));
        }
        let parse_u64 = |field: &str| {
            field
                .parse::<u64>()
                .map_err(|_| SnapshotError::InvalidName(name.to_string()))
        };
        let parse_position = |field: &str| {
            field
                .parse::<Position>()
                .map_err(|_| SnapshotError::InvalidName(name.to_string()))
        };
        Ok(Self {
            processed_position: parse_position(fields[0])?,
            exported_position: parse_position(fields[1])?,
            index: parse_u64(fields[2])?,
            term: parse_u64(fields[3])?,
            ordinal: parse_u64(fields[4])?,
        })
    }
}

impl fmt::Display for SnapshotMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}
