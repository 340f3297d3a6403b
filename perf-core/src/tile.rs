//! Commit numbers, tiles, and the missing-data sentinel.
//!
//! Commit numbers are dense non-negative integers in first-parent
//! topological order. A tile is a fixed-width slab of contiguous commit
//! numbers; tile `n` covers `[n*T, n*T + T - 1]` inclusive.

use serde::{Deserialize, Serialize};

/// A dense commit number. `-1` means "no such commit".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct CommitNumber(pub i32);

impl CommitNumber {
    pub const BAD: CommitNumber = CommitNumber(-1);

    pub fn is_bad(self) -> bool {
        self.0 < 0
    }

    /// The commit `n` positions away, saturating at zero.
    pub fn offset(self, n: i32) -> CommitNumber {
        CommitNumber((self.0 + n).max(0))
    }
}

/// A tile number. `-1` means "no such tile".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct TileNumber(pub i32);

impl TileNumber {
    pub const BAD: TileNumber = TileNumber(-1);

    /// First commit number covered by this tile.
    pub fn first_commit(self, tile_size: i32) -> CommitNumber {
        CommitNumber(self.0 * tile_size)
    }

    /// Last commit number covered by this tile (inclusive).
    pub fn last_commit(self, tile_size: i32) -> CommitNumber {
        CommitNumber(self.0 * tile_size + tile_size - 1)
    }

    pub fn next(self) -> TileNumber {
        TileNumber(self.0 + 1)
    }
}

/// The tile containing the given commit.
pub fn tile_for_commit(commit: CommitNumber, tile_size: i32) -> TileNumber {
    TileNumber(commit.0 / tile_size)
}

/// The commit's column offset within its tile.
pub fn offset_in_tile(commit: CommitNumber, tile_size: i32) -> usize {
    (commit.0 % tile_size) as usize
}

/// Sentinel stored in unfilled trace cells.
pub const MISSING_DATA_SENTINEL: f32 = 1e32;

/// A fresh dense trace of the given length, all cells missing.
pub fn new_trace(len: usize) -> Vec<f32> {
    vec![MISSING_DATA_SENTINEL; len]
}

pub fn is_missing(x: f32) -> bool {
    x == MISSING_DATA_SENTINEL
}

/// Metadata for a single commit, as returned by the commit index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitDetail {
    pub commit_number: CommitNumber,
    pub git_hash: String,
    pub commit_time: i64,
    pub author: String,
    pub subject: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_boundaries() {
        // nT and nT + T - 1 land in tile n; nT + T lands in tile n + 1.
        assert_eq!(tile_for_commit(CommitNumber(0), 256), TileNumber(0));
        assert_eq!(tile_for_commit(CommitNumber(255), 256), TileNumber(0));
        assert_eq!(tile_for_commit(CommitNumber(256), 256), TileNumber(1));
        assert_eq!(tile_for_commit(CommitNumber(300), 256), TileNumber(1));
    }

    #[test]
    fn tile_commit_ranges() {
        assert_eq!(TileNumber(1).first_commit(256), CommitNumber(256));
        assert_eq!(TileNumber(1).last_commit(256), CommitNumber(511));
        assert_eq!(offset_in_tile(CommitNumber(300), 256), 44);
    }

    #[test]
    fn new_trace_is_all_missing() {
        let t = new_trace(4);
        assert_eq!(t.len(), 4);
        assert!(t.iter().all(|&v| is_missing(v)));
        assert!(!is_missing(1.25));
    }
}
