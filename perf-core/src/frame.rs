//! Dataframes: a rectangular window of traces over a commit range.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::paramset::ParamSet;
use crate::tile::CommitNumber;

/// One commit column of a dataframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnHeader {
    pub offset: CommitNumber,
    pub timestamp: i64,
}

/// A set of traces over a shared commit window. Keys are canonical
/// structured keys; every value vector has `header.len()` columns, with
/// the missing-data sentinel where a commit carries no sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataFrame {
    pub traceset: BTreeMap<String, Vec<f32>>,
    pub header: Vec<ColumnHeader>,
    pub paramset: ParamSet,
}

impl DataFrame {
    pub fn num_traces(&self) -> usize {
        self.traceset.len()
    }

    pub fn num_columns(&self) -> usize {
        self.header.len()
    }

    /// The column index of the given commit, if it is inside the window.
    pub fn column_of(&self, commit: CommitNumber) -> Option<usize> {
        self.header.iter().position(|h| h.offset == commit)
    }
}
