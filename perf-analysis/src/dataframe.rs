//! Builds dataframes from the trace store, stitching across tile
//! boundaries.

use perf_core::cancel::CancellationToken;
use perf_core::errors::Result;
use perf_core::frame::{ColumnHeader, DataFrame};
use perf_core::params::structured_key;
use perf_core::query::Query;
use perf_core::tile::{offset_in_tile, tile_for_commit, CommitNumber};
use perf_storage::{CommitStore, TraceStore};

#[derive(Clone)]
pub struct DataFrameBuilder {
    store: TraceStore,
    commits: CommitStore,
}

impl DataFrameBuilder {
    pub fn new(store: TraceStore, commits: CommitStore) -> Self {
        Self { store, commits }
    }

    /// A dataframe covering `[center - radius, center + radius]` (clamped
    /// at commit 0), restricted by the query. Missing cells carry the
    /// sentinel.
    pub fn build_around(
        &self,
        query: &Query,
        center: CommitNumber,
        radius: i32,
        token: &CancellationToken,
    ) -> Result<DataFrame> {
        let begin = center.offset(-radius);
        let end = CommitNumber(center.0 + radius);
        self.build_range(query, begin, end, token)
    }

    /// A dataframe spanning the most recent `n` commits that carry data,
    /// for user-initiated dataframe builds. The window is dense, so
    /// commits without data appear as sentinel columns.
    pub fn build_last_n(
        &self,
        query: &Query,
        n: usize,
        token: &CancellationToken,
    ) -> Result<DataFrame> {
        let commits = self.store.recent_commits_with_data(n)?;
        let (Some(&end), Some(&begin)) = (commits.first(), commits.last()) else {
            return Ok(DataFrame::default());
        };
        self.build_range(query, begin, end, token)
    }

    /// A dataframe over an inclusive commit range.
    pub fn build_range(
        &self,
        query: &Query,
        begin: CommitNumber,
        end: CommitNumber,
        token: &CancellationToken,
    ) -> Result<DataFrame> {
        let tile_size = self.store.tile_size();
        let width = (end.0 - begin.0 + 1).max(0) as usize;
        let mut df = DataFrame::default();
        for c in begin.0..=end.0 {
            let timestamp = self
                .commits
                .details(CommitNumber(c))
                .map(|d| d.commit_time)
                .unwrap_or(0);
            df.header.push(ColumnHeader { offset: CommitNumber(c), timestamp });
        }

        let mut tile = tile_for_commit(begin, tile_size);
        let last_tile = tile_for_commit(end, tile_size);
        while tile <= last_tile {
            token.check()?;
            let traces = self.store.query_traces(tile, query)?;
            let overlap_begin = begin.0.max(tile.first_commit(tile_size).0);
            let overlap_end = end.0.min(tile.last_commit(tile_size).0);
            for (params, values) in traces {
                let key = structured_key(&params)?;
                df.paramset.add_params(&params);
                let row = df
                    .traceset
                    .entry(key)
                    .or_insert_with(|| perf_core::tile::new_trace(width));
                for c in overlap_begin..=overlap_end {
                    let v = values[offset_in_tile(CommitNumber(c), tile_size)];
                    row[(c - begin.0) as usize] = v;
                }
            }
            tile = tile.next();
        }
        Ok(df)
    }
}
