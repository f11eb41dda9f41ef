// Copyright 2021 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use {
    crate::tx_vector::{TxVecIdx, MAX_VALID_IDX, START_IDX},
    rand::{seq::SliceRandom, thread_rng},
};

pub const NUM_PROBE_SEQUENCES: usize = 8;
pub const SEQUENCE_LENGTH: usize = (MAX_VALID_IDX - START_IDX + 1) as usize;

pub type ProbeTable = Vec<Vec<TxVecIdx>>;

/// A fixed set of permutations of the whole valid tx vector index range. The table is built once
/// per rate selector and shared by all peers; each peer only carries a [`ProbeEntry`] cursor, so
/// peers walk the same tables out of lockstep.
pub struct ProbeSequence {
    probe_table: ProbeTable,
}

/// Per-peer cursor into a [`ProbeSequence`]. Walks one permutation to completion before moving
/// on to the next, wrapping around the table forever.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeEntry {
    sequence_idx: usize,
    probe_idx: usize,
}

impl ProbeSequence {
    pub fn random_new() -> Self {
        let mut rng = thread_rng();
        let mut probe_table = Vec::with_capacity(NUM_PROBE_SEQUENCES);
        for _ in 0..NUM_PROBE_SEQUENCES {
            let mut sequence: Vec<TxVecIdx> =
                (START_IDX..=MAX_VALID_IDX).filter_map(TxVecIdx::new).collect();
            sequence.shuffle(&mut rng);
            probe_table.push(sequence);
        }
        Self { probe_table }
    }

    /// In-order tables. Only useful where a deterministic walk is needed, i.e. tests.
    pub fn sequential() -> Self {
        let sequence: Vec<TxVecIdx> =
            (START_IDX..=MAX_VALID_IDX).filter_map(TxVecIdx::new).collect();
        Self { probe_table: vec![sequence; NUM_PROBE_SEQUENCES] }
    }

    /// Returns the tx vector at the cursor and advances it, together with whether this step
    /// finished a full pass over one permutation.
    pub fn next(&self, entry: &mut ProbeEntry) -> (TxVecIdx, bool) {
        let tx_vector_idx = self.probe_table[entry.sequence_idx][entry.probe_idx];
        entry.probe_idx = (entry.probe_idx + 1) % SEQUENCE_LENGTH;
        let cycle_complete = entry.probe_idx == 0;
        if cycle_complete {
            entry.sequence_idx = (entry.sequence_idx + 1) % NUM_PROBE_SEQUENCES;
        }
        (tx_vector_idx, cycle_complete)
    }
}
