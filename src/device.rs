// Copyright 2021 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Plain data types crossing the driver boundary. The vendor driver reports transmission
//! outcomes as [`WlanTxStatus`] ladders and hands rate selection the association parameters it
//! needs as an [`AssocContext`]; the hardware-facing encode/decode of these structures is the
//! driver's concern.

use crate::{
    ie::{HtCapabilities, SupportedRate},
    MacAddr,
};

/// Sentinel tx vector index. Terminates the retry ladder of a [`WlanTxStatus`] and never
/// identifies a real tx vector.
pub const WLAN_TX_VECTOR_IDX_INVALID: u16 = 0;

/// Maximum number of rungs in one report's retry ladder.
pub const WLAN_TX_STATUS_MAX_ENTRY: usize = 8;

/// One rung of a retry ladder: a tx vector and how many times it was attempted before the
/// hardware moved on to the next rung.
#[derive(Debug, Clone, Copy, Default)]
pub struct WlanTxStatusEntry {
    /// Raw tx vector index; `WLAN_TX_VECTOR_IDX_INVALID` marks the end of the ladder.
    pub tx_vector_idx: u16,
    pub attempts: u8,
}

/// Outcome of one frame transmission, reported by the vendor driver on completion.
#[derive(Debug, Clone)]
pub struct WlanTxStatus {
    pub peer_addr: MacAddr,
    /// Rungs in attempt order, terminated early by an invalid-index entry.
    pub tx_status_entry: [WlanTxStatusEntry; WLAN_TX_STATUS_MAX_ENTRY],
    /// Whether the final attempted rung succeeded.
    pub success: bool,
}

/// Per-frame transmission flags passed down from the frame writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxFlags(pub u32);

impl TxFlags {
    pub const NONE: Self = Self(0);
    /// The caller favors delivery over throughput, e.g. for a retransmission.
    pub const FAVOR_RELIABILITY: Self = Self(1 << 1);

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// The slice of a peer's association context that rate selection consumes.
#[derive(Debug, Clone)]
pub struct AssocContext {
    pub addr: MacAddr,
    /// Rates from the (Extended) Supported Rates elements, basic bits included.
    pub rates: Vec<SupportedRate>,
    pub ht_cap: Option<HtCapabilities>,
}
