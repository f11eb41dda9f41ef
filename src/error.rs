// Copyright 2021 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use {crate::MacAddr, thiserror::Error};

#[derive(Debug, Error)]
pub enum Error {
    /// The association context yielded no usable tx vector. Such a peer could never receive a
    /// frame; the caller must tear it down.
    #[error("no usable tx vector for peer {0:02x?}")]
    NoUsableRates(MacAddr),
    /// HT support was advertised with an empty Rx MCS set.
    #[error("empty MCS set in HT capabilities of peer {0:02x?}")]
    EmptyMcsSet(MacAddr),
    /// Statistics were requested for a peer that is not tracked. Distinguishes "no data" from
    /// "zeroed data" for introspection tooling.
    #[error("peer {0:02x?} not found")]
    PeerNotFound(MacAddr),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
