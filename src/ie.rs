// Copyright 2021 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The fragments of association information elements that rate selection consumes.

/// A rate from the Supported Rates or Extended Supported Rates element, IEEE 802.11-2016
/// 9.4.2.3. The value is in units of 0.5 Mbps; the MSB marks the rate as part of the
/// BSSBasicRateSet (mandatory for all members of the BSS).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SupportedRate(pub u8);

impl SupportedRate {
    pub fn rate(&self) -> u8 {
        self.0 & 0x7f
    }

    pub fn basic(&self) -> bool {
        (self.0 & 0x80) != 0
    }
}

/// The subset of the HT Capabilities element (IEEE 802.11-2016 9.4.2.56) that matters for rate
/// selection: which MCS the peer can receive, and the bandwidth/guard-interval combinations it
/// supports them with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtCapabilities {
    /// Rx MCS bitmask; bit `i` set means MCS `i` is supported. Covers MCS 0-63, of which this
    /// crate uses 0-31.
    pub rx_mcs_bitmask: u64,
    /// 40 MHz channel width supported.
    pub chan_width_40: bool,
    /// Short (400 ns) guard interval supported at 20 MHz.
    pub sgi_20: bool,
    /// Short (400 ns) guard interval supported at 40 MHz.
    pub sgi_40: bool,
}

impl HtCapabilities {
    pub fn supports_mcs(&self, mcs_idx: u8) -> bool {
        mcs_idx < 64 && self.rx_mcs_bitmask & (1 << mcs_idx) != 0
    }
}
