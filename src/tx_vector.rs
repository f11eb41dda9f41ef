// Copyright 2021 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use {
    crate::{device::WLAN_TX_VECTOR_IDX_INVALID, ie::SupportedRate},
    anyhow::{bail, Error},
};

pub const HT_NUM_MCS: u8 = 32; // Only support MCS 0-31
pub const HT_NUM_UNIQUE_MCS: u8 = 8;
pub const ERP_NUM_TX_VECTOR: u8 = 8;

const HT_NUM_GI: u8 = 2;
const HT_NUM_CBW: u8 = 2;
const HT_NUM_TX_VECTOR: u8 = HT_NUM_GI * HT_NUM_CBW * HT_NUM_MCS;

const DSSS_CCK_NUM_TX_VECTOR: u8 = 4;

pub const START_IDX: u16 = 1 + WLAN_TX_VECTOR_IDX_INVALID;
pub const HT_START_IDX: u16 = START_IDX;
pub const ERP_START_IDX: u16 = HT_START_IDX + HT_NUM_TX_VECTOR as u16;
pub const DSSS_CCK_START_IDX: u16 = ERP_START_IDX + ERP_NUM_TX_VECTOR as u16;
pub const MAX_VALID_IDX: u16 = DSSS_CCK_START_IDX + DSSS_CCK_NUM_TX_VECTOR as u16 - 1;

// Notes about HT:
// Changing CBW (channel bandwidth) from 20 MHz to 40 MHz advances index by 32
// Changing GI (guard interval) from 800 ns to 400 ns advances index by 64
//
//  Group   tx_vec_idx_t range    PHY   GI   CBW NSS MCS_IDX
//  0         1 -  32             HT    800  20  -   0-31
//  1        33 -  64             HT    800  40  -   0-31
//  2        65 -  96             HT    400  20  -   0-31
//  3        97 - 128             HT    400  40  -   0-31
//  4       129 - 136             ERP   -    -   -   0-7
//  5       137 - 138             DSSS  -    -   -   0-1
//  6       139 - 140             CCK   -    -   -   2-3

/// PHY class of one tx vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhyType {
    Dsss,
    Cck,
    Erp,
    Ht,
}

/// Guard interval between OFDM symbols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuardInterval {
    /// 800 ns
    Long,
    /// 400 ns
    Short,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelBandwidth {
    Cbw20,
    Cbw40,
}

#[derive(PartialEq, Debug)]
/// Encapsulates parameters for transmitting a packet over a PHY.
///
/// MCS index is defined in
/// * HT: IEEE 802.11-2016 Table 19-27
///
/// We extend the definition of MCS index beyond IEEE 802.11-2016 as follows:
/// * For ERP/ERP-OFDM (PhyType::Erp):
///     * 0: BPSK,   1/2 -> Data rate  6 Mbps
///     * 1: BPSK,   3/4 -> Data rate  9 Mbps
///     * 2: QPSK,   1/2 -> Data rate 12 Mbps
///     * 3: QPSK,   3/4 -> Data rate 18 Mbps
///     * 4: 16-QAM, 1/2 -> Data rate 24 Mbps
///     * 5: 16-QAM, 3/4 -> Data rate 36 Mbps
///     * 6: 64-QAM, 2/3 -> Data rate 48 Mbps
///     * 7: 64-QAM, 3/4 -> Data rate 54 Mbps
/// * For DSSS, HR/DSSS, and ERP-DSSS/CCK (PhyType::Dsss and PhyType::Cck):
///     * 0:  2 -> 1   Mbps DSSS
///     * 1:  4 -> 2   Mbps DSSS
///     * 2: 11 -> 5.5 Mbps CCK
///     * 3: 22 -> 11  Mbps CCK
pub struct TxVector {
    phy: PhyType,
    gi: GuardInterval,
    cbw: ChannelBandwidth,
    nss: u8, // Number of spatial streams, derived from the MCS index for HT.
    mcs_idx: u8,
}

impl TxVector {
    pub fn new(
        phy: PhyType,
        gi: GuardInterval,
        cbw: ChannelBandwidth,
        mcs_idx: u8,
    ) -> Result<Self, Error> {
        let supported_mcs = match phy {
            PhyType::Dsss => mcs_idx == 0 || mcs_idx == 1,
            PhyType::Cck => mcs_idx == 2 || mcs_idx == 3,
            PhyType::Ht => mcs_idx < HT_NUM_MCS,
            PhyType::Erp => mcs_idx < ERP_NUM_TX_VECTOR,
        };
        if supported_mcs {
            let nss = match phy {
                PhyType::Ht => 1 + mcs_idx / HT_NUM_UNIQUE_MCS,
                _ => 1,
            };
            Ok(Self { phy, gi, cbw, nss, mcs_idx })
        } else {
            bail!("Unsupported MCS {:?} for phy type {:?}", mcs_idx, phy);
        }
    }

    pub fn phy(&self) -> PhyType {
        self.phy
    }

    pub fn gi(&self) -> GuardInterval {
        self.gi
    }

    pub fn cbw(&self) -> ChannelBandwidth {
        self.cbw
    }

    pub fn nss(&self) -> u8 {
        self.nss
    }

    pub fn mcs_idx(&self) -> u8 {
        self.mcs_idx
    }

    pub fn from_supported_rate(erp_rate: &SupportedRate) -> Result<Self, Error> {
        let (phy, mcs_idx) = match erp_rate.rate() {
            2 => (PhyType::Dsss, 0),
            4 => (PhyType::Dsss, 1),
            11 => (PhyType::Cck, 2),
            22 => (PhyType::Cck, 3),
            12 => (PhyType::Erp, 0),
            18 => (PhyType::Erp, 1),
            24 => (PhyType::Erp, 2),
            36 => (PhyType::Erp, 3),
            48 => (PhyType::Erp, 4),
            72 => (PhyType::Erp, 5),
            96 => (PhyType::Erp, 6),
            108 => (PhyType::Erp, 7),
            other_rate => {
                bail!("Invalid rate {} * 0.5 Mbps for 802.11a/b/g.", other_rate);
            }
        };
        Self::new(phy, GuardInterval::Long, ChannelBandwidth::Cbw20, mcs_idx)
    }

    // We guarantee safety of the unwraps in the following two functions by testing all TxVecIdx
    // values exhaustively.

    pub fn from_idx(idx: TxVecIdx) -> Self {
        let phy = idx.to_phy();
        match phy {
            PhyType::Ht => {
                let group_idx = (*idx - HT_START_IDX) / HT_NUM_MCS as u16;
                let gi = match (group_idx / HT_NUM_CBW as u16) % HT_NUM_GI as u16 {
                    1 => GuardInterval::Short,
                    _ => GuardInterval::Long,
                };
                let cbw = match group_idx % HT_NUM_CBW as u16 {
                    0 => ChannelBandwidth::Cbw20,
                    _ => ChannelBandwidth::Cbw40,
                };
                let mcs_idx = ((*idx - HT_START_IDX) % HT_NUM_MCS as u16) as u8;
                Self::new(phy, gi, cbw, mcs_idx).unwrap()
            }
            PhyType::Erp => Self::new(
                phy,
                GuardInterval::Long,
                ChannelBandwidth::Cbw20,
                (*idx - ERP_START_IDX) as u8,
            )
            .unwrap(),
            PhyType::Dsss | PhyType::Cck => Self::new(
                phy,
                GuardInterval::Long,
                ChannelBandwidth::Cbw20,
                (*idx - DSSS_CCK_START_IDX) as u8,
            )
            .unwrap(),
        }
    }

    pub fn to_idx(&self) -> TxVecIdx {
        match self.phy {
            PhyType::Ht => {
                let group_idx = match self.gi {
                    GuardInterval::Short => HT_NUM_CBW as u16,
                    GuardInterval::Long => 0,
                } + match self.cbw {
                    ChannelBandwidth::Cbw40 => 1,
                    ChannelBandwidth::Cbw20 => 0,
                };
                TxVecIdx::new(HT_START_IDX + group_idx * HT_NUM_MCS as u16 + self.mcs_idx as u16)
                    .unwrap()
            }
            PhyType::Erp => TxVecIdx::new(ERP_START_IDX + self.mcs_idx as u16).unwrap(),
            PhyType::Cck | PhyType::Dsss => {
                TxVecIdx::new(DSSS_CCK_START_IDX + self.mcs_idx as u16).unwrap()
            }
        }
    }
}

#[derive(Hash, PartialEq, Eq, Debug, Copy, Clone, Ord, PartialOrd)]
pub struct TxVecIdx(u16);
impl std::ops::Deref for TxVecIdx {
    type Target = u16;
    fn deref(&self) -> &u16 {
        &self.0
    }
}

impl TxVecIdx {
    pub fn new(value: u16) -> Option<Self> {
        if WLAN_TX_VECTOR_IDX_INVALID < value && value <= MAX_VALID_IDX {
            Some(Self(value))
        } else {
            None
        }
    }

    pub fn to_erp_rate(&self) -> Option<SupportedRate> {
        if self.is_erp() {
            self.to_supported_rate()
        } else {
            None
        }
    }

    /// Reverse-maps any legacy (non-HT) index to its rate value, in 0.5 Mbps units.
    pub fn to_supported_rate(&self) -> Option<SupportedRate> {
        const LEGACY_RATE_LIST: [u8; (ERP_NUM_TX_VECTOR + DSSS_CCK_NUM_TX_VECTOR) as usize] =
            [12, 18, 24, 36, 48, 72, 96, 108, 2, 4, 11, 22];
        if self.is_ht() {
            None
        } else {
            Some(SupportedRate(LEGACY_RATE_LIST[(self.0 - ERP_START_IDX) as usize]))
        }
    }

    pub fn to_phy(&self) -> PhyType {
        match self.0 {
            idx if idx < HT_START_IDX + HT_NUM_TX_VECTOR as u16 => PhyType::Ht,
            idx if idx < ERP_START_IDX + ERP_NUM_TX_VECTOR as u16 => PhyType::Erp,
            idx if idx < DSSS_CCK_START_IDX + 2 => PhyType::Dsss,
            idx if idx < DSSS_CCK_START_IDX + DSSS_CCK_NUM_TX_VECTOR as u16 => PhyType::Cck,
            // This panic is unreachable for any TxVecIdx constructed with TxVecIdx::new.
            // Verified by exhaustive test cases.
            _ => panic!("TxVecIdx has invalid value"),
        }
    }

    pub fn is_ht(&self) -> bool {
        HT_START_IDX <= self.0 && self.0 < HT_START_IDX + HT_NUM_TX_VECTOR as u16
    }

    pub fn is_erp(&self) -> bool {
        ERP_START_IDX <= self.0 && self.0 < ERP_START_IDX + ERP_NUM_TX_VECTOR as u16
    }
}

impl std::fmt::Display for TxVecIdx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tx_vector = TxVector::from_idx(*self);
        write!(f, "TxVecIdx {:3}: {:?}", self.0, tx_vector)
    }
}
