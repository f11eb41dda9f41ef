// Copyright 2021 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Minstrel adaptive rate selection for 802.11 SoftMAC transmitters.
//!
//! For every associated peer the [`minstrel::MinstrelRateSelector`] tracks the measured success
//! probability and theoretical throughput of each usable tx vector (PHY, channel bandwidth,
//! guard interval, and MCS or legacy rate), answers "which tx vector should the next frame use",
//! and periodically transmits probe frames at non-optimal rates so the statistics keep following
//! the channel. Accumulated tx status reports are folded into exponentially weighted moving
//! averages on a fixed cadence driven by a [`minstrel::TimerManager`] supplied by the driver.
//!
//! The driver glue (frame parsing, hardware bindings, the event loop that serializes calls into
//! the selector) lives outside this crate; [`device`] holds the plain data types crossing that
//! boundary.

pub mod device;
pub mod error;
pub mod ie;
pub mod minstrel;
pub mod probe_sequence;
pub mod tx_vector;

use {
    minstrel::{MinstrelRateSelector, TimerManager},
    parking_lot::Mutex,
    std::{sync::Arc, time::Duration},
};

/// 48-bit IEEE MAC address.
pub type MacAddr = [u8; 6];

/// How often accumulated tx status reports are folded into the moving averages.
pub const MINSTREL_UPDATE_INTERVAL: Duration = Duration::from_millis(100);

/// Handle shared between the tx path, the status-report path, and timer dispatch. Every entry
/// point of [`MinstrelRateSelector`] takes `&mut self`; callers serialize through this lock.
pub type MinstrelWrapper<T> = Arc<Mutex<MinstrelRateSelector<T>>>;

/// Creates a rate selector with freshly shuffled probe tables, wrapped for sharing across the
/// driver's execution contexts.
pub fn create_minstrel<T: TimerManager>(
    timer_manager: T,
    update_interval: Duration,
) -> MinstrelWrapper<T> {
    Arc::new(Mutex::new(MinstrelRateSelector::new(
        timer_manager,
        update_interval,
        probe_sequence::ProbeSequence::random_new(),
    )))
}
