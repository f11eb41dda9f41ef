// Copyright 2021 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Minstrel rate selection. One [`MinstrelRateSelector`] serves one interface: it keeps a
//! [`Peer`] entry per associated station, accumulates tx status reports into per-tx-vector
//! counters, folds them into moving averages on a timer cadence, and picks the tx vector for
//! every outgoing frame, periodically substituting a probe at a rate whose statistics have
//! gone stale.

use {
    crate::{
        device::{AssocContext, TxFlags, WlanTxStatus, WLAN_TX_VECTOR_IDX_INVALID},
        error::Error,
        ie::{HtCapabilities, SupportedRate},
        probe_sequence::{ProbeEntry, ProbeSequence, SEQUENCE_LENGTH},
        tx_vector::{
            ChannelBandwidth, GuardInterval, PhyType, TxVecIdx, TxVector, ERP_START_IDX,
            HT_NUM_MCS, HT_NUM_UNIQUE_MCS,
        },
        MacAddr,
    },
    log::{debug, warn},
    std::{
        collections::{HashMap, HashSet},
        time::{Duration, Instant},
    },
};

/// Reference frame length used for all theoretical tx time computations, in bytes.
const MINSTREL_FRAME_LENGTH: u64 = 1400;
/// Weight of the previous average when folding in a new success-rate measurement.
const MINSTREL_EXP_WEIGHT: f32 = 0.75;
/// Rates at or above this success probability are considered reliable.
const MINSTREL_PROBABILITY_THRESHOLD: f32 = 0.9;
/// Every `PROBE_INTERVAL`th data frame is a probe.
const PROBE_INTERVAL: u8 = 16;
/// A rate slower than the current most reliable one is probed at most this many times per
/// update cycle.
const MAX_SLOW_PROBE: u64 = 2;
/// A rate that almost never succeeds is probed at most once every this many update cycles.
const DEAD_PROBE_CYCLE_COUNT: u8 = 32;

// HT PHY timing, IEEE 802.11-2016 19.3.2 and Table 19-27.
const SYMBOL_TIME_LONG_GI_NANOS: u64 = 4000;
const SYMBOL_TIME_SHORT_GI_NANOS: u64 = 3600;
/// Trailing guard period when the short GI is in use.
const SHORT_GI_PADDING_NANOS: u64 = 400;
const NUM_SUBCARRIERS_CBW20: u64 = 52;
const NUM_SUBCARRIERS_CBW40: u64 = 108;
/// Data bits per OFDM symbol at 20 MHz with one spatial stream, indexed by MCS modulo 8.
/// BPSK 1/2 through 64-QAM 5/6 per Table 19-27; the last two entries extend the table to
/// 256-QAM 3/4 and 5/6.
const HT_BITS_PER_SYMBOL: [u64; 10] = [26, 52, 78, 104, 156, 208, 234, 260, 312, 347];

/// Timer facility provided by the driver. Minstrel keeps at most one outstanding deadline;
/// `schedule` replaces any previous registration.
pub trait TimerManager {
    /// Schedule a timeout notification `from_now` in the future.
    fn schedule(&mut self, from_now: Duration);
    /// Cancel the outstanding deadline, if any. A notification that still arrives afterwards
    /// must be tolerated by the caller of [`MinstrelRateSelector::handle_timeout`].
    fn cancel(&mut self);
    /// Current reading of the monotonic clock.
    fn now(&self) -> Instant;
}

/// Theoretical time to transmit `MINSTREL_FRAME_LENGTH` bytes with the given tx vector,
/// assuming no retries, no contention, and (for legacy rates) no PHY header overhead.
/// Strictly positive for every valid index.
fn perfect_tx_time(tx_vector_idx: TxVecIdx) -> Duration {
    match tx_vector_idx.to_supported_rate() {
        Some(rate) => legacy_tx_time(rate),
        None => ht_tx_time(&TxVector::from_idx(tx_vector_idx)),
    }
}

fn legacy_tx_time(rate: SupportedRate) -> Duration {
    // The rate unit is 0.5 Mbps, so bits * 2000 / rate is nanoseconds.
    Duration::from_nanos(MINSTREL_FRAME_LENGTH * 8 * 2000 / rate.rate() as u64)
}

fn ht_tx_time(tx_vector: &TxVector) -> Duration {
    let mut bits_per_symbol = HT_BITS_PER_SYMBOL
        [(tx_vector.mcs_idx() % HT_NUM_UNIQUE_MCS) as usize]
        * tx_vector.nss() as u64;
    if tx_vector.cbw() == ChannelBandwidth::Cbw40 {
        // Multiply before dividing to avoid precision loss.
        bits_per_symbol = bits_per_symbol * NUM_SUBCARRIERS_CBW40 / NUM_SUBCARRIERS_CBW20;
    }
    let frame_bits = MINSTREL_FRAME_LENGTH * 8;
    let nanos = match tx_vector.gi() {
        GuardInterval::Long => frame_bits * SYMBOL_TIME_LONG_GI_NANOS / bits_per_symbol,
        GuardInterval::Short => {
            frame_bits * SYMBOL_TIME_SHORT_GI_NANOS / bits_per_symbol + SHORT_GI_PADDING_NANOS
        }
    };
    Duration::from_nanos(nanos)
}

/// Rolling and lifetime statistics for one tx vector of one peer.
#[derive(Debug, Clone, PartialEq)]
pub struct TxStats {
    pub tx_vector_idx: TxVecIdx,
    /// Fixed at creation; see [`perfect_tx_time`].
    pub perfect_tx_time: Duration,
    /// Successes since the last update cycle.
    pub success_cur: u64,
    /// Attempts since the last update cycle.
    pub attempts_cur: u64,
    /// Exponentially weighted moving average of the per-cycle success rate, in [0, 1].
    pub probability: f32,
    /// Expected successful frames per second, `probability / perfect_tx_time`.
    pub cur_tp: f32,
    pub success_total: u64,
    pub attempts_total: u64,
    /// Times this vector was selected as a probe.
    pub probes_total: u64,
    /// Consecutive update cycles without a single attempt.
    pub probe_cycles_skipped: u8,
}

impl TxStats {
    fn new(tx_vector_idx: TxVecIdx) -> Self {
        let perfect_tx_time = perfect_tx_time(tx_vector_idx);
        assert!(
            perfect_tx_time > Duration::from_nanos(0),
            "zero perfect tx time for {}",
            tx_vector_idx
        );
        Self {
            tx_vector_idx,
            perfect_tx_time,
            success_cur: 0,
            attempts_cur: 0,
            probability: 0.0,
            cur_tp: 0.0,
            success_total: 0,
            attempts_total: 0,
            probes_total: 0,
            probe_cycles_skipped: 0,
        }
    }

    /// Folds the counters accumulated since the last cycle into the moving averages.
    fn update(&mut self) {
        if self.attempts_cur > 0 {
            let probability = self.success_cur as f32 / self.attempts_cur as f32;
            self.probability = if self.attempts_total == 0 {
                probability
            } else {
                self.probability * MINSTREL_EXP_WEIGHT
                    + probability * (1.0 - MINSTREL_EXP_WEIGHT)
            };
            // On overflow the lifetime totals restart from this cycle's counts. Wrapping
            // would corrupt the ratio between them.
            match self.attempts_total.checked_add(self.attempts_cur) {
                Some(attempts_total) => {
                    self.attempts_total = attempts_total;
                    self.success_total += self.success_cur;
                }
                None => {
                    self.attempts_total = self.attempts_cur;
                    self.success_total = self.success_cur;
                }
            }
            self.attempts_cur = 0;
            self.success_cur = 0;
            self.probe_cycles_skipped = 0;
        } else {
            self.probe_cycles_skipped = self.probe_cycles_skipped.saturating_add(1);
        }
        self.cur_tp = self.probability * (1e9 / self.perfect_tx_time.as_nanos() as f32);
    }

    /// Whether this vector's measured success rate is so low the rate is considered dead.
    fn unlikely_to_succeed(&self) -> bool {
        self.probability < 1.0 - MINSTREL_PROBABILITY_THRESHOLD
    }

    /// HT is preferred over legacy whenever the HT side has any realistic chance of success;
    /// mixing PHY types costs more airtime than a nominally faster legacy rate recovers.
    /// Evaluated for both operands so the outcome does not depend on comparison order.
    fn phy_preference(&self, other: &Self) -> Option<bool> {
        if self.tx_vector_idx.is_ht() == other.tx_vector_idx.is_ht() {
            None
        } else if self.tx_vector_idx.is_ht() && !self.unlikely_to_succeed() {
            Some(true)
        } else if other.tx_vector_idx.is_ht() && !other.unlikely_to_succeed() {
            Some(false)
        } else {
            None
        }
    }

    /// Whether this vector beats `other` on expected throughput.
    fn is_better_tp(&self, other: &Self) -> bool {
        match self.phy_preference(other) {
            Some(preferred) => preferred,
            None => {
                self.cur_tp > other.cur_tp
                    || (self.cur_tp == other.cur_tp && self.probability > other.probability)
            }
        }
    }

    /// Whether this vector beats `other` on success probability. Once both sides are reliable
    /// the faster one wins; reliability alone cannot tell near-certain rates apart.
    fn is_better_probability(&self, other: &Self) -> bool {
        match self.phy_preference(other) {
            Some(preferred) => preferred,
            None => {
                if self.probability >= MINSTREL_PROBABILITY_THRESHOLD
                    && other.probability >= MINSTREL_PROBABILITY_THRESHOLD
                {
                    self.cur_tp > other.cur_tp
                } else {
                    self.probability > other.probability
                        || (self.probability == other.probability && self.cur_tp > other.cur_tp)
                }
            }
        }
    }
}

/// Point-in-time copy of one peer's statistics, for introspection tooling.
#[derive(Debug, Clone)]
pub struct PeerStats {
    pub addr: MacAddr,
    pub is_ht: bool,
    pub max_tp: TxVecIdx,
    pub max_probability: TxVecIdx,
    pub basic_max_probability: TxVecIdx,
    pub basic_highest: TxVecIdx,
    pub probes: u64,
    /// One entry per tracked tx vector, ordered by index.
    pub entries: Vec<TxStats>,
}

struct Peer {
    addr: MacAddr,
    is_ht: bool,
    tx_stats_map: HashMap<TxVecIdx, TxStats>,
    /// Rates the peer marked as part of the BSSBasicRateSet.
    basic_rates: HashSet<TxVecIdx>,
    /// Highest basic rate; falls back to the lowest legacy rate (or lowest index) when the
    /// peer marked none.
    basic_highest: TxVecIdx,
    basic_max_probability: TxVecIdx,
    max_tp: TxVecIdx,
    max_probability: TxVecIdx,

    probe_entry: ProbeEntry,
    num_pkt_until_next_probe: u8,
    num_probe_cycles_done: u64,
    probes: u64,
}

impl Peer {
    fn from_assoc_ctx(assoc_ctx: &AssocContext) -> Result<Self, Error> {
        let mut tx_stats_map = HashMap::new();
        let mut basic_rates = HashSet::new();
        let is_ht = assoc_ctx.ht_cap.is_some();
        if let Some(ht_cap) = &assoc_ctx.ht_cap {
            if ht_cap.rx_mcs_bitmask == 0 {
                return Err(Error::EmptyMcsSet(assoc_ctx.addr));
            }
            add_supported_ht(&mut tx_stats_map, ht_cap)?;
        }
        add_supported_erp(&mut tx_stats_map, &mut basic_rates, &assoc_ctx.rates)?;
        if tx_stats_map.is_empty() {
            return Err(Error::NoUsableRates(assoc_ctx.addr));
        }

        // The map is non-empty so the minimum exists.
        let lowest = *tx_stats_map.keys().min().unwrap();
        let lowest_legacy = tx_stats_map.keys().filter(|idx| !idx.is_ht()).min().copied();
        let basic_fallback = lowest_legacy.unwrap_or(lowest);
        let basic_max_probability = basic_rates.iter().min().copied().unwrap_or(basic_fallback);
        let basic_highest = basic_rates.iter().max().copied().unwrap_or(basic_fallback);

        let mut peer = Self {
            addr: assoc_ctx.addr,
            is_ht,
            tx_stats_map,
            basic_rates,
            basic_highest,
            basic_max_probability,
            max_tp: lowest,
            max_probability: lowest,
            probe_entry: ProbeEntry::default(),
            num_pkt_until_next_probe: PROBE_INTERVAL - 1,
            num_probe_cycles_done: 0,
            probes: 0,
        };
        // Selection must be sane before the first status report arrives.
        peer.update_stats();
        Ok(peer)
    }

    fn handle_tx_status_report(&mut self, tx_status: &WlanTxStatus) {
        let mut last_idx = None;
        for entry in tx_status.tx_status_entry.iter() {
            if entry.tx_vector_idx == WLAN_TX_VECTOR_IDX_INVALID {
                break;
            }
            let idx = match TxVecIdx::new(entry.tx_vector_idx) {
                Some(idx) => idx,
                None => {
                    warn!(
                        "out of range tx vector index {} in status report from {:02x?}",
                        entry.tx_vector_idx, self.addr
                    );
                    continue;
                }
            };
            // The hardware may retry at a rate the peer never advertised; start tracking it.
            let stats = self.tx_stats_map.entry(idx).or_insert_with(|| TxStats::new(idx));
            stats.attempts_cur += entry.attempts as u64;
            last_idx = Some(idx);
        }
        if tx_status.success {
            if let Some(idx) = last_idx {
                if let Some(stats) = self.tx_stats_map.get_mut(&idx) {
                    stats.success_cur += 1;
                }
            }
        }
    }

    /// Folds every vector's cycle counters into its averages, then re-derives the three best
    /// pointers. Scans are seeded from the current pointers, so a cycle in which nothing
    /// changed leaves them in place.
    fn update_stats(&mut self) {
        for stats in self.tx_stats_map.values_mut() {
            stats.update();
        }
        let mut max_tp = self.max_tp;
        let mut max_probability = self.max_probability;
        let mut basic_max_probability = self.basic_max_probability;
        for (idx, stats) in &self.tx_stats_map {
            if stats.is_better_tp(&self.tx_stats_map[&max_tp]) {
                max_tp = *idx;
            }
            if stats.is_better_probability(&self.tx_stats_map[&max_probability]) {
                max_probability = *idx;
            }
            if self.basic_rates.contains(idx)
                && stats.is_better_probability(&self.tx_stats_map[&basic_max_probability])
            {
                basic_max_probability = *idx;
            }
        }
        self.max_tp = max_tp;
        self.max_probability = max_probability;
        self.basic_max_probability = basic_max_probability;
    }

    /// Tx vector for the next data frame: `max_tp`, except every `PROBE_INTERVAL`th frame,
    /// which probes a rate that needs fresh statistics.
    fn next_data_tx_vector(&mut self, probe_sequence: &ProbeSequence) -> TxVecIdx {
        if self.num_pkt_until_next_probe > 0 {
            self.num_pkt_until_next_probe -= 1;
            return self.max_tp;
        }
        self.num_pkt_until_next_probe = PROBE_INTERVAL - 1;
        self.next_probe(probe_sequence).unwrap_or(self.max_tp)
    }

    fn next_probe(&mut self, probe_sequence: &ProbeSequence) -> Option<TxVecIdx> {
        // One full pass bounds the search; if every candidate is skipped there is nothing
        // worth probing right now.
        for _ in 0..SEQUENCE_LENGTH {
            let (idx, cycle_complete) = probe_sequence.next(&mut self.probe_entry);
            if cycle_complete {
                self.num_probe_cycles_done += 1;
            }
            if self.is_probe_needed(idx) {
                self.probes += 1;
                if let Some(stats) = self.tx_stats_map.get_mut(&idx) {
                    stats.probes_total += 1;
                }
                return Some(idx);
            }
        }
        None
    }

    fn is_probe_needed(&self, idx: TxVecIdx) -> bool {
        let stats = match self.tx_stats_map.get(&idx) {
            Some(stats) => stats,
            // Not usable with this peer.
            None => return false,
        };
        // Regular traffic keeps the favored vectors fresh.
        if idx == self.basic_max_probability
            || idx == self.basic_highest
            || idx == self.max_tp
            || idx == self.max_probability
        {
            return false;
        }
        // Already sampled enough in the current probe cycle.
        if stats.probes_total > self.num_probe_cycles_done {
            return false;
        }
        // Slow rates get minimal probing.
        let best_probability_time = self.tx_stats_map[&self.max_probability].perfect_tx_time;
        if stats.perfect_tx_time > best_probability_time && stats.attempts_cur >= MAX_SLOW_PROBE {
            return false;
        }
        // Once a vector has measured as dead it is re-probed at most once every
        // DEAD_PROBE_CYCLE_COUNT cycles, and not while attempts are still in flight.
        // A vector with no measurements yet is unknown, not dead.
        if stats.attempts_total > 0
            && stats.unlikely_to_succeed()
            && (stats.probe_cycles_skipped < DEAD_PROBE_CYCLE_COUNT || stats.attempts_cur > 0)
        {
            return false;
        }
        true
    }

    fn stats(&self) -> PeerStats {
        let mut entries: Vec<TxStats> = self.tx_stats_map.values().cloned().collect();
        entries.sort_by_key(|stats| stats.tx_vector_idx);
        PeerStats {
            addr: self.addr,
            is_ht: self.is_ht,
            max_tp: self.max_tp,
            max_probability: self.max_probability,
            basic_max_probability: self.basic_max_probability,
            basic_highest: self.basic_highest,
            probes: self.probes,
            entries,
        }
    }
}

fn add_supported_ht(
    tx_stats_map: &mut HashMap<TxVecIdx, TxStats>,
    ht_cap: &HtCapabilities,
) -> Result<(), Error> {
    let mut cbw_gi_combinations = vec![(ChannelBandwidth::Cbw20, GuardInterval::Long)];
    if ht_cap.sgi_20 {
        cbw_gi_combinations.push((ChannelBandwidth::Cbw20, GuardInterval::Short));
    }
    if ht_cap.chan_width_40 {
        cbw_gi_combinations.push((ChannelBandwidth::Cbw40, GuardInterval::Long));
        if ht_cap.sgi_40 {
            cbw_gi_combinations.push((ChannelBandwidth::Cbw40, GuardInterval::Short));
        }
    }
    for mcs_idx in 0..HT_NUM_MCS {
        if !ht_cap.supports_mcs(mcs_idx) {
            continue;
        }
        for &(cbw, gi) in &cbw_gi_combinations {
            let idx = TxVector::new(PhyType::Ht, gi, cbw, mcs_idx)?.to_idx();
            tx_stats_map.insert(idx, TxStats::new(idx));
        }
    }
    Ok(())
}

fn add_supported_erp(
    tx_stats_map: &mut HashMap<TxVecIdx, TxStats>,
    basic_rates: &mut HashSet<TxVecIdx>,
    rates: &[SupportedRate],
) -> Result<(), Error> {
    for rate in rates {
        let idx = TxVector::from_supported_rate(rate)?.to_idx();
        tx_stats_map.insert(idx, TxStats::new(idx));
        if rate.basic() {
            basic_rates.insert(idx);
        }
    }
    Ok(())
}

pub struct MinstrelRateSelector<T: TimerManager> {
    timer_manager: T,
    update_interval: Duration,
    /// The deadline of the single outstanding timer registration, if any. `Some` exactly when
    /// at least one peer is tracked.
    next_update_deadline: Option<Instant>,
    peer_map: HashMap<MacAddr, Peer>,
    /// Peers with status reports accumulated since the last update cycle.
    outdated_peers: HashSet<MacAddr>,
    probe_sequence: ProbeSequence,
}

impl<T: TimerManager> MinstrelRateSelector<T> {
    pub fn new(timer_manager: T, update_interval: Duration, probe_sequence: ProbeSequence) -> Self {
        Self {
            timer_manager,
            update_interval,
            next_update_deadline: None,
            peer_map: HashMap::new(),
            outdated_peers: HashSet::new(),
            probe_sequence,
        }
    }

    /// Starts tracking a peer, building its tx vector table from the association context.
    /// Fails if the context yields no usable tx vector; such a peer must be torn down by the
    /// caller. The first tracked peer starts the periodic update timer.
    pub fn add_peer(&mut self, assoc_ctx: &AssocContext) -> Result<(), Error> {
        let peer = Peer::from_assoc_ctx(assoc_ctx)?;
        if self.peer_map.is_empty() {
            let now = self.timer_manager.now();
            self.timer_manager.schedule(self.update_interval);
            self.next_update_deadline = Some(now + self.update_interval);
        }
        if self.peer_map.insert(assoc_ctx.addr, peer).is_some() {
            warn!("replacing existing peer {:02x?}", assoc_ctx.addr);
        }
        Ok(())
    }

    /// Discards all state for a peer. Removing the last peer cancels the update timer.
    pub fn remove_peer(&mut self, addr: &MacAddr) {
        if self.peer_map.remove(addr).is_none() {
            debug!("cannot remove peer {:02x?}, not found", addr);
            return;
        }
        self.outdated_peers.remove(addr);
        if self.peer_map.is_empty() {
            self.timer_manager.cancel();
            self.next_update_deadline = None;
        }
    }

    /// Accumulates one frame's retry ladder into the peer's cycle counters. Cheap; runs on
    /// every tx completion.
    pub fn handle_tx_status_report(&mut self, tx_status: &WlanTxStatus) {
        match self.peer_map.get_mut(&tx_status.peer_addr) {
            Some(peer) => {
                peer.handle_tx_status_report(tx_status);
                self.outdated_peers.insert(tx_status.peer_addr);
            }
            // Expected when a report races with disassociation.
            None => debug!("tx status report for unknown peer {:02x?}", tx_status.peer_addr),
        }
    }

    /// Called on every timer notification. Returns whether an update cycle ran; stale
    /// notifications (after cancellation or for a superseded deadline) are no-ops.
    pub fn handle_timeout(&mut self) -> bool {
        let deadline = match self.next_update_deadline {
            Some(deadline) => deadline,
            None => return false,
        };
        if self.timer_manager.now() < deadline {
            return false;
        }
        self.update_stats();
        // The next deadline counts from completion, so a slow cycle cannot back up the
        // timer queue.
        let now = self.timer_manager.now();
        self.timer_manager.schedule(self.update_interval);
        self.next_update_deadline = Some(now + self.update_interval);
        true
    }

    fn update_stats(&mut self) {
        for addr in self.outdated_peers.drain() {
            if let Some(peer) = self.peer_map.get_mut(&addr) {
                peer.update_stats();
            }
        }
    }

    /// Picks the tx vector for one outgoing frame. Never fails: frames to unknown peers get
    /// the most conservative ERP rate so management traffic always goes out.
    pub fn get_tx_vector_idx(
        &mut self,
        frame_is_data: bool,
        peer_addr: &MacAddr,
        flags: TxFlags,
    ) -> TxVecIdx {
        match self.peer_map.get_mut(peer_addr) {
            // ERP_START_IDX is always valid; verified by exhaustive tests in tx_vector.
            None => TxVecIdx::new(ERP_START_IDX).unwrap(),
            Some(peer) => {
                if !frame_is_data {
                    peer.basic_max_probability
                } else if flags.contains(TxFlags::FAVOR_RELIABILITY) {
                    peer.max_probability
                } else {
                    peer.next_data_tx_vector(&self.probe_sequence)
                }
            }
        }
    }

    /// Addresses of all tracked peers.
    pub fn peer_list(&self) -> Vec<MacAddr> {
        let mut addrs: Vec<MacAddr> = self.peer_map.keys().copied().collect();
        addrs.sort_unstable();
        addrs
    }

    /// Snapshot of one peer's statistics. `PeerNotFound` distinguishes an untracked peer from
    /// one with zeroed statistics.
    pub fn get_stats(&self, addr: &MacAddr) -> Result<PeerStats, Error> {
        self.peer_map.get(addr).map(Peer::stats).ok_or(Error::PeerNotFound(*addr))
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::tx_vector::{DSSS_CCK_START_IDX, HT_START_IDX, MAX_VALID_IDX},
        std::{cell::RefCell, rc::Rc},
    };

    const TEST_ADDR: MacAddr = [0x0a, 0x1b, 0x2c, 0x3d, 0x4e, 0x5f];
    const UPDATE_INTERVAL: Duration = Duration::from_millis(100);

    struct FakeTimerState {
        now: Instant,
        scheduled_deadline: Option<Instant>,
    }

    #[derive(Clone)]
    struct FakeTimerManager {
        state: Rc<RefCell<FakeTimerState>>,
    }

    impl FakeTimerManager {
        fn new() -> Self {
            Self {
                state: Rc::new(RefCell::new(FakeTimerState {
                    now: Instant::now(),
                    scheduled_deadline: None,
                })),
            }
        }

        fn advance(&self, duration: Duration) {
            self.state.borrow_mut().now += duration;
        }

        fn scheduled_deadline(&self) -> Option<Instant> {
            self.state.borrow().scheduled_deadline
        }
    }

    impl TimerManager for FakeTimerManager {
        fn schedule(&mut self, from_now: Duration) {
            let mut state = self.state.borrow_mut();
            let deadline = state.now + from_now;
            state.scheduled_deadline = Some(deadline);
        }

        fn cancel(&mut self) {
            self.state.borrow_mut().scheduled_deadline = None;
        }

        fn now(&self) -> Instant {
            self.state.borrow().now
        }
    }

    fn test_selector() -> (MinstrelRateSelector<FakeTimerManager>, FakeTimerManager) {
        let timer_manager = FakeTimerManager::new();
        let selector = MinstrelRateSelector::new(
            timer_manager.clone(),
            UPDATE_INTERVAL,
            ProbeSequence::sequential(),
        );
        (selector, timer_manager)
    }

    fn erp_idx(offset: u16) -> TxVecIdx {
        TxVecIdx::new(ERP_START_IDX + offset).unwrap()
    }

    /// HT, 20 MHz, long GI.
    fn ht_idx(mcs_idx: u16) -> TxVecIdx {
        TxVecIdx::new(HT_START_IDX + mcs_idx).unwrap()
    }

    fn legacy_rates(rates: &[u8]) -> Vec<SupportedRate> {
        rates.iter().map(|r| SupportedRate(*r)).collect()
    }

    /// HT MCS 0-15, 20 MHz, long GI only.
    fn ht_mcs_0_15() -> HtCapabilities {
        HtCapabilities { rx_mcs_bitmask: 0xffff, chan_width_40: false, sgi_20: false, sgi_40: false }
    }

    fn assoc_ctx(rates: &[u8], ht_cap: Option<HtCapabilities>) -> AssocContext {
        AssocContext { addr: TEST_ADDR, rates: legacy_rates(rates), ht_cap }
    }

    /// The 12 legacy rates every test station advertises, in 0.5 Mbps units.
    const ALL_LEGACY_RATES: [u8; 12] = [2, 4, 11, 22, 12, 18, 24, 36, 48, 72, 96, 108];

    fn tx_report(ladder: &[(TxVecIdx, u8)], success: bool) -> WlanTxStatus {
        let mut tx_status_entry =
            [crate::device::WlanTxStatusEntry::default(); crate::device::WLAN_TX_STATUS_MAX_ENTRY];
        for (i, (idx, attempts)) in ladder.iter().enumerate() {
            tx_status_entry[i].tx_vector_idx = **idx;
            tx_status_entry[i].attempts = *attempts;
        }
        WlanTxStatus { peer_addr: TEST_ADDR, tx_status_entry, success }
    }

    fn report_and_update(
        selector: &mut MinstrelRateSelector<FakeTimerManager>,
        timer: &FakeTimerManager,
        ladder: &[(TxVecIdx, u8)],
        success: bool,
    ) {
        selector.handle_tx_status_report(&tx_report(ladder, success));
        timer.advance(UPDATE_INTERVAL);
        assert!(selector.handle_timeout());
    }

    #[test]
    fn perfect_tx_time_is_positive_for_all_vectors() {
        for raw in 1..=MAX_VALID_IDX {
            let idx = TxVecIdx::new(raw).unwrap();
            assert!(
                perfect_tx_time(idx) > Duration::from_nanos(0),
                "zero tx time for {}",
                idx
            );
        }
    }

    #[test]
    fn perfect_tx_time_reference_values() {
        // 54 Mbps ERP: 11200 bits at 27 bits/us.
        assert_eq!(perfect_tx_time(erp_idx(7)), Duration::from_nanos(207_407));
        // 1 Mbps DSSS.
        assert_eq!(
            perfect_tx_time(TxVecIdx::new(DSSS_CCK_START_IDX).unwrap()),
            Duration::from_nanos(11_200_000)
        );
        // HT MCS 0, 20 MHz, long GI: 26 bits per 4 us symbol.
        assert_eq!(perfect_tx_time(ht_idx(0)), Duration::from_nanos(1_723_076));
        // Short GI is faster than long GI for the same MCS, 40 MHz faster than 20 MHz.
        let mcs7_20_long = perfect_tx_time(ht_idx(7));
        let mcs7_40_long = perfect_tx_time(TxVecIdx::new(HT_START_IDX + 32 + 7).unwrap());
        let mcs7_20_short = perfect_tx_time(TxVecIdx::new(HT_START_IDX + 64 + 7).unwrap());
        assert!(mcs7_40_long < mcs7_20_long);
        assert!(mcs7_20_short < mcs7_20_long);
    }

    #[test]
    fn add_peer_with_no_usable_rates_fails() {
        let (mut selector, _timer) = test_selector();
        let err = selector.add_peer(&assoc_ctx(&[], None)).unwrap_err();
        assert!(matches!(err, Error::NoUsableRates(addr) if addr == TEST_ADDR));
        // No peer, no timer.
        assert!(selector.peer_list().is_empty());
        assert!(!selector.handle_timeout());
    }

    #[test]
    fn add_peer_with_empty_mcs_set_fails() {
        let (mut selector, _timer) = test_selector();
        let ht_cap = HtCapabilities {
            rx_mcs_bitmask: 0,
            chan_width_40: false,
            sgi_20: false,
            sgi_40: false,
        };
        let err = selector.add_peer(&assoc_ctx(&[12], Some(ht_cap))).unwrap_err();
        assert!(matches!(err, Error::EmptyMcsSet(addr) if addr == TEST_ADDR));
    }

    #[test]
    fn unknown_peer_gets_lowest_erp_rate() {
        let (mut selector, _timer) = test_selector();
        let idx = selector.get_tx_vector_idx(true, &TEST_ADDR, TxFlags::NONE);
        assert_eq!(idx, erp_idx(0));
        let idx = selector.get_tx_vector_idx(false, &TEST_ADDR, TxFlags::NONE);
        assert_eq!(idx, erp_idx(0));
    }

    #[test]
    fn first_peer_starts_timer_last_peer_cancels_it() {
        let (mut selector, timer) = test_selector();
        assert!(timer.scheduled_deadline().is_none());

        selector.add_peer(&assoc_ctx(&ALL_LEGACY_RATES, None)).unwrap();
        assert!(timer.scheduled_deadline().is_some());

        selector.remove_peer(&TEST_ADDR);
        assert!(timer.scheduled_deadline().is_none());
        assert!(selector.peer_list().is_empty());

        // A timer notification that raced with the removal is a no-op.
        timer.advance(UPDATE_INTERVAL);
        assert!(!selector.handle_timeout());
    }

    #[test]
    fn remove_unknown_peer_is_noop() {
        let (mut selector, timer) = test_selector();
        selector.add_peer(&assoc_ctx(&ALL_LEGACY_RATES, None)).unwrap();
        selector.remove_peer(&[0xff; 6]);
        assert!(timer.scheduled_deadline().is_some());
        assert_eq!(selector.peer_list(), vec![TEST_ADDR]);
    }

    #[test]
    fn timer_pacing() {
        let (mut selector, timer) = test_selector();
        selector.add_peer(&assoc_ctx(&ALL_LEGACY_RATES, None)).unwrap();

        timer.advance(Duration::from_millis(99));
        assert!(!selector.handle_timeout());

        timer.advance(Duration::from_millis(1));
        assert!(selector.handle_timeout());

        // Rescheduled one interval from completion.
        let now = timer.now();
        assert_eq!(timer.scheduled_deadline(), Some(now + UPDATE_INTERVAL));
        assert!(!selector.handle_timeout());
    }

    #[test]
    fn status_report_for_unknown_peer_is_ignored() {
        let (mut selector, _timer) = test_selector();
        selector.handle_tx_status_report(&tx_report(&[(erp_idx(0), 1)], true));
        assert!(selector.peer_list().is_empty());
    }

    #[test]
    fn get_stats_for_unknown_peer_is_not_found() {
        let (selector, _timer) = test_selector();
        assert!(matches!(selector.get_stats(&TEST_ADDR), Err(Error::PeerNotFound(_))));
    }

    #[test]
    fn fresh_peer_starts_at_lowest_indices() {
        let (mut selector, _timer) = test_selector();
        selector.add_peer(&assoc_ctx(&ALL_LEGACY_RATES, Some(ht_mcs_0_15()))).unwrap();
        let stats = selector.get_stats(&TEST_ADDR).unwrap();
        assert!(stats.is_ht);
        // Lowest index overall is HT MCS 0; no basic rates, so the basic pointers fall back
        // to the lowest legacy index (6 Mbps ERP).
        assert_eq!(stats.max_tp, ht_idx(0));
        assert_eq!(stats.max_probability, ht_idx(0));
        assert_eq!(stats.basic_max_probability, erp_idx(0));
        assert_eq!(stats.basic_highest, erp_idx(0));
        // 16 HT vectors + 12 legacy vectors.
        assert_eq!(stats.entries.len(), 28);
    }

    #[test]
    fn basic_rate_pointers_follow_advertisement() {
        let (mut selector, _timer) = test_selector();
        let rates = [12, 0x80 | 24, 0x80 | 48, 108];
        selector.add_peer(&assoc_ctx(&rates, None)).unwrap();
        let stats = selector.get_stats(&TEST_ADDR).unwrap();
        assert_eq!(stats.basic_max_probability, erp_idx(2)); // 12 Mbps, lowest basic
        assert_eq!(stats.basic_highest, erp_idx(4)); // 24 Mbps, highest basic

        let idx = selector.get_tx_vector_idx(false, &TEST_ADDR, TxFlags::NONE);
        assert_eq!(idx, erp_idx(2));
    }

    #[test]
    fn reliability_flag_selects_max_probability() {
        let (mut selector, timer) = test_selector();
        selector.add_peer(&assoc_ctx(&[12, 108], None)).unwrap();

        // 6 Mbps succeeds every time; 54 Mbps half of the time.
        for _ in 0..3 {
            selector.handle_tx_status_report(&tx_report(&[(erp_idx(0), 1)], true));
            selector.handle_tx_status_report(&tx_report(&[(erp_idx(7), 2)], true));
            timer.advance(UPDATE_INTERVAL);
            assert!(selector.handle_timeout());
        }
        let stats = selector.get_stats(&TEST_ADDR).unwrap();
        assert_eq!(stats.max_tp, erp_idx(7)); // 0.5 * 27 Mbps still beats 1.0 * 6 Mbps
        assert_eq!(stats.max_probability, erp_idx(0));

        let idx = selector.get_tx_vector_idx(true, &TEST_ADDR, TxFlags::FAVOR_RELIABILITY);
        assert_eq!(idx, erp_idx(0));
    }

    #[test]
    fn probe_paced_every_16th_data_frame() {
        let (mut selector, _timer) = test_selector();
        selector.add_peer(&assoc_ctx(&ALL_LEGACY_RATES, Some(ht_mcs_0_15()))).unwrap();

        // Frames 1-15 use max_tp (HT MCS 0, the lowest index).
        for _ in 0..PROBE_INTERVAL - 1 {
            let idx = selector.get_tx_vector_idx(true, &TEST_ADDR, TxFlags::NONE);
            assert_eq!(idx, ht_idx(0));
        }
        // Frame 16 probes. The sequential walk starts at HT MCS 0, which is skipped as the
        // current max_tp/max_probability, so MCS 1 is the first acceptable candidate.
        let idx = selector.get_tx_vector_idx(true, &TEST_ADDR, TxFlags::NONE);
        assert_eq!(idx, ht_idx(1));

        // The next window again: 15 frames at max_tp, then the next probe in sequence.
        for _ in 0..PROBE_INTERVAL - 1 {
            let idx = selector.get_tx_vector_idx(true, &TEST_ADDR, TxFlags::NONE);
            assert_eq!(idx, ht_idx(0));
        }
        let idx = selector.get_tx_vector_idx(true, &TEST_ADDR, TxFlags::NONE);
        assert_eq!(idx, ht_idx(2));

        let stats = selector.get_stats(&TEST_ADDR).unwrap();
        assert_eq!(stats.probes, 2);
    }

    #[test]
    fn probe_skip_heuristics() {
        let (mut selector, _timer) = test_selector();
        selector.add_peer(&assoc_ctx(&ALL_LEGACY_RATES, Some(ht_mcs_0_15()))).unwrap();
        let peer = selector.peer_map.get_mut(&TEST_ADDR).unwrap();

        // Favored vectors are never probed.
        assert!(!peer.is_probe_needed(peer.max_tp));
        assert!(!peer.is_probe_needed(peer.max_probability));
        assert!(!peer.is_probe_needed(peer.basic_max_probability));
        assert!(!peer.is_probe_needed(peer.basic_highest));

        // Vectors the peer does not support are never probed.
        assert!(!peer.is_probe_needed(ht_idx(16)));

        // A fresh, unmeasured vector is probed.
        assert!(peer.is_probe_needed(ht_idx(5)));

        // Over-sampled within the current probe cycle.
        peer.tx_stats_map.get_mut(&ht_idx(5)).unwrap().probes_total = 1;
        assert!(!peer.is_probe_needed(ht_idx(5)));
        peer.num_probe_cycles_done = 1;
        assert!(peer.is_probe_needed(ht_idx(5)));

        // A rate slower than the most reliable one gets at most MAX_SLOW_PROBE tries per cycle.
        // 1 Mbps DSSS is slower than anything.
        let dsss = TxVecIdx::new(DSSS_CCK_START_IDX).unwrap();
        peer.max_probability = ht_idx(0);
        peer.basic_max_probability = ht_idx(0);
        peer.basic_highest = ht_idx(0);
        peer.tx_stats_map.get_mut(&dsss).unwrap().attempts_cur = MAX_SLOW_PROBE;
        assert!(!peer.is_probe_needed(dsss));
        peer.tx_stats_map.get_mut(&dsss).unwrap().attempts_cur = 0;
        assert!(peer.is_probe_needed(dsss));

        // A measured-dead vector backs off for DEAD_PROBE_CYCLE_COUNT cycles.
        {
            let stats = peer.tx_stats_map.get_mut(&ht_idx(7)).unwrap();
            stats.attempts_total = 10;
            stats.probability = 0.05;
            stats.probe_cycles_skipped = DEAD_PROBE_CYCLE_COUNT - 1;
        }
        assert!(!peer.is_probe_needed(ht_idx(7)));
        peer.tx_stats_map.get_mut(&ht_idx(7)).unwrap().probe_cycles_skipped =
            DEAD_PROBE_CYCLE_COUNT;
        assert!(peer.is_probe_needed(ht_idx(7)));
        // ...but not while attempts are still pending.
        peer.tx_stats_map.get_mut(&ht_idx(7)).unwrap().attempts_cur = 1;
        assert!(!peer.is_probe_needed(ht_idx(7)));
    }

    #[test]
    fn ht_preferred_over_perfect_legacy() {
        let (mut selector, timer) = test_selector();
        selector.add_peer(&assoc_ctx(&[12], Some(ht_mcs_0_15()))).unwrap();

        // Legacy 6 Mbps succeeds perfectly; HT MCS 3 succeeds once in four attempts.
        selector.handle_tx_status_report(&tx_report(&[(erp_idx(0), 1)], true));
        selector.handle_tx_status_report(&tx_report(&[(ht_idx(3), 4)], true));
        timer.advance(UPDATE_INTERVAL);
        assert!(selector.handle_timeout());

        let stats = selector.get_stats(&TEST_ADDR).unwrap();
        assert_eq!(stats.max_tp, ht_idx(3));
        assert_eq!(stats.max_probability, ht_idx(3));
    }

    #[test]
    fn converges_to_measured_best_rate() {
        let (mut selector, timer) = test_selector();
        selector.add_peer(&assoc_ctx(&ALL_LEGACY_RATES, Some(ht_mcs_0_15()))).unwrap();

        // MCS 7, 6, 5 each fail once; MCS 4 succeeds.
        let ladder =
            [(ht_idx(7), 1), (ht_idx(6), 1), (ht_idx(5), 1), (ht_idx(4), 1)];
        report_and_update(&mut selector, &timer, &ladder, true);

        // A 100% measured rate beats every untested higher rate.
        let stats = selector.get_stats(&TEST_ADDR).unwrap();
        assert_eq!(stats.max_tp, ht_idx(4));
        assert_eq!(stats.max_probability, ht_idx(4));

        // Channel degrades: MCS 4 now fails and MCS 0 delivers.
        for _ in 0..10 {
            report_and_update(&mut selector, &timer, &[(ht_idx(4), 1), (ht_idx(0), 1)], true);
        }
        let stats = selector.get_stats(&TEST_ADDR).unwrap();
        assert_eq!(stats.max_probability, ht_idx(0));
        // MCS 4's EWMA probability has decayed far enough that its expected throughput lost
        // to MCS 0's certain delivery.
        assert_eq!(stats.max_tp, ht_idx(0));
    }

    #[test]
    fn lazy_tx_stats_materialization() {
        let (mut selector, timer) = test_selector();
        // 48 and 54 Mbps not advertised.
        selector.add_peer(&assoc_ctx(&[12, 18, 24, 36, 48, 72], None)).unwrap();

        let stats = selector.get_stats(&TEST_ADDR).unwrap();
        assert!(stats.entries.iter().all(|s| s.tx_vector_idx != erp_idx(6)));
        assert!(stats.entries.iter().all(|s| s.tx_vector_idx != erp_idx(7)));

        // The hardware tried 54 Mbps anyway.
        report_and_update(&mut selector, &timer, &[(erp_idx(7), 1)], true);

        let stats = selector.get_stats(&TEST_ADDR).unwrap();
        let entry = stats
            .entries
            .iter()
            .find(|s| s.tx_vector_idx == erp_idx(7))
            .expect("tx vector not materialized");
        assert_eq!(entry.attempts_total, 1);
        assert_eq!(entry.success_total, 1);
        assert_eq!(entry.probability, 1.0);
    }

    #[test]
    fn out_of_range_report_entries_are_skipped() {
        let (mut selector, timer) = test_selector();
        selector.add_peer(&assoc_ctx(&[12], None)).unwrap();

        let mut report = tx_report(&[(erp_idx(0), 1)], true);
        report.tx_status_entry[0].tx_vector_idx = MAX_VALID_IDX + 7;
        report.tx_status_entry[1].tx_vector_idx = *erp_idx(0);
        report.tx_status_entry[1].attempts = 1;
        selector.handle_tx_status_report(&report);
        timer.advance(UPDATE_INTERVAL);
        assert!(selector.handle_timeout());

        let stats = selector.get_stats(&TEST_ADDR).unwrap();
        // Only the valid entry was counted, and it took the success.
        assert_eq!(stats.entries.len(), 1);
        assert_eq!(stats.entries[0].attempts_total, 1);
        assert_eq!(stats.entries[0].success_total, 1);
    }

    #[test]
    fn empty_update_cycles_only_bump_skip_count() {
        let ctx = assoc_ctx(&ALL_LEGACY_RATES, Some(ht_mcs_0_15()));
        let mut peer = Peer::from_assoc_ctx(&ctx).unwrap();
        peer.handle_tx_status_report(&tx_report(&[(ht_idx(2), 2)], true));
        peer.update_stats();

        let before = peer.tx_stats_map.clone();
        peer.update_stats();
        for (idx, stats) in &peer.tx_stats_map {
            let mut expected = before[idx].clone();
            expected.probe_cycles_skipped += 1;
            assert_eq!(stats, &expected, "unexpected change for {}", idx);
        }
        assert_eq!(peer.max_tp, ht_idx(2));
    }

    #[test]
    fn lifetime_counters_reset_on_overflow() {
        let mut stats = TxStats::new(erp_idx(0));
        stats.attempts_total = u64::MAX - 1;
        stats.success_total = u64::MAX - 3;
        stats.attempts_cur = 5;
        stats.success_cur = 3;
        stats.update();
        assert_eq!(stats.attempts_total, 5);
        assert_eq!(stats.success_total, 3);
        assert_eq!(stats.attempts_cur, 0);
        assert_eq!(stats.success_cur, 0);
    }

    #[test]
    fn success_counted_on_last_attempted_entry_only() {
        let (mut selector, timer) = test_selector();
        selector.add_peer(&assoc_ctx(&[12, 108], None)).unwrap();

        report_and_update(&mut selector, &timer, &[(erp_idx(7), 2), (erp_idx(0), 1)], true);

        let stats = selector.get_stats(&TEST_ADDR).unwrap();
        let by_idx = |idx: TxVecIdx| {
            stats.entries.iter().find(|s| s.tx_vector_idx == idx).unwrap().clone()
        };
        let fast = by_idx(erp_idx(7));
        assert_eq!(fast.attempts_total, 2);
        assert_eq!(fast.success_total, 0);
        assert_eq!(fast.probability, 0.0);
        let slow = by_idx(erp_idx(0));
        assert_eq!(slow.attempts_total, 1);
        assert_eq!(slow.success_total, 1);
        assert_eq!(slow.probability, 1.0);
    }
}
