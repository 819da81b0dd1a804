//! Load balancing state for the RX/TX CPU scheduler.
//!
//! The scheduler itself lives in the driver core. This module only holds the
//! knobs it reads:
//!
//! - The RX flow control hysteresis band, [`Thresholds`]. Flow control
//!   engages once the pending RX completions reach `stop` and releases once
//!   they drop to `start`. Without a gap between the two the scheduler would
//!   toggle every poll.
//! - The [`CpuAffinity`] masks that drive CPU candidacy.
//! - The RX/TX CPU overrides, gated by `candidacy_override`.
use crate::{
    driver::DriverCore,
    error::{Error, Result},
};
use std::{
    collections::BTreeSet,
    fmt,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
        MutexGuard,
        PoisonError,
    },
};

/// Upper bound on the memory the RX path may hold before flow control.
pub const ONE_GIB: u64 = 1024 * 1024 * 1024;

/// Largest CPU count the kernel can be configured for, `CONFIG_NR_CPUS`.
pub const MAX_CPUS: usize = 8192;

/// A set of CPU ids.
///
/// Parsed from and displayed as the kernel CPU list format, ie `0-3,6`.
/// A `0x` prefixed hex bitmap, ie `0x4f`, is also accepted when parsing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuMask(BTreeSet<usize>);

impl CpuMask {
    pub fn new() -> Self {
        Self::default()
    }

    /// CPUs `0..count`
    pub fn first(count: usize) -> Self {
        Self((0..count).collect())
    }

    pub fn insert(&mut self, cpu: usize) {
        self.0.insert(cpu);
    }

    pub fn contains(&self, cpu: usize) -> bool {
        self.0.contains(&cpu)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().copied()
    }

    /// Whether every CPU in `self` is also in `other`
    pub fn is_subset(&self, other: &CpuMask) -> bool {
        self.0.is_subset(&other.0)
    }

    /// Parse `s`, rejecting any CPU id of `limit` or above.
    ///
    /// Ranges are checked before they are expanded.
    pub fn parse_bounded(s: &str, limit: usize) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::new());
        }
        match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => Self::parse_hex(hex, limit),
            None => Self::parse_list(s, limit),
        }
    }

    fn parse_hex(hex: &str, limit: usize) -> Result<Self> {
        let mut mask = Self::new();
        // Kernel bitmaps may be split in 32 bit words by commas.
        let digits: String = hex.chars().filter(|c| *c != ',').collect();
        if digits.is_empty() {
            return Err(Error::invalid("empty cpu bitmap"));
        }
        for (i, c) in digits.chars().rev().enumerate() {
            let nibble = c
                .to_digit(16)
                .ok_or_else(|| Error::invalid(format!("invalid cpu bitmap `{hex}`")))?;
            for bit in 0..4 {
                if nibble & (1 << bit) != 0 {
                    let cpu = i * 4 + bit;
                    if cpu >= limit {
                        return Err(out_of_range(cpu, limit));
                    }
                    mask.insert(cpu);
                }
            }
        }
        Ok(mask)
    }

    fn parse_list(list: &str, limit: usize) -> Result<Self> {
        let mut mask = Self::new();
        let bad = || Error::invalid(format!("invalid cpu list `{list}`"));
        for part in list.split(',') {
            match part.split_once('-') {
                Some((start, end)) => {
                    let start: usize = start.parse().map_err(|_| bad())?;
                    let end: usize = end.parse().map_err(|_| bad())?;
                    if start > end {
                        return Err(bad());
                    }
                    if end >= limit {
                        return Err(out_of_range(end, limit));
                    }
                    for cpu in start..=end {
                        mask.insert(cpu);
                    }
                }
                None => {
                    let cpu: usize = part.parse().map_err(|_| bad())?;
                    if cpu >= limit {
                        return Err(out_of_range(cpu, limit));
                    }
                    mask.insert(cpu);
                }
            }
        }
        Ok(mask)
    }
}

fn out_of_range(cpu: usize, limit: usize) -> Error {
    Error::invalid(format!("cpu {cpu} out of range, limit is {limit}"))
}

impl FromStr for CpuMask {
    type Err = Error;

    /// See [`CpuMask::parse_bounded`], bounded by [`MAX_CPUS`]
    fn from_str(s: &str) -> Result<Self> {
        Self::parse_bounded(s, MAX_CPUS)
    }
}

impl fmt::Display for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut iter = self.iter().peekable();
        let mut first = true;
        while let Some(start) = iter.next() {
            let mut end = start;
            while iter.peek() == Some(&(end + 1)) {
                end += 1;
                iter.next();
            }
            if !first {
                write!(f, ",")?;
            }
            first = false;
            if start == end {
                write!(f, "{start}")?;
            } else {
                write!(f, "{start}-{end}")?;
            }
        }
        Ok(())
    }
}

impl FromIterator<usize> for CpuMask {
    fn from_iter<T: IntoIterator<Item = usize>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Which [`CpuAffinity`] mask
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskKind {
    Primary,
    Secondary,
}

/// CPU masks the scheduler picks RX/TX CPUs from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuAffinity {
    pub primary: CpuMask,
    pub secondary: CpuMask,
}

impl CpuAffinity {
    pub fn get(&self, kind: MaskKind) -> &CpuMask {
        match kind {
            MaskKind::Primary => &self.primary,
            MaskKind::Secondary => &self.secondary,
        }
    }

    fn get_mut(&mut self, kind: MaskKind) -> &mut CpuMask {
        match kind {
            MaskKind::Primary => &mut self.primary,
            MaskKind::Secondary => &mut self.secondary,
        }
    }
}

/// Sizing that bounds the stop threshold.
#[derive(Debug, Clone, Copy)]
pub struct ThresholdLimits {
    /// Bytes per posted RX buffer
    pub entry_size: u64,

    /// Entries per RX completion ring
    pub max_entries: u64,
}

impl ThresholdLimits {
    /// Whether `stop` keeps the RX path within [`ONE_GIB`]
    fn stop_fits(&self, stop: u32) -> bool {
        u64::from(stop)
            .checked_mul(self.entry_size)
            .and_then(|b| b.checked_mul(self.max_entries))
            .map_or(false, |b| b <= ONE_GIB)
    }
}

/// RX flow control hysteresis band, in ring-entry units.
///
/// Either both are zero, flow control disabled, or `0 < start < stop`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Thresholds {
    stop: u32,
    start: u32,
}

impl Thresholds {
    pub fn stop(&self) -> u32 {
        self.stop
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    /// Whether flow control is configured at all
    pub fn enabled(&self) -> bool {
        self.stop != 0
    }

    pub fn disable(&mut self) {
        *self = Self::default();
    }

    /// Set the stop threshold. `0` disables both.
    ///
    /// # Errors
    ///
    /// - If `value` entries of every ring would hold more than [`ONE_GIB`]
    /// - If `value` is not above the start threshold
    pub fn set_stop(&mut self, value: u32, limits: &ThresholdLimits) -> Result<()> {
        if value == 0 {
            self.disable();
            return Ok(());
        }
        if !limits.stop_fits(value) {
            return Err(Error::invalid(format!(
                "stop threshold {value} exceeds the 1GiB RX budget"
            )));
        }
        if value <= self.start {
            return Err(Error::invalid(format!(
                "stop threshold {value} must be above start threshold {}",
                self.start
            )));
        }
        self.stop = value;
        Ok(())
    }

    /// Set the start threshold. `0` disables both.
    ///
    /// # Errors
    ///
    /// - If `value` is not below the stop threshold
    pub fn set_start(&mut self, value: u32) -> Result<()> {
        if value == 0 {
            self.disable();
            return Ok(());
        }
        if value >= self.stop {
            return Err(Error::invalid(format!(
                "start threshold {value} must be below stop threshold {}",
                self.stop
            )));
        }
        self.start = value;
        Ok(())
    }
}

/// CPU override the scheduler is forced to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Rx,
    Tx,
}

#[derive(Debug, Default)]
struct State {
    thresholds: Thresholds,
    affinity: CpuAffinity,
    rx_cpu: u32,
    tx_cpu: u32,
}

/// Shared load balancing state of one driver instance.
#[derive(Debug)]
pub struct LoadBalance {
    state: Mutex<State>,
    limits: ThresholdLimits,
    host_cpus: CpuMask,
    nr_cpus: usize,
    flow_ctrl: AtomicBool,
    candidacy_override: AtomicBool,
    txp_active: AtomicBool,
    rxp_active: AtomicBool,
}

impl LoadBalance {
    /// New state, both masks covering every host CPU.
    pub fn new(limits: ThresholdLimits, host_cpus: CpuMask) -> Self {
        let nr_cpus = host_cpus.iter().last().map_or(0, |c| c + 1);
        let state = State {
            affinity: CpuAffinity {
                primary: host_cpus.clone(),
                secondary: host_cpus.clone(),
            },
            ..State::default()
        };
        Self {
            state: Mutex::new(state),
            limits,
            host_cpus,
            nr_cpus,
            flow_ctrl: AtomicBool::new(false),
            candidacy_override: AtomicBool::new(false),
            txp_active: AtomicBool::new(false),
            rxp_active: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // Validation happens before mutation, so a poisoned state is consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// One past the highest host CPU id. Masks naming anything at or above
    /// it can never be a subset of the host CPUs.
    pub fn cpu_limit(&self) -> usize {
        self.nr_cpus
    }

    pub fn limits(&self) -> &ThresholdLimits {
        &self.limits
    }

    pub fn thresholds(&self) -> Thresholds {
        self.lock().thresholds
    }

    /// Stop threshold in ring entries, as the scheduler compares it.
    pub fn stop_entries(&self) -> u64 {
        u64::from(self.lock().thresholds.stop) * self.limits.max_entries
    }

    /// Start threshold in ring entries, as the scheduler compares it.
    pub fn start_entries(&self) -> u64 {
        u64::from(self.lock().thresholds.start) * self.limits.max_entries
    }

    /// See [`Thresholds::set_stop`]
    pub fn set_stop(&self, value: u32) -> Result<()> {
        let mut state = self.lock();
        state.thresholds.set_stop(value, &self.limits)?;
        if value == 0 {
            self.flow_ctrl.store(false, Ordering::SeqCst);
            log::info!("RX flow control disabled");
        }
        Ok(())
    }

    /// See [`Thresholds::set_start`]
    pub fn set_start(&self, value: u32) -> Result<()> {
        let mut state = self.lock();
        state.thresholds.set_start(value)?;
        if value == 0 {
            self.flow_ctrl.store(false, Ordering::SeqCst);
            log::info!("RX flow control disabled");
        }
        Ok(())
    }

    /// Whether RX flow control is currently engaged.
    pub fn flow_control(&self) -> bool {
        self.flow_ctrl.load(Ordering::SeqCst)
    }

    /// Engage or release RX flow control for `pending` RX completions,
    /// following the hysteresis band.
    ///
    /// Returns whether flow control is engaged afterwards.
    pub fn update_flow_control(&self, pending: u64) -> bool {
        let state = self.lock();
        if !state.thresholds.enabled() {
            self.flow_ctrl.store(false, Ordering::SeqCst);
            return false;
        }
        let stop = u64::from(state.thresholds.stop) * self.limits.max_entries;
        let start = u64::from(state.thresholds.start) * self.limits.max_entries;
        let engaged = self.flow_ctrl.load(Ordering::SeqCst);
        let engaged = if engaged { pending > start } else { pending >= stop };
        self.flow_ctrl.store(engaged, Ordering::SeqCst);
        engaged
    }

    pub fn affinity(&self) -> CpuAffinity {
        self.lock().affinity.clone()
    }

    /// Replace one affinity mask and recompute candidacy.
    ///
    /// `core` is called with a snapshot of both masks after the lock is
    /// released. It finding no eligible CPU is not an error.
    ///
    /// # Errors
    ///
    /// - If `mask` is empty
    /// - If `mask` contains CPUs the host doesn't have
    pub fn set_cpu_mask(&self, kind: MaskKind, mask: CpuMask, core: &dyn DriverCore) -> Result<()> {
        if mask.is_empty() {
            return Err(Error::invalid("empty cpu mask"));
        }
        if !mask.is_subset(&self.host_cpus) {
            return Err(Error::invalid(format!(
                "cpu mask {mask} is outside host cpus {}",
                self.host_cpus
            )));
        }
        let affinity = {
            let mut state = self.lock();
            *state.affinity.get_mut(kind) = mask;
            state.affinity.clone()
        };
        log::info!(
            "cpu masks now primary={} secondary={}",
            affinity.primary,
            affinity.secondary
        );
        core.select_cpu_candidacy(&affinity);
        Ok(())
    }

    pub fn candidacy_override(&self) -> bool {
        self.candidacy_override.load(Ordering::SeqCst)
    }

    pub fn set_candidacy_override(&self, on: bool) {
        self.candidacy_override.store(on, Ordering::SeqCst);
        log::info!("candidacy override {}", if on { "on" } else { "off" });
    }

    pub fn cpu(&self, dir: Direction) -> u32 {
        let state = self.lock();
        match dir {
            Direction::Rx => state.rx_cpu,
            Direction::Tx => state.tx_cpu,
        }
    }

    /// Force the RX or TX CPU.
    ///
    /// # Errors
    ///
    /// - [`Error::PermissionDenied`] unless `candidacy_override` is on
    /// - If `cpu` is not one of the host CPUs
    pub fn set_cpu(&self, dir: Direction, cpu: u32) -> Result<()> {
        let name = match dir {
            Direction::Rx => "rx_cpu",
            Direction::Tx => "tx_cpu",
        };
        if !self.candidacy_override() {
            return Err(Error::PermissionDenied(
                name.into(),
                crate::error::Access::Write,
            ));
        }
        if !usize::try_from(cpu).map_or(false, |c| self.host_cpus.contains(c)) {
            return Err(Error::invalid(format!(
                "cpu {cpu} is not a host cpu ({})",
                self.host_cpus
            )));
        }
        let mut state = self.lock();
        match dir {
            Direction::Rx => state.rx_cpu = cpu,
            Direction::Tx => state.tx_cpu = cpu,
        }
        log::info!("{name} = {cpu}");
        Ok(())
    }

    pub fn txp_active(&self) -> bool {
        self.txp_active.load(Ordering::SeqCst)
    }

    /// Switch TX load balancing. The scheme changed, so per CPU TX run
    /// counters are cleared by `core`.
    pub fn set_txp_active(&self, on: bool, core: &dyn DriverCore) {
        self.txp_active.store(on, Ordering::SeqCst);
        core.clear_tx_cpu_counters();
    }

    pub fn rxp_active(&self) -> bool {
        self.rxp_active.load(Ordering::SeqCst)
    }

    pub fn set_rxp_active(&self, on: bool) {
        self.rxp_active.store(on, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::testing::MockCore;
    use anyhow::Result;
    use proptest::prelude::*;

    const LIMITS: ThresholdLimits = ThresholdLimits {
        entry_size: 2048,
        max_entries: 1024,
    };

    fn lb() -> LoadBalance {
        LoadBalance::new(LIMITS, CpuMask::first(8))
    }

    #[test]
    fn cpu_list() -> Result<()> {
        let m: CpuMask = "0-3,6".parse()?;
        assert_eq!(m.iter().collect::<Vec<_>>(), vec![0, 1, 2, 3, 6]);
        assert_eq!(m.to_string(), "0-3,6");
        let m: CpuMask = "0x51\n".parse()?;
        assert_eq!(m.to_string(), "0,4,6");
        let m: CpuMask = "0x1,00000000".parse()?;
        assert_eq!(m.to_string(), "32");
        assert!("3-1".parse::<CpuMask>().is_err());
        assert!("a".parse::<CpuMask>().is_err());
        assert!("".parse::<CpuMask>()?.is_empty());
        Ok(())
    }

    #[test]
    fn cpu_list_bounded() -> Result<()> {
        assert!(matches!(
            CpuMask::parse_bounded("0-4294967295", 8),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            "0-18446744073709551615".parse::<CpuMask>(),
            Err(Error::InvalidArgument(_))
        ));
        assert!(CpuMask::parse_bounded("8", 8).is_err());
        assert!(CpuMask::parse_bounded("0x100", 8).is_err());
        assert_eq!(CpuMask::parse_bounded("0-7", 8)?, CpuMask::first(8));
        assert_eq!(CpuMask::parse_bounded("0x0ff", 8)?, CpuMask::first(8));
        Ok(())
    }

    #[test]
    fn stop_then_start() -> Result<()> {
        let mut t = Thresholds::default();
        t.set_stop(10, &LIMITS)?;
        t.set_start(5)?;
        assert_eq!((t.start(), t.stop()), (5, 10));
        // stop must stay above start
        assert!(t.set_stop(5, &LIMITS).is_err());
        assert!(t.set_start(10).is_err());
        assert_eq!((t.start(), t.stop()), (5, 10));
        Ok(())
    }

    #[test]
    fn start_needs_stop() {
        let mut t = Thresholds::default();
        t.set_stop(0, &LIMITS).unwrap();
        assert!(matches!(t.set_start(5), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn gigabyte_budget() {
        let mut t = Thresholds::default();
        // 512 * 2048 * 1024 is exactly 1GiB
        assert!(t.set_stop(512, &LIMITS).is_ok());
        assert!(t.set_stop(513, &LIMITS).is_err());
        assert!(t.set_stop(u32::MAX, &LIMITS).is_err());
        assert_eq!(t.stop(), 512);
    }

    #[test]
    fn zero_disables_and_clears_flow_control() -> Result<()> {
        let lb = lb();
        lb.set_stop(4)?;
        lb.set_start(2)?;
        assert!(lb.update_flow_control(4 * 1024));
        assert!(lb.flow_control());
        lb.set_start(0)?;
        assert_eq!(lb.thresholds(), Thresholds::default());
        assert!(!lb.flow_control());
        Ok(())
    }

    #[test]
    fn hysteresis() -> Result<()> {
        let lb = lb();
        lb.set_stop(4)?;
        lb.set_start(2)?;
        assert!(!lb.update_flow_control(3000));
        assert!(lb.update_flow_control(4096));
        // stays engaged inside the band
        assert!(lb.update_flow_control(3000));
        assert!(!lb.update_flow_control(2048));
        assert!(!lb.update_flow_control(3000));
        Ok(())
    }

    #[test]
    fn masks() -> Result<()> {
        let lb = lb();
        let core = MockCore::new();
        lb.set_cpu_mask(MaskKind::Primary, "4-7".parse()?, &core)?;
        assert_eq!(lb.affinity().primary.to_string(), "4-7");
        assert_eq!(core.candidacy_calls(), 1);

        assert!(lb.set_cpu_mask(MaskKind::Secondary, CpuMask::new(), &core).is_err());
        assert!(lb
            .set_cpu_mask(MaskKind::Secondary, "7-8".parse()?, &core)
            .is_err());
        assert_eq!(lb.affinity().secondary.to_string(), "0-7");
        assert_eq!(core.candidacy_calls(), 1);
        Ok(())
    }

    #[test]
    fn cpu_override_gate() -> Result<()> {
        let lb = lb();
        assert!(matches!(
            lb.set_cpu(Direction::Rx, 1),
            Err(Error::PermissionDenied(..))
        ));
        lb.set_candidacy_override(true);
        lb.set_cpu(Direction::Rx, 1)?;
        lb.set_cpu(Direction::Tx, 7)?;
        assert!(lb.set_cpu(Direction::Tx, 8).is_err());
        assert_eq!((lb.cpu(Direction::Rx), lb.cpu(Direction::Tx)), (1, 7));
        Ok(())
    }

    #[test]
    fn cpu_override_sparse_host() -> Result<()> {
        let lb = LoadBalance::new(LIMITS, "0,2".parse()?);
        lb.set_candidacy_override(true);
        assert_eq!(lb.cpu_limit(), 3);
        assert!(matches!(
            lb.set_cpu(Direction::Rx, 1),
            Err(Error::InvalidArgument(_))
        ));
        assert!(lb.set_cpu(Direction::Tx, 3).is_err());
        lb.set_cpu(Direction::Rx, 2)?;
        assert_eq!(lb.cpu(Direction::Rx), 2);
        assert_eq!(lb.cpu(Direction::Tx), 0);
        Ok(())
    }

    #[derive(Debug, Clone)]
    enum Op {
        Stop(u32),
        Start(u32),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u32..600).prop_map(Op::Stop),
            (0u32..600).prop_map(Op::Start),
        ]
    }

    proptest! {
        #[test]
        fn band_invariant(ops in proptest::collection::vec(op(), 0..64)) {
            let mut t = Thresholds::default();
            for op in ops {
                let before = t;
                let res = match op {
                    Op::Stop(v) => t.set_stop(v, &LIMITS),
                    Op::Start(v) => t.set_start(v),
                };
                if res.is_err() {
                    prop_assert_eq!(t, before);
                }
                prop_assert!(
                    (t.start() == 0 && t.stop() == 0)
                        || (t.start() < t.stop() && t.stop() != 0)
                );
                prop_assert!(u64::from(t.stop()) * 2048 * 1024 <= ONE_GIB);
            }
        }

        #[test]
        fn zero_always_disables(stop in 1u32..512, start in 0u32..512, zero_stop in any::<bool>()) {
            let mut t = Thresholds::default();
            let _ = t.set_stop(stop, &LIMITS);
            let _ = t.set_start(start);
            if zero_stop {
                prop_assert!(t.set_stop(0, &LIMITS).is_ok());
            } else {
                prop_assert!(t.set_start(0).is_ok());
            }
            prop_assert_eq!(t, Thresholds::default());
        }
    }
}
