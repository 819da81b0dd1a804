//! Cumulative power state statistics.
//!
//! The firmware reports per power state entry counts and residency
//! durations. Those counters reset whenever the device does, so every
//! snapshot is merged into host side accumulators that only ever grow.
//!
//! # Note
//!
//! Duration counters of the awake/PM states jitter backwards by a few
//! microseconds around snapshot boundaries. A backward step no larger than
//! [`DEFAULT_JITTER_USEC`] is dropped for those, anything larger is taken as
//! a device reset. The threshold was tuned for one device family, so it is
//! configurable through [`crate::driver::Config`].
use std::fmt::{self, Write};

pub const USEC_PER_MSEC: u64 = 1000;

pub const USEC_PER_SEC: u64 = 1_000_000;

/// Backward steps up to this many microseconds are treated as jitter.
pub const DEFAULT_JITTER_USEC: u64 = USEC_PER_MSEC;

/// Hardware power states, in report order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PowerState {
    Awake,
    /// Power save, reported as `ASLEEP`.
    Pm,
    L0,
    L1,
    L1_1,
    L1_2,
    L2,
}

impl PowerState {
    pub const ALL: [PowerState; 7] = [
        PowerState::Awake,
        PowerState::Pm,
        PowerState::L0,
        PowerState::L1,
        PowerState::L1_1,
        PowerState::L1_2,
        PowerState::L2,
    ];

    fn index(self) -> usize {
        self as usize
    }

    /// Section header in the rendered report
    pub fn label(self) -> &'static str {
        match self {
            PowerState::Awake => "AWAKE",
            PowerState::Pm => "ASLEEP",
            PowerState::L0 => "L0",
            PowerState::L1 => "L1",
            PowerState::L1_1 => "L1_1",
            PowerState::L1_2 => "L1_2",
            PowerState::L2 => "L2",
        }
    }

    /// Whether the firmware reports a last entry timestamp for this state.
    pub fn has_entry_timestamp(self) -> bool {
        matches!(self, PowerState::Awake | PowerState::Pm)
    }

    /// Whether a backward duration step always rebases.
    ///
    /// Only the link states do, awake/PM durations filter jitter.
    fn forced_duration(self) -> bool {
        !self.has_entry_timestamp()
    }
}

/// Entry count and total residency of one power state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Residency {
    pub count: u64,
    pub duration_usec: u64,
}

/// One poll of the firmware power counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PowerSnapshot {
    /// Device clock when the snapshot was taken
    pub timestamp_usec: u64,
    residency: [Residency; 7],
    entry_timestamp_usec: [u64; 7],
}

impl PowerSnapshot {
    pub fn new(timestamp_usec: u64) -> Self {
        Self {
            timestamp_usec,
            ..Self::default()
        }
    }

    pub fn residency(&self, state: PowerState) -> Residency {
        self.residency[state.index()]
    }

    pub fn set_residency(&mut self, state: PowerState, count: u64, duration_usec: u64) {
        self.residency[state.index()] = Residency {
            count,
            duration_usec,
        };
    }

    /// Last entry timestamp of `state`, device clock. `0` if never entered.
    pub fn entry_timestamp(&self, state: PowerState) -> u64 {
        self.entry_timestamp_usec[state.index()]
    }

    /// Only meaningful for states with [`PowerState::has_entry_timestamp`]
    pub fn set_entry_timestamp(&mut self, state: PowerState, usec: u64) {
        self.entry_timestamp_usec[state.index()] = usec;
    }

    /// Builder form of [`PowerSnapshot::set_residency`]
    pub fn with(mut self, state: PowerState, count: u64, duration_usec: u64) -> Self {
        self.set_residency(state, count, duration_usec);
        self
    }

    /// Builder form of [`PowerSnapshot::set_entry_timestamp`]
    pub fn with_entry(mut self, state: PowerState, usec: u64) -> Self {
        self.set_entry_timestamp(state, usec);
        self
    }
}

/// Merge one counter sample into its accumulator.
///
/// - A forward step adds the difference.
/// - A backward step rebases, adding `now` in full, when `force` is set or
///   the step exceeds `jitter_usec`.
/// - Otherwise the sample is dropped.
///
/// Returns whether anything changed.
pub fn merge(accum: &mut u64, last: &mut u64, now: u64, force: bool, jitter_usec: u64) -> bool {
    if now >= *last {
        *accum = accum.saturating_add(now - *last);
        *last = now;
        true
    } else if force || *last - now > jitter_usec {
        *accum = accum.saturating_add(now);
        *last = now;
        true
    } else {
        false
    }
}

/// Store a device last-entry timestamp translated to host time.
///
/// Zero means the state was never entered, and keeps the previous value.
pub fn merge_timestamp(last: &mut u64, now: u64, clock_correction: u64) {
    if now != 0 {
        *last = now.saturating_add(clock_correction);
    }
}

/// Host side accumulators for every [`PowerState`].
#[derive(Debug, Clone, Default)]
pub struct PowerStats {
    accumulated: [Residency; 7],
    last_seen: [Residency; 7],
    last_entry: [u64; 7],
    clock_correction: u64,
    jitter_usec: u64,
}

impl PowerStats {
    pub fn new(jitter_usec: u64) -> Self {
        Self {
            jitter_usec,
            ..Self::default()
        }
    }

    pub fn accumulated(&self, state: PowerState) -> Residency {
        self.accumulated[state.index()]
    }

    pub fn last_seen(&self, state: PowerState) -> Residency {
        self.last_seen[state.index()]
    }

    /// Last entry timestamp of `state`, host clock.
    pub fn last_entry(&self, state: PowerState) -> u64 {
        self.last_entry[state.index()]
    }

    /// Offset from the device clock to the host clock, in microseconds.
    pub fn clock_correction(&self) -> u64 {
        self.clock_correction
    }

    /// Forget everything merged so far.
    pub fn reset(&mut self) {
        *self = Self::new(self.jitter_usec);
    }

    /// Track the device/host clock offset.
    ///
    /// The correction only grows, and only when the offset moved by more
    /// than a second, so entry timestamps stay anchored to the host clock.
    pub fn update_clock_correction(&mut self, host_now_usec: u64, device_now_usec: u64) {
        let delta = host_now_usec.saturating_sub(device_now_usec);
        if delta > self.clock_correction && delta - self.clock_correction > USEC_PER_SEC {
            log::debug!(
                "power stats clock correction {} -> {delta}",
                self.clock_correction
            );
            self.clock_correction = delta;
        }
    }

    /// Merge a snapshot into the accumulators.
    pub fn apply(&mut self, snapshot: &PowerSnapshot) {
        let jitter = self.jitter_usec;
        for state in PowerState::ALL {
            let i = state.index();
            let now = snapshot.residency(state);
            let accum = &mut self.accumulated[i];
            let last = &mut self.last_seen[i];
            merge(&mut accum.count, &mut last.count, now.count, true, jitter);
            if !merge(
                &mut accum.duration_usec,
                &mut last.duration_usec,
                now.duration_usec,
                state.forced_duration(),
                jitter,
            ) {
                log::trace!("{} duration jitter dropped", state.label());
            }
            if state.has_entry_timestamp() {
                merge_timestamp(
                    &mut self.last_entry[i],
                    snapshot.entry_timestamp(state),
                    self.clock_correction,
                );
            }
        }
    }

    /// Correct the clock against `host_now_usec`, then merge `snapshot`.
    pub fn refresh(&mut self, snapshot: &PowerSnapshot, host_now_usec: u64) {
        self.update_clock_correction(host_now_usec, snapshot.timestamp_usec);
        self.apply(snapshot);
    }

    /// Write the report of every state.
    ///
    /// ```text
    /// AWAKE:
    /// count: 0x2
    /// duration_usec: 0x3e8
    /// last_entry_timestamp_usec: 0x5f5e100
    /// ...
    /// L2:
    /// count: 0x0
    /// duration_usec: 0x0
    /// ```
    pub fn render<W: Write>(&self, out: &mut W) -> fmt::Result {
        for state in PowerState::ALL {
            let accum = self.accumulated(state);
            writeln!(out, "{}:", state.label())?;
            writeln!(out, "count: {:#x}", accum.count)?;
            writeln!(out, "duration_usec: {:#x}", accum.duration_usec)?;
            if state.has_entry_timestamp() {
                writeln!(
                    out,
                    "last_entry_timestamp_usec: {:#x}",
                    self.last_entry(state)
                )?;
            }
        }
        Ok(())
    }
}
