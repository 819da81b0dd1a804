//! The driver instance behind every attribute.
//!
//! [`ControlContext`] owns the state the attributes read and write, and
//! reaches the rest of the driver through [`DriverCore`].
use crate::{
    error::Result,
    lb::{CpuAffinity, CpuMask, LoadBalance, ThresholdLimits},
    power::{PowerSnapshot, PowerStats, DEFAULT_JITTER_USEC},
    util::{PAGE_SIZE, SYSFS_PATH},
};
use bitflags::bitflags;
use nix::unistd::{sysconf, SysconfVar};
use std::{
    fs,
    io,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Mutex,
        MutexGuard,
        PoisonError,
    },
    time::{SystemTime, UNIX_EPOCH},
};

/// Length limit of firmware and nvram paths, including the terminator.
pub const PATH_MAX: usize = 2048;

/// Firmware features the control surface asks about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FwFeature {
    /// Periodic event counters
    Ecounters,
}

/// The rest of the driver: firmware, bus and scheduler.
///
/// Every call is synchronous, and is made from whichever thread is
/// servicing the attribute access.
pub trait DriverCore: Send + Sync {
    /// Query the firmware power counters.
    ///
    /// # Errors
    ///
    /// - If the firmware couldn't be reached
    fn query_power_stats(&self) -> io::Result<PowerSnapshot>;

    /// Whether the running firmware supports `feature`
    fn firmware_supports(&self, feature: FwFeature) -> bool;

    /// Turn firmware event counters on or off.
    fn configure_ecounters(&self, enable: bool) -> io::Result<()>;

    /// Re-run RX/TX CPU candidacy against new masks.
    ///
    /// Finding no eligible CPU is fine, the scheduler keeps its default.
    fn select_cpu_candidacy(&self, affinity: &CpuAffinity);

    /// Clear per CPU TX load balancing run counters.
    fn clear_tx_cpu_counters(&self) {}

    /// Dump wake lock statistics to the driver log.
    fn dump_wake_locks(&self) {}

    /// Host clock in microseconds.
    fn now_usec(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

bitflags! {
    /// Optional attribute families.
    ///
    /// Only the attributes of enabled families are registered.
    pub struct Features: u32 {
        /// `power_stats`
        const POWER_STATS = 1;

        /// `lbtxp`
        const LB_TXP = 1 << 1;

        /// `lbrxp`, `lbrxp_stop_thr`, `lbrxp_strt_thr`
        const LB_RXP = 1 << 2;

        /// `candidacy_override`, CPU masks and CPU overrides
        const LB_CPUS = 1 << 3;

        /// `logdump_periodic_flush`, `logdump_ecntr_enable`
        const LOG_DUMP = 1 << 4;

        /// `sssr_enab`, `fis_enab`
        const SSSR_DUMP = 1 << 5;

        /// `wklock_trace`
        const WAKELOCK_TRACE = 1 << 6;

        /// `mac_addr`
        const MAC_ADDR = 1 << 7;

        /// `memdump`
        const MEMDUMP = 1 << 8;

        /// `pm`
        const PM_CONTROL = 1 << 9;

        /// `hang_privcmd_err`
        const HANG_PRIVCMD = 1 << 10;

        /// Verbose trace ring endpoint
        const TRACE_VERBOSE = 1 << 11;

        /// Event counter ring endpoint
        const TRACE_ECOUNTERS = 1 << 12;

        /// Round trip time ring endpoint
        const TRACE_RTT = 1 << 13;

        /// `bad_ap_list`
        const BAD_AP_LIST = 1 << 14;

        const LOAD_BALANCE = Self::LB_TXP.bits | Self::LB_RXP.bits | Self::LB_CPUS.bits;

        const TRACE = Self::TRACE_VERBOSE.bits | Self::TRACE_ECOUNTERS.bits | Self::TRACE_RTT.bits;
    }
}

impl Default for Features {
    fn default() -> Self {
        Features::all()
    }
}

/// Read the CPUs the host can ever bring online.
///
/// This uses `devices/system/cpu/possible`, falling back to
/// `sysconf(_SC_NPROCESSORS_CONF)`.
pub fn host_cpus() -> CpuMask {
    let possible = Path::new(SYSFS_PATH).join("devices/system/cpu/possible");
    if let Some(mask) = fs::read_to_string(possible)
        .ok()
        .and_then(|s| s.parse::<CpuMask>().ok())
        .filter(|m| !m.is_empty())
    {
        return mask;
    }
    let count = sysconf(SysconfVar::_NPROCESSORS_CONF)
        .ok()
        .flatten()
        .and_then(|n| usize::try_from(n).ok())
        .filter(|n| *n > 0)
        .unwrap_or(1);
    CpuMask::first(count)
}

/// Tunables of one driver instance
#[derive(Debug, Clone)]
pub struct Config {
    /// Attribute reads are bounded to `page_size - 1` bytes
    pub page_size: usize,

    /// Firmware/nvram path writes this long or longer are rejected
    pub path_max: usize,

    /// Bytes per posted RX buffer
    pub rx_entry_size: u64,

    /// Entries per RX completion ring
    pub rx_ring_max_entries: u64,

    /// See [`crate::power`]
    pub pwrstats_jitter_usec: u64,

    /// CPUs masks and overrides are validated against
    pub host_cpus: CpuMask,

    pub features: Features,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_size: PAGE_SIZE,
            path_max: PATH_MAX,
            rx_entry_size: 2048,
            rx_ring_max_entries: 1024,
            pwrstats_jitter_usec: DEFAULT_JITTER_USEC,
            host_cpus: host_cpus(),
            features: Features::default(),
        }
    }
}

impl Config {
    pub fn with_features(mut self, features: Features) -> Self {
        self.features = features;
        self
    }

    pub fn with_host_cpus(mut self, cpus: CpuMask) -> Self {
        self.host_cpus = cpus;
        self
    }

    pub fn with_rx_ring(mut self, entry_size: u64, max_entries: u64) -> Self {
        self.rx_entry_size = entry_size;
        self.rx_ring_max_entries = max_entries;
        self
    }

    pub fn with_pwrstats_jitter(mut self, usec: u64) -> Self {
        self.pwrstats_jitter_usec = usec;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }
}

/// Module parameter style strings and values
#[derive(Debug, Default)]
pub struct Params {
    pub firmware_path: String,
    pub nvram_path: String,
    pub mac_addr: [u8; 6],
    /// BSSIDs of access points to avoid, in the order they were added
    pub bad_ap_list: Vec<[u8; 6]>,
}

/// Plain on/off switches
#[derive(Debug, Default)]
pub struct Flags {
    pub ecounters: AtomicBool,
    pub logdump_periodic_flush: AtomicBool,
    pub logdump_ecntr: AtomicBool,
    pub sssr_enab: AtomicBool,
    pub fis_enab: AtomicBool,
    pub wklock_trace: AtomicBool,
    pub hang_privcmd_err: AtomicBool,
}

/// PM mode has not been written yet
pub const PM_UNSET: u32 = 0xFF;

/// State of one driver instance, passed to every attribute handler.
pub struct ControlContext {
    config: Config,
    core: Box<dyn DriverCore>,
    params: Mutex<Params>,
    flags: Flags,
    memdump: AtomicU32,
    pm_mode: AtomicU32,
    power: Mutex<PowerStats>,
    lb: LoadBalance,
}

impl std::fmt::Debug for ControlContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlContext")
            .field("config", &self.config)
            .field("params", &self.params)
            .field("flags", &self.flags)
            .field("lb", &self.lb)
            .finish_non_exhaustive()
    }
}

impl ControlContext {
    pub fn new(config: Config, core: Box<dyn DriverCore>) -> Self {
        let limits = ThresholdLimits {
            entry_size: config.rx_entry_size,
            max_entries: config.rx_ring_max_entries,
        };
        let lb = LoadBalance::new(limits, config.host_cpus.clone());
        let power = PowerStats::new(config.pwrstats_jitter_usec);
        let flags = Flags::default();
        // Reports hang on private command errors unless told otherwise.
        flags.hang_privcmd_err.store(true, Ordering::SeqCst);
        Self {
            config,
            core,
            params: Mutex::new(Params::default()),
            flags,
            memdump: AtomicU32::new(0),
            pm_mode: AtomicU32::new(PM_UNSET),
            power: Mutex::new(power),
            lb,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn core(&self) -> &dyn DriverCore {
        self.core.as_ref()
    }

    pub fn params(&self) -> MutexGuard<'_, Params> {
        self.params.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn flags(&self) -> &Flags {
        &self.flags
    }

    pub fn memdump(&self) -> &AtomicU32 {
        &self.memdump
    }

    pub fn pm_mode(&self) -> &AtomicU32 {
        &self.pm_mode
    }

    pub fn power(&self) -> MutexGuard<'_, PowerStats> {
        self.power.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lb(&self) -> &LoadBalance {
        &self.lb
    }

    /// Query the firmware and fold the snapshot into the power statistics.
    ///
    /// The returned guard holds the merged state, so a render of it is
    /// consistent.
    ///
    /// # Errors
    ///
    /// - [`crate::error::Error::DeviceUnavailable`] if the query fails. The
    ///   statistics are left untouched.
    pub fn refresh_power(&self) -> Result<MutexGuard<'_, PowerStats>> {
        let snapshot = self.core.query_power_stats().map_err(|e| {
            log::error!("power stats query failed: {e}");
            crate::error::Error::DeviceUnavailable(e)
        })?;
        let now = self.core.now_usec();
        let mut power = self.power();
        power.refresh(&snapshot, now);
        Ok(power)
    }
}


#[cfg(test)]
mod tests {
    use super::{testing::*, *};
    use crate::{error::Error, power::PowerState};
    use anyhow::Result;

    #[test]
    fn refresh_power_merges() -> Result<()> {
        let core = MockCore::new().with_now(10_000_000);
        let ctx = context(&core);
        core.push_snapshot(Ok(PowerSnapshot::new(2_000_000).with(PowerState::L0, 4, 40)));
        core.push_snapshot(Ok(PowerSnapshot::new(3_000_000).with(PowerState::L0, 6, 70)));
        drop(ctx.refresh_power()?);
        let power = ctx.refresh_power()?;
        assert_eq!(power.accumulated(PowerState::L0).count, 6);
        assert_eq!(power.accumulated(PowerState::L0).duration_usec, 70);
        assert_eq!(power.clock_correction(), 8_000_000);
        Ok(())
    }

    #[test]
    fn refresh_power_failure_leaves_state() {
        let core = MockCore::new();
        let ctx = context(&core);
        assert!(matches!(
            ctx.refresh_power(),
            Err(Error::DeviceUnavailable(_))
        ));
        assert_eq!(ctx.power().accumulated(PowerState::Awake).count, 0);
    }

    #[test]
    fn features_default_all() {
        let config = Config::default();
        assert!(config.features.contains(Features::LOAD_BALANCE | Features::TRACE));
        assert!(!config.host_cpus.is_empty());
    }
}
