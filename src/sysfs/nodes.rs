//! The driver's attributes.
//!
//! [`register_defaults`] fills a [`Registry`] with every attribute whose
//! family is enabled in [`Features`].
//!
//! Output formats are fixed, since userspace tooling parses them. On/off
//! switches print the value followed by a space and newline, `"1 \n"`.
use super::attribute::{AttributeDescriptor, Mode, Registry};
use crate::{
    driver::{ControlContext, Features, Flags, FwFeature, Params, PM_UNSET},
    error::{text::*, Error, Result},
    lb::{CpuMask, Direction, MaskKind},
    util::{
        first_token,
        parse_leading_i64,
        parse_leading_u32,
        parse_leading_u64,
        parse_onoff,
        show,
        Page,
    },
};
use std::{
    fmt,
    str,
    sync::atomic::{AtomicBool, Ordering},
};

/// Highest PM mode `pm` accepts
const PM_MAX: u64 = 2;

/// Register the default attribute set for `features`.
///
/// `firmware_path`, `nvram_path` and `ecounters` are always present.
///
/// # Errors
///
/// - If `registry` already holds one of the names
pub fn register_defaults(registry: &mut Registry, features: Features) -> Result<()> {
    let mut attrs = vec![
        path("firmware_path", |p| &mut p.firmware_path),
        path("nvram_path", |p| &mut p.nvram_path),
        ecounters(),
    ];
    if features.contains(Features::POWER_STATS) {
        attrs.push(power_stats());
    }
    if features.contains(Features::LOG_DUMP) {
        attrs.push(toggle("logdump_periodic_flush", |f| &f.logdump_periodic_flush));
        attrs.push(toggle("logdump_ecntr_enable", |f| &f.logdump_ecntr));
    }
    if features.contains(Features::SSSR_DUMP) {
        attrs.push(toggle("sssr_enab", |f| &f.sssr_enab));
        attrs.push(toggle("fis_enab", |f| &f.fis_enab));
    }
    if features.contains(Features::WAKELOCK_TRACE) {
        attrs.push(wklock_trace());
    }
    if features.contains(Features::LB_TXP) {
        attrs.push(lbtxp());
    }
    if features.contains(Features::LB_RXP) {
        attrs.push(lbrxp());
        attrs.push(threshold("lbrxp_stop_thr", Threshold::Stop));
        attrs.push(threshold("lbrxp_strt_thr", Threshold::Start));
    }
    if features.contains(Features::LB_CPUS) {
        attrs.push(candidacy_override());
        attrs.push(cpu_mask("primary_mask", MaskKind::Primary));
        attrs.push(cpu_mask("secondary_mask", MaskKind::Secondary));
        attrs.push(cpu("rx_cpu", Direction::Rx));
        attrs.push(cpu("tx_cpu", Direction::Tx));
    }
    if features.contains(Features::MAC_ADDR) {
        attrs.push(mac_addr());
    }
    if features.contains(Features::BAD_AP_LIST) {
        attrs.push(bad_ap_list());
    }
    if features.contains(Features::MEMDUMP) {
        attrs.push(memdump());
    }
    if features.contains(Features::PM_CONTROL) {
        attrs.push(pm());
    }
    if features.contains(Features::HANG_PRIVCMD) {
        attrs.push(hang_privcmd_err());
    }
    log::debug!("registering {} attributes for {features:?}", attrs.len());
    for attr in attrs {
        registry.register(attr)?;
    }
    Ok(())
}

fn utf8(input: &[u8]) -> Result<&str> {
    str::from_utf8(input).map_err(|_| Error::invalid(format!("`{}` is not UTF-8", show(input))))
}

/// A module parameter path, stored as the first token written.
fn path(name: &'static str, field: fn(&mut Params) -> &mut String) -> AttributeDescriptor {
    AttributeDescriptor::new(name, Mode::RW)
        .show(move |ctx: &ControlContext, page: &mut Page| -> Result<()> {
            let mut params = ctx.params();
            page.emit(format_args!("{}\n", field(&mut params)));
            Ok(())
        })
        .store(move |ctx: &ControlContext, input: &[u8]| -> Result<usize> {
            if input.len() >= ctx.config().path_max {
                return Err(Error::invalid(TOO_LONG));
            }
            let token = first_token(input);
            if token.is_empty() {
                return Err(Error::invalid(EMPTY));
            }
            let token = utf8(token)?;
            *field(&mut ctx.params()) = token.into();
            log::info!("{name} = {token}");
            Ok(input.len())
        })
}

fn show_onoff(page: &mut Page, on: bool) {
    page.emit(format_args!("{} \n", u8::from(on)));
}

/// A plain `0`/`1` switch
fn toggle(name: &'static str, flag: fn(&Flags) -> &AtomicBool) -> AttributeDescriptor {
    AttributeDescriptor::new(name, Mode::RW)
        .show(move |ctx: &ControlContext, page: &mut Page| -> Result<()> {
            show_onoff(page, flag(ctx.flags()).load(Ordering::SeqCst));
            Ok(())
        })
        .store(move |ctx: &ControlContext, input: &[u8]| -> Result<usize> {
            let on = parse_onoff(input)?;
            flag(ctx.flags()).store(on, Ordering::SeqCst);
            log::debug!("{name} = {}", u8::from(on));
            Ok(input.len())
        })
}

/// Firmware event counters.
///
/// The firmware is only reconfigured when the value changes.
fn ecounters() -> AttributeDescriptor {
    AttributeDescriptor::new("ecounters", Mode::RW)
        .show(|ctx: &ControlContext, page: &mut Page| -> Result<()> {
            show_onoff(page, ctx.flags().ecounters.load(Ordering::SeqCst));
            Ok(())
        })
        .store(|ctx: &ControlContext, input: &[u8]| -> Result<usize> {
            if !ctx.core().firmware_supports(FwFeature::Ecounters) {
                return Err(Error::Unsupported("ecounters"));
            }
            let on = parse_onoff(input)?;
            let flag = &ctx.flags().ecounters;
            if flag.load(Ordering::SeqCst) == on {
                log::debug!("ecounters already {}", u8::from(on));
                return Ok(input.len());
            }
            ctx.core()
                .configure_ecounters(on)
                .map_err(Error::DeviceUnavailable)?;
            flag.store(on, Ordering::SeqCst);
            log::info!("ecounters {}", if on { "enabled" } else { "disabled" });
            Ok(input.len())
        })
}

fn power_stats() -> AttributeDescriptor {
    AttributeDescriptor::new("power_stats", Mode::RO).show(
        |ctx: &ControlContext, page: &mut Page| -> Result<()> {
            let power = ctx.refresh_power()?;
            // Page writes only truncate.
            let _ = power.render(page);
            Ok(())
        },
    )
}

/// Reading dumps wake lock statistics to the log, writing switches tracing.
fn wklock_trace() -> AttributeDescriptor {
    AttributeDescriptor::new("wklock_trace", Mode::RW)
        .show(|ctx: &ControlContext, page: &mut Page| -> Result<()> {
            page.emit(format_args!("\n"));
            ctx.core().dump_wake_locks();
            Ok(())
        })
        .store(|ctx: &ControlContext, input: &[u8]| -> Result<usize> {
            let on = parse_onoff(input)?;
            ctx.flags().wklock_trace.store(on, Ordering::SeqCst);
            log::info!("wake lock trace {}", if on { "enabled" } else { "disabled" });
            Ok(input.len())
        })
}

fn lbtxp() -> AttributeDescriptor {
    AttributeDescriptor::new("lbtxp", Mode::RW)
        .show(|ctx: &ControlContext, page: &mut Page| -> Result<()> {
            show_onoff(page, ctx.lb().txp_active());
            Ok(())
        })
        .store(|ctx: &ControlContext, input: &[u8]| -> Result<usize> {
            let on = parse_onoff(input)?;
            ctx.lb().set_txp_active(on, ctx.core());
            Ok(input.len())
        })
}

fn lbrxp() -> AttributeDescriptor {
    AttributeDescriptor::new("lbrxp", Mode::RW)
        .show(|ctx: &ControlContext, page: &mut Page| -> Result<()> {
            show_onoff(page, ctx.lb().rxp_active());
            Ok(())
        })
        .store(|ctx: &ControlContext, input: &[u8]| -> Result<usize> {
            ctx.lb().set_rxp_active(parse_onoff(input)?);
            Ok(input.len())
        })
}

#[derive(Debug, Clone, Copy)]
enum Threshold {
    Stop,
    Start,
}

fn threshold(name: &'static str, which: Threshold) -> AttributeDescriptor {
    AttributeDescriptor::new(name, Mode::RW)
        .show(move |ctx: &ControlContext, page: &mut Page| -> Result<()> {
            let thr = ctx.lb().thresholds();
            let v = match which {
                Threshold::Stop => thr.stop(),
                Threshold::Start => thr.start(),
            };
            page.emit(format_args!("{v} \n"));
            Ok(())
        })
        .store(move |ctx: &ControlContext, input: &[u8]| -> Result<usize> {
            let v = parse_leading_u32(input)?;
            match which {
                Threshold::Stop => ctx.lb().set_stop(v)?,
                Threshold::Start => ctx.lb().set_start(v)?,
            }
            Ok(input.len())
        })
}

fn candidacy_override() -> AttributeDescriptor {
    AttributeDescriptor::new("candidacy_override", Mode::RW)
        .show(|ctx: &ControlContext, page: &mut Page| -> Result<()> {
            page.emit(format_args!("{}\n", u8::from(ctx.lb().candidacy_override())));
            Ok(())
        })
        .store(|ctx: &ControlContext, input: &[u8]| -> Result<usize> {
            ctx.lb().set_candidacy_override(parse_leading_i64(input)? > 0);
            Ok(input.len())
        })
}

fn cpu_mask(name: &'static str, kind: MaskKind) -> AttributeDescriptor {
    AttributeDescriptor::new(name, Mode::RW)
        .show(move |ctx: &ControlContext, page: &mut Page| -> Result<()> {
            page.emit(format_args!("{}\n", ctx.lb().affinity().get(kind)));
            Ok(())
        })
        .store(move |ctx: &ControlContext, input: &[u8]| -> Result<usize> {
            let lb = ctx.lb();
            let mask = CpuMask::parse_bounded(utf8(first_token(input))?, lb.cpu_limit())?;
            lb.set_cpu_mask(kind, mask, ctx.core())?;
            Ok(input.len())
        })
}

fn cpu(name: &'static str, dir: Direction) -> AttributeDescriptor {
    AttributeDescriptor::new(name, Mode::RW)
        .show(move |ctx: &ControlContext, page: &mut Page| -> Result<()> {
            page.emit(format_args!("{}\n", ctx.lb().cpu(dir)));
            Ok(())
        })
        .store(move |ctx: &ControlContext, input: &[u8]| -> Result<usize> {
            ctx.lb().set_cpu(dir, parse_leading_u32(input)?)?;
            Ok(input.len())
        })
}

/// A MAC address, `xx:xx:xx:xx:xx:xx`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddr(pub [u8; 6]);

impl str::FromStr for MacAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::invalid(format!("invalid MAC address `{s}`"));
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in &mut octets {
            let part = parts.next().ok_or_else(bad)?;
            if part.is_empty() || part.len() > 2 {
                return Err(bad());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| bad())?;
        }
        if parts.next().is_some() {
            return Err(bad());
        }
        Ok(Self(octets))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

fn mac_addr() -> AttributeDescriptor {
    AttributeDescriptor::new("mac_addr", Mode::RW)
        .show(|ctx: &ControlContext, page: &mut Page| -> Result<()> {
            // No trailing newline, tooling reads it back as is.
            page.emit(format_args!("{}", MacAddr(ctx.params().mac_addr)));
            Ok(())
        })
        .store(|ctx: &ControlContext, input: &[u8]| -> Result<usize> {
            let mac: MacAddr = utf8(first_token(input))?.parse()?;
            ctx.params().mac_addr = mac.0;
            log::info!("MAC address set to {mac}");
            Ok(input.len())
        })
}

/// One `xx:xx:xx:xx:xx:xx` BSSID per line. A write adds every line it holds,
/// or none of them if any line is malformed.
fn bad_ap_list() -> AttributeDescriptor {
    AttributeDescriptor::new("bad_ap_list", Mode::RW)
        .show(|ctx: &ControlContext, page: &mut Page| -> Result<()> {
            for bssid in &ctx.params().bad_ap_list {
                page.emit(format_args!("{}\n", MacAddr(*bssid)));
            }
            Ok(())
        })
        .store(|ctx: &ControlContext, input: &[u8]| -> Result<usize> {
            let records = utf8(input)?
                .split('\n')
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::parse::<MacAddr>)
                .collect::<Result<Vec<MacAddr>>>()?;
            if records.is_empty() {
                return Err(Error::invalid(EMPTY));
            }
            let mut params = ctx.params();
            for MacAddr(bssid) in records {
                if !params.bad_ap_list.contains(&bssid) {
                    log::info!("bad AP {}", MacAddr(bssid));
                    params.bad_ap_list.push(bssid);
                }
            }
            Ok(input.len())
        })
}

fn memdump() -> AttributeDescriptor {
    AttributeDescriptor::new("memdump", Mode::RW)
        .show(|ctx: &ControlContext, page: &mut Page| -> Result<()> {
            page.emit(format_args!("{}\n", ctx.memdump().load(Ordering::SeqCst)));
            Ok(())
        })
        .store(|ctx: &ControlContext, input: &[u8]| -> Result<usize> {
            let v = parse_leading_u32(input)?;
            ctx.memdump().store(v, Ordering::SeqCst);
            log::info!("memdump mode {v}");
            Ok(input.len())
        })
}

fn pm() -> AttributeDescriptor {
    AttributeDescriptor::new("pm", Mode::RW)
        .show(|ctx: &ControlContext, page: &mut Page| -> Result<()> {
            match ctx.pm_mode().load(Ordering::SeqCst) {
                PM_UNSET => page.emit(format_args!("PM mode is not set\n")),
                v => page.emit(format_args!("{v}\n")),
            }
            Ok(())
        })
        .store(|ctx: &ControlContext, input: &[u8]| -> Result<usize> {
            let v = parse_leading_u64(input)?;
            if v > PM_MAX {
                return Err(Error::invalid(format!("PM mode {v} out of range")));
            }
            // Checked against PM_MAX above
            ctx.pm_mode().store(v as u32, Ordering::SeqCst);
            log::info!("PM mode {v}");
            Ok(input.len())
        })
}

fn hang_privcmd_err() -> AttributeDescriptor {
    AttributeDescriptor::new("hang_privcmd_err", Mode::RW)
        .show(|ctx: &ControlContext, page: &mut Page| -> Result<()> {
            let on = ctx.flags().hang_privcmd_err.load(Ordering::SeqCst);
            page.emit(format_args!("{}\n", u8::from(on)));
            Ok(())
        })
        .store(|ctx: &ControlContext, input: &[u8]| -> Result<usize> {
            let on = parse_leading_i64(input)? != 0;
            ctx.flags().hang_privcmd_err.store(on, Ordering::SeqCst);
            log::info!("report hang on private command error: {}", u8::from(on));
            Ok(input.len())
        })
}
