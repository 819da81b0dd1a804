//! Control surface of a WiFi host driver
//!
//! The driver exposes its runtime knobs as sysfs attributes and its firmware
//! trace rings as proc files. This crate implements everything behind those
//! files:
//!
//! - [`sysfs`], named attributes and the show/store dispatcher
//! - [`power`], the cumulative power statistics behind `power_stats`
//! - [`lb`], RX/TX load balancing thresholds, CPU masks and overrides
//! - [`procfs`], streamed reads of trace rings
//!
//! The rest of the driver, firmware, bus and scheduler, is reached through
//! [`driver::DriverCore`]. [`host::ExportFs`] puts it all together.
//!
//! # Implementation details
//!
//! Registering the files with the kernel is left to the host, this crate
//! never touches `/sys` or `/proc` itself, except reading the possible CPUs
//! for the default configuration.
//!
//! Attribute names and output formats are relied upon by vendor tooling, and
//! are kept as they are.
#![doc(html_root_url = "https://docs.rs/wifi-exportfs/0.1.0")]

pub mod driver;
pub mod error;
pub mod host;
pub mod lb;
pub mod power;
pub mod procfs;
pub mod sysfs;
pub mod util;
