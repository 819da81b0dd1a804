//! The driver's sysfs attributes.
//!
//! Each attribute is a small file under the driver's sysfs directory, read
//! and written by userspace one page at a time. This module provides the
//! machinery behind them, independent of how the host registers the files
//! with the kernel.
//!
//! # Implementation Details
//!
//! - [`attribute`] describes attributes and holds them in a [`Registry`].
//! - [`dispatch`] is the single entry point for every read and write.
//! - [`nodes`] is the driver's actual attribute set.
//!
//! Like the kernel's sysfs rules, reads return at most one page and
//! attributes may not be world-writable. See the [kernel documentation][1].
//!
//! # Stability
//!
//! Attribute names and output formats are parsed by vendor tooling, and
//! must not change.
//!
//! [1]: https://www.kernel.org/doc/Documentation/filesystems/sysfs.txt

pub mod attribute;
pub mod dispatch;
pub mod nodes;

pub use attribute::{AttributeDescriptor, Mode, Registry, Show, Store};
pub use dispatch::Dispatcher;
