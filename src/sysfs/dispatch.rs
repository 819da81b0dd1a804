//! The show/store trampoline.
//!
//! Every read and write of every attribute goes through [`Dispatcher`],
//! which resolves the name, checks the direction is allowed, serializes
//! calls to the same attribute and runs the handler.
use super::attribute::{Entry, Registry};
use crate::{
    driver::ControlContext,
    error::{Access, Error, Result},
    util::Page,
};
use std::sync::{MutexGuard, PoisonError};

/// Dispatches attribute accesses through a [`Registry`]
#[derive(Debug)]
pub struct Dispatcher {
    registry: Registry,
}

impl Dispatcher {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn entry(&self, name: &str) -> Result<&Entry> {
        self.registry
            .get(name)
            .ok_or_else(|| Error::NotFound(name.into()))
    }

    fn serialize(entry: &Entry) -> MutexGuard<'_, ()> {
        entry.serial.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read attribute `name`.
    ///
    /// The text is at most one page, `page_size - 1` bytes.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if there is no such attribute
    /// - [`Error::PermissionDenied`] if it can't be read
    /// - Whatever the handler fails with
    pub fn read(&self, name: &str, ctx: &ControlContext) -> Result<String> {
        let entry = self.entry(name)?;
        let show = match entry.desc.show_handler() {
            Some(show) if entry.desc.mode().readable() => show,
            _ => return Err(Error::PermissionDenied(name.into(), Access::Read)),
        };
        let _serial = Self::serialize(entry);
        let mut page = Page::new(ctx.config().page_size.saturating_sub(1));
        show.show(ctx, &mut page)?;
        log::trace!("read {name}: {} bytes", page.len());
        Ok(page.into_string())
    }

    /// Write `input` to attribute `name`.
    ///
    /// Returns the number of bytes consumed, all of `input` on success.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if there is no such attribute
    /// - [`Error::PermissionDenied`] if it can't be written
    /// - [`Error::InvalidArgument`] if the handler rejects `input`
    pub fn write(&self, name: &str, ctx: &ControlContext, input: &[u8]) -> Result<usize> {
        let entry = self.entry(name)?;
        let store = match entry.desc.store_handler() {
            Some(store) if entry.desc.mode().writable() => store,
            _ => return Err(Error::PermissionDenied(name.into(), Access::Write)),
        };
        let _serial = Self::serialize(entry);
        store.store(ctx, input).map_err(|e| {
            log::warn!("write to {name} rejected: {e}");
            e
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        driver::testing::{context, MockCore},
        sysfs::attribute::{AttributeDescriptor, Mode},
        util::parse_leading_u64,
    };
    use anyhow::Result;
    use std::{
        fmt::Write,
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc,
        },
        thread,
        time::Duration,
    };

    fn dispatcher(value: Arc<AtomicU64>) -> Dispatcher {
        let mut reg = Registry::new();
        let shown = value.clone();
        reg.register(
            AttributeDescriptor::new("value", Mode::RW)
                .show(move |_: &ControlContext, page: &mut Page| -> super::Result<()> {
                    writeln!(page, "{}", shown.load(Ordering::SeqCst))
                        .map_err(|_| Error::invalid("fmt"))
                })
                .store(move |_: &ControlContext, input: &[u8]| -> super::Result<usize> {
                    value.store(parse_leading_u64(input)?, Ordering::SeqCst);
                    Ok(input.len())
                }),
        )
        .unwrap();
        reg.register(
            AttributeDescriptor::new("long", Mode::RO).show(
                |_: &ControlContext, page: &mut Page| -> super::Result<()> {
                    for _ in 0..10_000 {
                        page.write_str("x").map_err(|_| Error::invalid("fmt"))?;
                    }
                    Ok(())
                },
            ),
        )
        .unwrap();
        reg.register(
            AttributeDescriptor::new("masked", Mode::RO)
                .store(|_: &ControlContext, input: &[u8]| -> super::Result<usize> {
                    Ok(input.len())
                }),
        )
        .unwrap();
        Dispatcher::new(reg)
    }

    #[test]
    fn roundtrip() -> Result<()> {
        let core = MockCore::new();
        let ctx = context(&core);
        let value = Arc::new(AtomicU64::new(0));
        let d = dispatcher(value.clone());
        assert_eq!(d.write("value", &ctx, b"17\n")?, 3);
        assert_eq!(value.load(Ordering::SeqCst), 17);
        assert_eq!(d.read("value", &ctx)?, "17\n");
        Ok(())
    }

    #[test]
    fn errors() {
        let core = MockCore::new();
        let ctx = context(&core);
        let d = dispatcher(Arc::new(AtomicU64::new(3)));
        assert!(matches!(d.read("nonexistent", &ctx), Err(Error::NotFound(_))));
        assert!(matches!(
            d.write("nonexistent", &ctx, b"1"),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            d.write("long", &ctx, b"1"),
            Err(Error::PermissionDenied(_, Access::Write))
        ));
        // has a store handler but no write bit
        assert!(matches!(
            d.write("masked", &ctx, b"1"),
            Err(Error::PermissionDenied(_, Access::Write))
        ));
        assert!(matches!(
            d.read("masked", &ctx),
            Err(Error::PermissionDenied(_, Access::Read))
        ));
        assert!(matches!(
            d.write("value", &ctx, b"nope"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn page_bounded() -> Result<()> {
        let core = MockCore::new();
        let ctx = context(&core);
        let d = dispatcher(Arc::new(AtomicU64::new(0)));
        assert_eq!(d.read("long", &ctx)?.len(), ctx.config().page_size - 1);
        Ok(())
    }

    #[test]
    fn writes_to_one_attribute_are_serialized() -> Result<()> {
        const THREADS: u64 = 16;
        let core = MockCore::new();
        let ctx = context(&core);
        let count = Arc::new(AtomicU64::new(0));
        let mut reg = Registry::new();
        let counter = count.clone();
        reg.register(AttributeDescriptor::new("count", Mode::RW).store(
            move |_: &ControlContext, input: &[u8]| -> super::Result<usize> {
                // Unsynchronized read-modify-write, racy without the dispatcher lock
                let seen = counter.load(Ordering::SeqCst);
                thread::sleep(Duration::from_millis(1));
                counter.store(seen + 1, Ordering::SeqCst);
                Ok(input.len())
            },
        ))?;
        let d = Dispatcher::new(reg);
        thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| d.write("count", &ctx, b"1"));
            }
        });
        assert_eq!(count.load(Ordering::SeqCst), THREADS);
        Ok(())
    }
}
