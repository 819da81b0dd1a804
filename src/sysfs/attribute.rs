//! Named attributes and the registry holding them.
//!
//! An attribute is a name, permission bits, and up to two handlers: [`Show`]
//! to render it and [`Store`] to parse a write. Closures of the right shape
//! implement both traits, so most attributes are a couple of lines.
use crate::{
    driver::ControlContext,
    error::{text::*, Error, Result},
    util::Page,
};
use bitflags::bitflags;
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
};

bitflags! {
    /// Attribute permission bits, as in `chmod(1)`.
    pub struct Mode: u16 {
        const OWNER_READ = 0o400;
        const OWNER_WRITE = 0o200;
        const GROUP_READ = 0o040;
        const GROUP_WRITE = 0o020;
        const OTHER_READ = 0o004;
        const OTHER_WRITE = 0o002;

        const READ = Self::OWNER_READ.bits | Self::GROUP_READ.bits | Self::OTHER_READ.bits;
        const WRITE = Self::OWNER_WRITE.bits | Self::GROUP_WRITE.bits | Self::OTHER_WRITE.bits;

        /// `0660`, the usual driver attribute
        const RW = Self::OWNER_READ.bits
            | Self::OWNER_WRITE.bits
            | Self::GROUP_READ.bits
            | Self::GROUP_WRITE.bits;

        /// `0440`
        const RO = Self::OWNER_READ.bits | Self::GROUP_READ.bits;
    }
}

impl Mode {
    pub fn readable(self) -> bool {
        self.intersects(Mode::READ)
    }

    pub fn writable(self) -> bool {
        self.intersects(Mode::WRITE)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04o}", self.bits())
    }
}

/// Renders an attribute.
pub trait Show: Send + Sync {
    /// Write the attribute text into `page`.
    ///
    /// Anything past the end of the page is dropped.
    fn show(&self, ctx: &ControlContext, page: &mut Page) -> Result<()>;
}

impl<F> Show for F
where
    F: Fn(&ControlContext, &mut Page) -> Result<()> + Send + Sync,
{
    fn show(&self, ctx: &ControlContext, page: &mut Page) -> Result<()> {
        self(ctx, page)
    }
}

/// Parses a write to an attribute.
pub trait Store: Send + Sync {
    /// Apply `input`, returning how many bytes were consumed.
    ///
    /// Only the leading token of `input` needs to be meaningful, trailing
    /// bytes such as a newline are accepted.
    fn store(&self, ctx: &ControlContext, input: &[u8]) -> Result<usize>;
}

impl<F> Store for F
where
    F: Fn(&ControlContext, &[u8]) -> Result<usize> + Send + Sync,
{
    fn store(&self, ctx: &ControlContext, input: &[u8]) -> Result<usize> {
        self(ctx, input)
    }
}

/// Describes one attribute
#[derive(Clone)]
pub struct AttributeDescriptor {
    name: String,
    mode: Mode,
    show: Option<Arc<dyn Show>>,
    store: Option<Arc<dyn Store>>,
}

impl fmt::Debug for AttributeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributeDescriptor")
            .field("name", &self.name)
            .field("mode", &format_args!("{}", self.mode))
            .field("show", &self.show.is_some())
            .field("store", &self.store.is_some())
            .finish()
    }
}

impl AttributeDescriptor {
    /// New attribute without handlers
    pub fn new(name: impl Into<String>, mode: Mode) -> Self {
        Self {
            name: name.into(),
            mode,
            show: None,
            store: None,
        }
    }

    /// Attribute with one handler for both directions
    pub fn with_handler<H>(name: impl Into<String>, mode: Mode, handler: H) -> Self
    where
        H: Show + Store + 'static,
    {
        let handler = Arc::new(handler);
        Self {
            name: name.into(),
            mode,
            show: Some(handler.clone()),
            store: Some(handler),
        }
    }

    pub fn show(mut self, show: impl Show + 'static) -> Self {
        self.show = Some(Arc::new(show));
        self
    }

    pub fn store(mut self, store: impl Store + 'static) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Whether reads are allowed: a show handler and a read bit.
    pub fn readable(&self) -> bool {
        self.show.is_some() && self.mode.readable()
    }

    /// Whether writes are allowed: a store handler and a write bit.
    pub fn writable(&self) -> bool {
        self.store.is_some() && self.mode.writable()
    }

    pub(crate) fn show_handler(&self) -> Option<&dyn Show> {
        self.show.as_deref()
    }

    pub(crate) fn store_handler(&self) -> Option<&dyn Store> {
        self.store.as_deref()
    }

    fn validate(&self) -> Result<()> {
        if self.show.is_none() && self.store.is_none() {
            return Err(Error::InvalidDescriptor(self.name.clone(), NO_HANDLERS));
        }
        if self.mode.contains(Mode::OTHER_WRITE) {
            return Err(Error::InvalidDescriptor(self.name.clone(), WORLD_WRITABLE));
        }
        Ok(())
    }
}

/// A registered attribute.
///
/// The lock serializes handler calls on this one attribute.
#[derive(Debug)]
pub(crate) struct Entry {
    pub(crate) desc: AttributeDescriptor,
    pub(crate) serial: Mutex<()>,
}

/// Name to attribute map
#[derive(Debug, Default)]
pub struct Registry {
    attrs: HashMap<String, Entry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an attribute.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateName`] if `desc`s name is taken
    /// - [`Error::InvalidDescriptor`] if `desc` has no handlers, or is world
    ///   writable
    pub fn register(&mut self, desc: AttributeDescriptor) -> Result<()> {
        desc.validate()?;
        if self.attrs.contains_key(desc.name()) {
            return Err(Error::DuplicateName(desc.name));
        }
        log::trace!("registered attribute {} ({})", desc.name, desc.mode);
        self.attrs.insert(
            desc.name.clone(),
            Entry {
                desc,
                serial: Mutex::new(()),
            },
        );
        Ok(())
    }

    pub(crate) fn get(&self, name: &str) -> Option<&Entry> {
        self.attrs.get(name)
    }

    pub fn descriptor(&self, name: &str) -> Option<&AttributeDescriptor> {
        self.get(name).map(|e| &e.desc)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.attrs.contains_key(name)
    }

    /// Names of every registered attribute, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut v: Vec<&str> = self.attrs.keys().map(String::as_str).collect();
        v.sort_unstable();
        v
    }

    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write;

    fn hello(_: &ControlContext, page: &mut Page) -> Result<()> {
        writeln!(page, "hello").map_err(|_| Error::invalid("fmt"))
    }

    #[test]
    fn duplicate() {
        let mut reg = Registry::new();
        reg.register(AttributeDescriptor::new("a", Mode::RO).show(hello))
            .unwrap();
        assert!(matches!(
            reg.register(AttributeDescriptor::new("a", Mode::RO).show(hello)),
            Err(Error::DuplicateName(n)) if n == "a"
        ));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn invalid_descriptors() {
        let mut reg = Registry::new();
        assert!(matches!(
            reg.register(AttributeDescriptor::new("none", Mode::RW)),
            Err(Error::InvalidDescriptor(..))
        ));
        assert!(matches!(
            reg.register(AttributeDescriptor::new("w", Mode::all()).show(hello)),
            Err(Error::InvalidDescriptor(..))
        ));
        assert!(reg.is_empty());
    }

    #[test]
    fn capabilities() {
        let ro = AttributeDescriptor::new("ro", Mode::RW).show(hello);
        assert!(ro.readable());
        assert!(!ro.writable());
        let wo = AttributeDescriptor::new("wo", Mode::RO)
            .store(|_: &ControlContext, i: &[u8]| -> Result<usize> { Ok(i.len()) });
        assert!(!wo.readable());
        assert!(!wo.writable());
        assert_eq!(Mode::RW.to_string(), "0660");
    }

    #[test]
    fn names_sorted() {
        let mut reg = Registry::new();
        for n in ["b", "c", "a"] {
            reg.register(AttributeDescriptor::new(n, Mode::RO).show(hello))
                .unwrap();
        }
        assert_eq!(reg.names(), vec!["a", "b", "c"]);
    }
}
