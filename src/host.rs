//! What a host embeds.
//!
//! [`ExportFs`] ties one driver instance to its attributes and trace files.
//! The host's virtual filesystem glue forwards `show`/`store` callbacks to
//! [`ExportFs::read`]/[`ExportFs::write`] and proc reads to a
//! [`TraceSession`], returning [`Error::errno`] on failure.
use crate::{
    driver::{Config, ControlContext, DriverCore},
    error::{Error, Result},
    procfs::{RingId, TraceEndpoints, TraceRing, TraceSession},
    sysfs::{nodes, Dispatcher, Registry},
};
use std::sync::Arc;

/// The exported control surface of one driver instance
#[derive(Debug)]
pub struct ExportFs {
    ctx: ControlContext,
    attrs: Dispatcher,
    traces: TraceEndpoints,
}

impl ExportFs {
    /// Control surface over `core`, with the attributes `config` enables.
    ///
    /// No trace files exist until [`ExportFs::create_trace`].
    pub fn new(config: Config, core: Box<dyn DriverCore>) -> Result<Self> {
        let features = config.features;
        let mut registry = Registry::new();
        nodes::register_defaults(&mut registry, features)?;
        log::info!("exporting {} attributes", registry.len());
        Ok(Self {
            ctx: ControlContext::new(config, core),
            attrs: Dispatcher::new(registry),
            traces: TraceEndpoints::new(features),
        })
    }

    pub fn context(&self) -> &ControlContext {
        &self.ctx
    }

    /// Attribute names, sorted
    pub fn names(&self) -> Vec<&str> {
        self.attrs.registry().names()
    }

    /// See [`Dispatcher::read`]
    pub fn read(&self, name: &str) -> Result<String> {
        self.attrs.read(name, &self.ctx)
    }

    /// See [`Dispatcher::write`]
    pub fn write(&self, name: &str, input: &[u8]) -> Result<usize> {
        self.attrs.write(name, &self.ctx, input)
    }

    /// See [`TraceEndpoints::create`]
    pub fn create_trace(&mut self, id: RingId, ring: Arc<dyn TraceRing>) -> Result<()> {
        self.traces.create(id, ring)
    }

    /// See [`TraceEndpoints::destroy`]
    pub fn destroy_trace(&mut self, id: RingId) -> bool {
        self.traces.destroy(id)
    }

    /// Open a trace file by its proc name, ie `wifi_trace`.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if there is no such file
    pub fn open_trace(&self, proc_name: &str) -> Result<TraceSession> {
        let id = RingId::ALL
            .into_iter()
            .find(|id| id.proc_name() == proc_name)
            .ok_or_else(|| Error::NotFound(proc_name.into()))?;
        self.traces.open(id)
    }
}

impl Drop for ExportFs {
    fn drop(&mut self) {
        self.traces.destroy_all();
    }
}
