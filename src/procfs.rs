//! Trace ring export through `/proc`.
//!
//! The firmware logs into debug rings owned by the driver core. Each ring can
//! be bound to a read-only proc file, see [`RingId`], which userspace reads
//! like any streamed file: repeatedly, until a read returns nothing.
//!
//! A [`TraceSession`] is one open of such a file. On its first read it asks
//! the ring for a formatted window, and then hands that window out in caller
//! sized pieces.
use crate::{
    driver::Features,
    error::{Error, Result},
    sysfs::Mode,
};
use std::{
    collections::{HashMap, VecDeque},
    io,
    sync::{Arc, Mutex, PoisonError},
};

/// A ring that can be exported.
pub trait TraceRing: Send + Sync {
    /// Format the ring's current contents.
    ///
    /// Returns [`None`] when the ring has nothing formatted yet.
    fn format(&self) -> Option<Vec<u8>>;
}

/// Result of [`TraceSession::read_into`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// Bytes copied to the caller, `0` meaning the session is exhausted.
    Copied(usize),

    /// The ring had no data. Try again later.
    NotReady,
}

/// One read session over a [`TraceRing`]
pub struct TraceSession {
    ring: Arc<dyn TraceRing>,
    window: Option<Vec<u8>>,
    pos: usize,
}

impl std::fmt::Debug for TraceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceSession")
            .field("window", &self.window.as_ref().map(Vec::len))
            .field("pos", &self.pos)
            .finish_non_exhaustive()
    }
}

impl TraceSession {
    pub fn new(ring: Arc<dyn TraceRing>) -> Self {
        Self {
            ring,
            window: None,
            pos: 0,
        }
    }

    /// Bytes handed out so far
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Copy up to `max_len` of the next bytes to `out`.
    ///
    /// A `max_len` of zero copies nothing and never touches the ring.
    ///
    /// # Errors
    ///
    /// - [`Error::IoFault`] if writing to `out` fails. Bytes `out` accepted
    ///   before the failure are consumed, the rest are offered again on the
    ///   next read.
    pub fn read_into<W>(&mut self, out: &mut W, max_len: usize) -> Result<ReadStatus>
    where
        W: io::Write + ?Sized,
    {
        if max_len == 0 {
            return Ok(ReadStatus::Copied(0));
        }
        if self.window.is_none() {
            self.window = self.ring.format();
            match &self.window {
                Some(w) => log::trace!("trace window of {} bytes", w.len()),
                None => return Ok(ReadStatus::NotReady),
            }
        }
        let window = self.window.as_deref().unwrap_or_default();
        let remaining = &window[self.pos..];
        let n = remaining.len().min(max_len);
        if n == 0 {
            return Ok(ReadStatus::Copied(0));
        }
        let mut copied = 0;
        while copied < n {
            match out.write(&remaining[copied..n]) {
                Ok(0) => return Err(Error::IoFault(io::ErrorKind::WriteZero.into())),
                Ok(k) => {
                    copied += k;
                    self.pos += k;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::IoFault(e)),
            }
        }
        Ok(ReadStatus::Copied(n))
    }
}

/// A ring that isn't ready reads as empty.
impl io::Read for TraceSession {
    fn read(&mut self, mut buf: &mut [u8]) -> io::Result<usize> {
        let len = buf.len();
        match self.read_into(&mut buf, len) {
            Ok(ReadStatus::Copied(n)) => Ok(n),
            Ok(ReadStatus::NotReady) => Ok(0),
            Err(Error::IoFault(e)) => Err(e),
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
        }
    }
}

#[derive(Debug)]
struct Records {
    lines: VecDeque<String>,
    dropped: u64,
}

/// Fixed capacity in-memory log ring.
///
/// When full, the oldest record is overwritten.
#[derive(Debug)]
pub struct LogRing {
    capacity: usize,
    records: Mutex<Records>,
}

impl LogRing {
    /// New ring holding at most `capacity` records
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            records: Mutex::new(Records {
                lines: VecDeque::with_capacity(capacity),
                dropped: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Records> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, record: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        let mut records = self.lock();
        if records.lines.len() == self.capacity {
            records.lines.pop_front();
            records.dropped += 1;
        }
        records.lines.push_back(record.into());
    }

    pub fn len(&self) -> usize {
        self.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().lines.is_empty()
    }

    /// Records overwritten since creation
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }
}

impl TraceRing for LogRing {
    fn format(&self) -> Option<Vec<u8>> {
        let records = self.lock();
        if records.lines.is_empty() {
            return None;
        }
        let mut out = Vec::new();
        for line in &records.lines {
            out.extend_from_slice(line.as_bytes());
            out.push(b'\n');
        }
        Some(out)
    }
}

/// The rings with a proc file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RingId {
    /// Firmware verbose log
    Verbose,

    /// Periodic event counters
    Ecounters,

    /// Round trip time measurements
    Rtt,
}

impl RingId {
    pub const ALL: [RingId; 3] = [RingId::Verbose, RingId::Ecounters, RingId::Rtt];

    /// Proc file name, under `/proc`
    pub fn proc_name(self) -> &'static str {
        match self {
            RingId::Verbose => "wifi_trace",
            RingId::Ecounters => "wifi_ecounters",
            RingId::Rtt => "wifi_rtt",
        }
    }

    /// Proc files are owner readable only
    pub fn mode(self) -> Mode {
        Mode::OWNER_READ
    }

    fn feature(self) -> Features {
        match self {
            RingId::Verbose => Features::TRACE_VERBOSE,
            RingId::Ecounters => Features::TRACE_ECOUNTERS,
            RingId::Rtt => Features::TRACE_RTT,
        }
    }
}

/// The proc files currently bound to rings
#[derive(Default)]
pub struct TraceEndpoints {
    features: Features,
    rings: HashMap<RingId, Arc<dyn TraceRing>>,
}

impl std::fmt::Debug for TraceEndpoints {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceEndpoints")
            .field("features", &self.features)
            .field("rings", &self.rings.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TraceEndpoints {
    /// No endpoints, allowing those enabled in `features`
    pub fn new(features: Features) -> Self {
        Self {
            features,
            rings: HashMap::new(),
        }
    }

    /// Bind `ring` to the proc file of `id`.
    ///
    /// # Errors
    ///
    /// - [`Error::Unsupported`] if the endpoint is disabled
    /// - [`Error::DuplicateName`] if it's already bound
    pub fn create(&mut self, id: RingId, ring: Arc<dyn TraceRing>) -> Result<()> {
        if !self.features.contains(id.feature()) {
            log::error!("/proc/{} is disabled, not created", id.proc_name());
            return Err(Error::Unsupported(id.proc_name()));
        }
        if self.rings.contains_key(&id) {
            log::error!("failed to create /proc/{}, already exists", id.proc_name());
            return Err(Error::DuplicateName(id.proc_name().into()));
        }
        self.rings.insert(id, ring);
        log::info!("created /proc/{}", id.proc_name());
        Ok(())
    }

    /// Remove the proc file of `id`, returning whether it existed.
    ///
    /// Open sessions keep their ring alive and can still be read.
    pub fn destroy(&mut self, id: RingId) -> bool {
        let removed = self.rings.remove(&id).is_some();
        if removed {
            log::info!("removed /proc/{}", id.proc_name());
        }
        removed
    }

    pub fn destroy_all(&mut self) {
        for id in RingId::ALL {
            self.destroy(id);
        }
    }

    pub fn contains(&self, id: RingId) -> bool {
        self.rings.contains_key(&id)
    }

    /// Open the proc file of `id`
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if there is no such file
    pub fn open(&self, id: RingId) -> Result<TraceSession> {
        self.rings
            .get(&id)
            .map(|ring| TraceSession::new(ring.clone()))
            .ok_or_else(|| Error::NotFound(id.proc_name().into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::{
        io::Read,
        sync::atomic::{AtomicUsize, Ordering},
    };

    /// Ring with fixed contents that counts how often it's formatted
    struct Fixed {
        data: Option<Vec<u8>>,
        formats: AtomicUsize,
    }

    impl Fixed {
        fn new(data: Option<Vec<u8>>) -> Arc<Self> {
            Arc::new(Self {
                data,
                formats: AtomicUsize::new(0),
            })
        }
    }

    impl TraceRing for Fixed {
        fn format(&self) -> Option<Vec<u8>> {
            self.formats.fetch_add(1, Ordering::SeqCst);
            self.data.clone()
        }
    }

    struct Broken;

    impl io::Write for Broken {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn short_reads() -> Result<()> {
        let data: Vec<u8> = (0..250u8).collect();
        let mut session = TraceSession::new(Fixed::new(Some(data.clone())));
        let mut out = Vec::new();
        let mut sizes = Vec::new();
        loop {
            match session.read_into(&mut out, 100)? {
                ReadStatus::Copied(0) => break,
                ReadStatus::Copied(n) => sizes.push(n),
                ReadStatus::NotReady => panic!("ring is ready"),
            }
        }
        assert_eq!(sizes, vec![100, 100, 50]);
        assert_eq!(out, data);
        assert_eq!(session.read_into(&mut out, 100)?, ReadStatus::Copied(0));
        Ok(())
    }

    #[test]
    fn zero_len_never_touches_ring() -> Result<()> {
        let ring = Fixed::new(None);
        let mut session = TraceSession::new(ring.clone());
        assert_eq!(session.read_into(&mut Broken, 0)?, ReadStatus::Copied(0));
        assert_eq!(ring.formats.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[test]
    fn not_ready_retries() -> Result<()> {
        let ring = Fixed::new(None);
        let mut session = TraceSession::new(ring.clone());
        let mut out = Vec::new();
        assert_eq!(session.read_into(&mut out, 10)?, ReadStatus::NotReady);
        assert_eq!(session.read_into(&mut out, 10)?, ReadStatus::NotReady);
        assert_eq!(ring.formats.load(Ordering::SeqCst), 2);
        assert!(out.is_empty());
        Ok(())
    }

    #[test]
    fn fault_does_not_advance() -> Result<()> {
        let mut session = TraceSession::new(Fixed::new(Some(b"hello".to_vec())));
        assert!(matches!(
            session.read_into(&mut Broken, 3),
            Err(Error::IoFault(_))
        ));
        assert_eq!(session.position(), 0);
        let mut out = Vec::new();
        assert_eq!(session.read_into(&mut out, 3)?, ReadStatus::Copied(3));
        assert_eq!(out, b"hel");
        Ok(())
    }

    /// Takes `first` bytes, then fails once, then takes everything.
    struct Flaky {
        data: Vec<u8>,
        first: usize,
        calls: usize,
    }

    impl io::Write for Flaky {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.calls += 1;
            match self.calls {
                1 => {
                    let n = buf.len().min(self.first);
                    self.data.extend_from_slice(&buf[..n]);
                    Ok(n)
                }
                2 => Err(io::ErrorKind::BrokenPipe.into()),
                _ => {
                    self.data.extend_from_slice(buf);
                    Ok(buf.len())
                }
            }
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn partial_copy_is_not_repeated() -> Result<()> {
        let mut session = TraceSession::new(Fixed::new(Some(b"abcdef".to_vec())));
        let mut out = Flaky {
            data: Vec::new(),
            first: 2,
            calls: 0,
        };
        assert!(matches!(
            session.read_into(&mut out, 6),
            Err(Error::IoFault(_))
        ));
        assert_eq!(session.position(), 2);
        assert_eq!(session.read_into(&mut out, 6)?, ReadStatus::Copied(4));
        assert_eq!(session.read_into(&mut out, 6)?, ReadStatus::Copied(0));
        assert_eq!(out.data, b"abcdef");
        Ok(())
    }

    #[test]
    fn log_ring_overwrites() -> Result<()> {
        let ring = Arc::new(LogRing::new(2));
        assert!(ring.format().is_none());
        ring.push("one");
        ring.push("two");
        ring.push("three");
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.dropped(), 1);

        let mut text = String::new();
        TraceSession::new(ring).read_to_string(&mut text)?;
        assert_eq!(text, "two\nthree\n");
        Ok(())
    }

    #[test]
    fn endpoints() -> Result<()> {
        let mut eps = TraceEndpoints::new(Features::TRACE_VERBOSE | Features::TRACE_RTT);
        let ring = Arc::new(LogRing::new(4));
        ring.push("fw up");
        eps.create(RingId::Verbose, ring.clone())?;
        assert!(matches!(
            eps.create(RingId::Verbose, ring.clone()),
            Err(Error::DuplicateName(_))
        ));
        assert!(matches!(
            eps.create(RingId::Ecounters, ring.clone()),
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(eps.open(RingId::Rtt), Err(Error::NotFound(_))));

        let mut session = eps.open(RingId::Verbose)?;
        assert!(eps.destroy(RingId::Verbose));
        assert!(!eps.destroy(RingId::Verbose));
        assert!(eps.open(RingId::Verbose).is_err());

        let mut text = String::new();
        session.read_to_string(&mut text)?;
        assert_eq!(text, "fw up\n");
        Ok(())
    }

    #[test]
    fn names() {
        let names: Vec<_> = RingId::ALL.iter().map(|r| r.proc_name()).collect();
        assert_eq!(names, vec!["wifi_trace", "wifi_ecounters", "wifi_rtt"]);
        assert_eq!(RingId::Rtt.mode().to_string(), "0400");
    }
}
