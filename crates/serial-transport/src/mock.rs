use crate::{PortBackend, PortInfo, Result, SerialBus, TransportError, WireEvent, WireKind};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

/// Produces the reply bytes for one transmitted request, or `None` to stay silent.
pub trait Responder: Send {
    fn respond(&mut self, request: &[u8]) -> Option<Vec<u8>>;
}

impl<F> Responder for F
where
    F: FnMut(&[u8]) -> Option<Vec<u8>> + Send,
{
    fn respond(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        self(request)
    }
}

fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct LogInner {
    events: Vec<WireEvent>,
    overlaps: usize,
}

/// Shared record of everything a mock port put on or took off the wire.
#[derive(Clone, Default)]
pub struct WireLog {
    inner: Arc<Mutex<LogInner>>,
}

impl WireLog {
    fn push(&self, kind: WireKind, bytes: &[u8]) {
        let event = WireEvent {
            kind,
            bytes: bytes.to_vec(),
            at: Instant::now(),
        };
        tracing::trace!("{event}");
        lock(&self.inner).events.push(event);
    }

    fn note_overlap(&self) {
        lock(&self.inner).overlaps += 1;
    }

    pub fn events(&self) -> Vec<WireEvent> {
        lock(&self.inner).events.clone()
    }

    /// Transmitted requests only, in wire order.
    pub fn tx(&self) -> Vec<WireEvent> {
        lock(&self.inner)
            .events
            .iter()
            .filter(|e| e.kind == WireKind::Tx)
            .cloned()
            .collect()
    }

    /// Number of times a request was written while the previous exchange was unfinished.
    pub fn overlaps(&self) -> usize {
        lock(&self.inner).overlaps
    }

    pub fn clear(&self) {
        let mut inner = lock(&self.inner);
        inner.events.clear();
        inner.overlaps = 0;
    }
}

/// In-process backend. Every port it opens shares one responder and one wire log.
pub struct MockBackend {
    ports: Vec<PortInfo>,
    responder: Arc<Mutex<dyn Responder>>,
    log: WireLog,
    fail_open: bool,
}

impl MockBackend {
    pub fn new<R: Responder + 'static>(responder: Arc<Mutex<R>>) -> Self {
        Self {
            ports: vec![PortInfo::new("mock0", "usb-mock")],
            responder,
            log: WireLog::default(),
            fail_open: false,
        }
    }

    /// A backend that answers nothing, handy for exercising timeouts.
    pub fn silent() -> Self {
        Self::new(Arc::new(Mutex::new(|_: &[u8]| -> Option<Vec<u8>> { None })))
    }

    /// Report no ports at all, so port selection fails.
    pub fn without_ports(mut self) -> Self {
        self.ports.clear();
        self
    }

    /// Report ports but refuse to open them.
    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn log(&self) -> WireLog {
        self.log.clone()
    }
}

impl PortBackend for MockBackend {
    fn list(&self) -> Result<Vec<PortInfo>> {
        Ok(self.ports.clone())
    }

    fn open(&self, name: &str, _baud_rate: u32) -> Result<Box<dyn SerialBus>> {
        if self.fail_open {
            return Err(TransportError::Io(format!("mock refused to open {name}")));
        }
        Ok(Box::new(MockPort {
            name: name.to_string(),
            responder: Arc::clone(&self.responder),
            log: self.log.clone(),
            rx: VecDeque::new(),
            open: true,
            busy: false,
        }))
    }
}

/// A port whose replies come from a [`Responder`]. Reads never block: missing bytes
/// fail immediately with a timeout.
pub struct MockPort {
    name: String,
    responder: Arc<Mutex<dyn Responder>>,
    log: WireLog,
    rx: VecDeque<u8>,
    open: bool,
    busy: bool,
}

impl SerialBus for MockPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        if self.busy {
            self.log.note_overlap();
        }
        self.busy = true;
        self.log.push(WireKind::Tx, bytes);
        let reply = lock(&self.responder).respond(bytes);
        if let Some(reply) = reply {
            self.log.push(WireKind::Rx, &reply);
            self.rx.extend(reply);
        }
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8], _timeout_ms: u64) -> Result<()> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        if self.rx.len() < buf.len() {
            let got = self.rx.len();
            self.rx.clear();
            self.busy = false;
            return Err(TransportError::Timeout {
                got,
                wanted: buf.len(),
            });
        }
        for slot in buf.iter_mut() {
            *slot = self.rx.pop_front().unwrap_or_default();
        }
        if self.rx.is_empty() {
            self.busy = false;
        }
        Ok(())
    }

    fn clear_input(&mut self) -> Result<()> {
        self.rx.clear();
        self.busy = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        self.rx.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo() -> Arc<Mutex<impl Responder>> {
        Arc::new(Mutex::new(|req: &[u8]| Some(req.to_vec())))
    }

    #[test]
    fn test_reply_is_readable_after_write() {
        let backend = MockBackend::new(echo());
        let mut port = backend.open("mock0", 1_000_000).unwrap();
        port.write_all(&[1, 2, 3]).unwrap();
        let mut buf = [0u8; 3];
        port.read_exact(&mut buf, 10).unwrap();
        assert_eq!(buf, [1, 2, 3]);
        assert_eq!(backend.log().tx().len(), 1);
        assert_eq!(backend.log().events().len(), 2);
    }

    #[test]
    fn test_short_reply_times_out() {
        let backend = MockBackend::silent();
        let mut port = backend.open("mock0", 1_000_000).unwrap();
        port.write_all(&[0xFF]).unwrap();
        let mut buf = [0u8; 4];
        let err = port.read_exact(&mut buf, 10).unwrap_err();
        assert_eq!(err, TransportError::Timeout { got: 0, wanted: 4 });
    }

    #[test]
    fn test_write_during_unfinished_exchange_counts_overlap() {
        let backend = MockBackend::new(echo());
        let mut port = backend.open("mock0", 1_000_000).unwrap();
        port.write_all(&[1, 2]).unwrap();
        port.write_all(&[3, 4]).unwrap();
        assert_eq!(backend.log().overlaps(), 1);
    }

    #[test]
    fn test_closed_port_rejects_io() {
        let backend = MockBackend::new(echo());
        let mut port = backend.open("mock0", 1_000_000).unwrap();
        port.close().unwrap();
        assert!(!port.is_open());
        assert_eq!(port.write_all(&[1]), Err(TransportError::NotOpen));
    }

    #[test]
    fn test_wire_event_renders_hex() {
        let backend = MockBackend::new(echo());
        let mut port = backend.open("mock0", 1_000_000).unwrap();
        port.write_all(&[0xFF, 0x01, 0x2C]).unwrap();
        let events = backend.log().events();
        assert_eq!(events[0].to_string(), "tx FF 01 2C");
        assert_eq!(events[1].to_string(), "rx FF 01 2C");
    }

    #[test]
    fn test_backend_variants() {
        assert!(MockBackend::silent().without_ports().list().unwrap().is_empty());
        assert!(MockBackend::silent().failing_open().open("mock0", 9600).is_err());
    }
}
