//! Exclusive owner of one transport and its inbound subscription.

use {
    crate::{
        error::{Error, Result},
        port::Transport,
    },
    log::trace,
    std::{
        io,
        sync::{
            Mutex, PoisonError,
            mpsc::{Receiver, RecvTimeoutError},
        },
        time::Instant,
    },
};

/// A transport plus the receiver its inbound bytes are pushed to.
///
/// Both protocol modes sit on a `Link`; nothing else sees the raw stream.
pub(crate) struct Link<T: Transport> {
    transport: Mutex<T>,
    inbound: Mutex<Receiver<Vec<u8>>>,
}

impl<T: Transport> Link<T> {
    /// Take ownership of `transport` and subscribe to its inbound data.
    pub(crate) fn new(mut transport: T) -> Self {
        let inbound = transport.subscribe();
        Self {
            transport: Mutex::new(transport),
            inbound: Mutex::new(inbound),
        }
    }

    /// Write bytes to the device.
    pub(crate) fn write(&self, data: &[u8]) -> Result<()> {
        self.transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write_raw(data)
    }

    /// Wait for the next inbound chunk, giving up at `deadline`.
    ///
    /// Returns `Ok(None)` when the deadline passes without data.
    pub(crate) fn recv_until(&self, deadline: Instant) -> Result<Option<Vec<u8>>> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let inbound = self
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match inbound.recv_timeout(remaining) {
            Ok(chunk) => Ok(Some(chunk)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Error::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "transport stopped delivering data",
            ))),
        }
    }

    /// Throw away everything received so far.
    ///
    /// Bytes that arrive while no exchange is pending belong to nobody
    /// (late replies to abandoned commands, device chatter).
    pub(crate) fn drain_stale(&self) -> usize {
        let inbound = self
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let dropped: usize = inbound.try_iter().map(|chunk| chunk.len()).sum();
        if dropped > 0 {
            trace!("Discarded {dropped} stale bytes");
        }
        dropped
    }

    /// Endpoint name of the transport.
    pub(crate) fn name(&self) -> String {
        self.transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .name()
            .to_string()
    }

    /// Give the transport back.
    pub(crate) fn into_transport(self) -> T {
        self.transport
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{port::INBOUND_QUEUE_DEPTH, testing::MockTransport};
    use std::time::Duration;

    #[test]
    fn test_recv_until_times_out() {
        let link = Link::new(MockTransport::silent());
        let deadline = Instant::now() + Duration::from_millis(20);
        assert!(link.recv_until(deadline).unwrap().is_none());
    }

    #[test]
    fn test_drain_stale_discards_pending_chunks() {
        let transport = MockTransport::silent();
        let injector = transport.injector();
        let link = Link::new(transport);

        injector.inject(b"late reply");
        injector.inject(b"!");
        assert_eq!(link.drain_stale(), 11);

        let deadline = Instant::now() + Duration::from_millis(10);
        assert!(link.recv_until(deadline).unwrap().is_none());
    }

    #[test]
    fn test_idle_inbound_is_bounded() {
        let transport = MockTransport::silent();
        let injector = transport.injector();
        let link = Link::new(transport);

        // a program printing in a loop while no exchange is pending
        for _ in 0..10_000 {
            injector.inject(&[b'.'; 1024]);
        }
        assert_eq!(link.drain_stale(), INBOUND_QUEUE_DEPTH * 1024);
    }

    #[test]
    fn test_write_reaches_transport() {
        let transport = MockTransport::silent();
        let writes = transport.writes();
        let link = Link::new(transport);

        link.write(b"\x03").unwrap();
        assert_eq!(writes.lock().unwrap().as_slice(), &[b"\x03".to_vec()]);
        assert_eq!(link.name(), "mock");
    }
}
