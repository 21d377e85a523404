//! Native serial transport using the `serialport` crate.
//!
//! A background reader thread polls the port and pushes every received chunk
//! to the current subscriber, which gives the protocol layers the same
//! push-based delivery a browser serial stream has.

use {
    crate::{
        error::{Error, Result},
        port::{
            DataBits, FlowControl, INBOUND_QUEUE_DEPTH, Parity, SerialConfig, StopBits,
            Transport,
        },
    },
    log::{debug, trace, warn},
    std::{
        io::{ErrorKind, Read, Write},
        sync::{
            Arc, Mutex, PoisonError,
            atomic::{AtomicBool, Ordering},
            mpsc::{self, Receiver, SyncSender, TrySendError},
        },
        thread::{self, JoinHandle},
    },
};

/// Size of the reader thread's scratch buffer.
const READ_CHUNK: usize = 1024;

type Subscriber = Arc<Mutex<Option<SyncSender<Vec<u8>>>>>;

/// Serial transport for desktop platforms.
pub struct NativeTransport {
    config: SerialConfig,
    port: Option<Box<dyn serialport::SerialPort>>,
    subscriber: Subscriber,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl NativeTransport {
    /// Create a transport for the given configuration. Nothing is opened yet.
    pub fn new(config: SerialConfig) -> Self {
        Self {
            config,
            port: None,
            subscriber: Arc::new(Mutex::new(None)),
            stop: Arc::new(AtomicBool::new(false)),
            reader: None,
        }
    }

    /// Shorthand for [`NativeTransport::new`] with default line settings.
    pub fn with_port(port_name: &str, baud_rate: u32) -> Self {
        Self::new(SerialConfig::new(port_name, baud_rate))
    }

    /// Configuration this transport opens with.
    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    fn spawn_reader(&mut self, mut port: Box<dyn serialport::SerialPort>) -> Result<()> {
        let subscriber = Arc::clone(&self.subscriber);
        let stop = Arc::clone(&self.stop);
        let name = self.config.port_name.clone();

        let handle = thread::Builder::new()
            .name("m5link-rx".to_string())
            .spawn(move || {
                let mut buf = [0u8; READ_CHUNK];
                while !stop.load(Ordering::Relaxed) {
                    match port.read(&mut buf) {
                        Ok(0) => {},
                        Ok(n) => {
                            trace!("{name}: received {n} bytes");
                            deliver(&subscriber, &buf[..n]);
                        },
                        Err(e) if e.kind() == ErrorKind::TimedOut => {},
                        Err(e) if e.kind() == ErrorKind::Interrupted => {},
                        Err(e) => {
                            if !stop.load(Ordering::Relaxed) {
                                warn!("{name}: reader stopped: {e}");
                            }
                            break;
                        },
                    }
                }
                debug!("{name}: reader thread exiting");
            })?;

        self.reader = Some(handle);
        Ok(())
    }
}

fn deliver(subscriber: &Subscriber, chunk: &[u8]) {
    let mut guard = subscriber
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    let Some(tx) = guard.as_ref() else {
        return;
    };
    match tx.try_send(chunk.to_vec()) {
        Ok(()) => {},
        Err(TrySendError::Full(chunk)) => {
            trace!("Inbound queue full, dropped {} bytes", chunk.len());
        },
        Err(TrySendError::Disconnected(_)) => {
            // receiver dropped, nobody is listening anymore
            *guard = None;
        },
    }
}

impl Transport for NativeTransport {
    fn open(&mut self) -> Result<()> {
        if self.port.is_some() {
            return Ok(());
        }

        let config = &self.config;
        let port = serialport::new(&config.port_name, config.baud_rate)
            .timeout(config.timeout)
            .data_bits(config.data_bits.into())
            .parity(config.parity.into())
            .stop_bits(config.stop_bits.into())
            .flow_control(config.flow_control.into())
            .open()?;

        let reader = port.try_clone()?;
        self.stop.store(false, Ordering::Relaxed);
        self.spawn_reader(reader)?;
        self.port = Some(port);

        debug!(
            "Opened {} at {} baud",
            self.config.port_name, self.config.baud_rate
        );
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::Relaxed);
        self.port.take();

        if let Some(handle) = self.reader.take() {
            if handle.join().is_err() {
                warn!("{}: reader thread panicked", self.config.port_name);
            }
        }

        debug!("Closed {}", self.config.port_name);
        Ok(())
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        let port = self.port.as_mut().ok_or(Error::NotConnected)?;
        trace!("{}: writing {} bytes", self.config.port_name, data.len());
        port.write_all(data)?;
        port.flush()?;
        Ok(())
    }

    fn subscribe(&mut self) -> Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::sync_channel(INBOUND_QUEUE_DEPTH);
        *self
            .subscriber
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }

    fn name(&self) -> &str {
        &self.config.port_name
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }
}

impl Drop for NativeTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

// Type conversions from our types to serialport types

impl From<DataBits> for serialport::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Seven => Self::Seven,
            DataBits::Eight => Self::Eight,
        }
    }
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => Self::None,
            Parity::Odd => Self::Odd,
            Parity::Even => Self::Even,
        }
    }
}

impl From<StopBits> for serialport::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => Self::One,
            StopBits::Two => Self::Two,
        }
    }
}

impl From<FlowControl> for serialport::FlowControl {
    fn from(flow: FlowControl) -> Self {
        match flow {
            FlowControl::None => Self::None,
            FlowControl::Hardware => Self::Hardware,
            FlowControl::Software => Self::Software,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_closed() {
        let transport = NativeTransport::with_port("/dev/ttyUSB0", 115_200);
        assert!(!transport.is_open());
        assert_eq!(transport.name(), "/dev/ttyUSB0");
        assert_eq!(transport.config().baud_rate, 115_200);
    }

    #[test]
    fn test_write_while_closed_fails() {
        let mut transport = NativeTransport::with_port("/dev/ttyUSB0", 115_200);
        assert!(matches!(
            transport.write_raw(b"x"),
            Err(Error::NotConnected)
        ));
    }

    #[test]
    fn test_open_missing_port_fails() {
        let mut transport = NativeTransport::with_port("/dev/m5link-does-not-exist", 115_200);
        assert!(transport.open().is_err());
        assert!(!transport.is_open());
    }

    #[test]
    fn test_deliver_drops_dead_subscriber() {
        let subscriber: Subscriber = Arc::new(Mutex::new(None));
        let (tx, rx) = mpsc::sync_channel(INBOUND_QUEUE_DEPTH);
        *subscriber.lock().unwrap() = Some(tx);

        deliver(&subscriber, b"abc");
        assert_eq!(rx.recv().unwrap(), b"abc");

        drop(rx);
        deliver(&subscriber, b"def");
        assert!(subscriber.lock().unwrap().is_none());
    }

    #[test]
    fn test_deliver_drops_chunks_when_queue_full() {
        let subscriber: Subscriber = Arc::new(Mutex::new(None));
        let (tx, rx) = mpsc::sync_channel(INBOUND_QUEUE_DEPTH);
        *subscriber.lock().unwrap() = Some(tx);

        for _ in 0..INBOUND_QUEUE_DEPTH * 4 {
            deliver(&subscriber, &[0x55; READ_CHUNK]);
        }
        assert_eq!(rx.try_iter().count(), INBOUND_QUEUE_DEPTH);
        // still subscribed once there is room again
        deliver(&subscriber, b"tail");
        assert_eq!(rx.try_recv().unwrap(), b"tail");
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut transport = NativeTransport::with_port("/dev/ttyUSB0", 115_200);
        assert!(transport.close().is_ok());
        assert!(transport.close().is_ok());
    }
}
