//! UDP ingress
//!
//! [`UdpSource`] receives Cannelloni datagrams and numbers them in arrival order. The
//! socket is bound during `init`, so a port conflict fails the pipeline before any stage
//! runs.

use crate::stage::Source;
use crate::types::{RawDatagram, Result, TelemetryError};
use chrono::Utc;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

/// Largest datagram accepted
pub const MAX_DATAGRAM_SIZE: usize = 65_535;

/// How long a receive blocks before the stage re-checks cancellation
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Datagram source bound to a UDP address
pub struct UdpSource {
    bind_addr: SocketAddr,
    read_timeout: Duration,
    socket: Option<UdpSocket>,
    buffer: Vec<u8>,
    next_arrival: u64,
}

impl UdpSource {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            read_timeout: DEFAULT_READ_TIMEOUT,
            socket: None,
            buffer: vec![0u8; MAX_DATAGRAM_SIZE],
            next_arrival: 0,
        }
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Bound address, available after `init`. Useful when binding port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Datagrams received so far
    pub fn received(&self) -> u64 {
        self.next_arrival
    }
}

impl Source for UdpSource {
    type Out = RawDatagram;

    fn init(&mut self) -> Result<()> {
        let socket = UdpSocket::bind(self.bind_addr).map_err(|e| {
            TelemetryError::InvalidConfig(format!("cannot bind UDP {}: {}", self.bind_addr, e))
        })?;
        socket.set_read_timeout(Some(self.read_timeout))?;

        log::info!("Listening for Cannelloni datagrams on {}", socket.local_addr()?);
        self.socket = Some(socket);
        Ok(())
    }

    fn poll(&mut self) -> Result<Option<RawDatagram>> {
        let Some(socket) = &self.socket else {
            return Err(TelemetryError::InvalidConfig("UDP source is not bound".to_string()));
        };

        match socket.recv_from(&mut self.buffer) {
            Ok((size, source)) => {
                let arrival = self.next_arrival;
                self.next_arrival += 1;
                log::trace!("Datagram #{} of {} bytes from {}", arrival, size, source);

                Ok(Some(RawDatagram {
                    arrival,
                    source: Some(source),
                    received_at: Utc::now(),
                    payload: self.buffer[..size].to_vec(),
                }))
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn close(&mut self) {
        if self.socket.take().is_some() {
            log::info!("UDP source closed after {} datagrams", self.next_arrival);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_receive_numbers_datagrams() {
        let mut source = UdpSource::new(loopback()).with_read_timeout(Duration::from_millis(500));
        source.init().unwrap();
        let addr = source.local_addr().unwrap();

        let sender = UdpSocket::bind(loopback()).unwrap();
        sender.send_to(&[2, 0, 1, 0, 0], addr).unwrap();
        sender.send_to(&[2, 0, 2, 0, 0], addr).unwrap();

        let first = source.poll().unwrap().unwrap();
        let second = source.poll().unwrap().unwrap();
        assert_eq!(first.arrival, 0);
        assert_eq!(first.payload, vec![2, 0, 1, 0, 0]);
        assert_eq!(second.arrival, 1);
        assert_eq!(first.source, Some(sender.local_addr().unwrap()));
        source.close();
    }

    #[test]
    fn test_idle_poll_returns_none() {
        let mut source = UdpSource::new(loopback()).with_read_timeout(Duration::from_millis(10));
        source.init().unwrap();
        assert!(source.poll().unwrap().is_none());
    }

    #[test]
    fn test_bind_conflict_fails_init() {
        let taken = UdpSocket::bind(loopback()).unwrap();
        let mut source = UdpSource::new(taken.local_addr().unwrap());
        assert!(source.init().is_err());
    }

    #[test]
    fn test_poll_before_init_fails() {
        let mut source = UdpSource::new(loopback());
        assert!(source.poll().is_err());
    }
}
