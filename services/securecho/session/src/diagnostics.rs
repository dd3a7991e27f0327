//! Observers for the raw bytes moving through a channel.
//!
//! Every successful read and write on a [`SecureChannel`](crate::SecureChannel)
//! is reported here. This is a side channel only; nothing in the session
//! layer depends on what a sink does with the data.

use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

/// Direction of an observed transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Decrypted bytes received from the peer
    Received,
    /// Plaintext bytes sent to the peer
    Sent,
}

/// Receives every successful transfer on a channel
pub trait DiagnosticSink: Send + Sync + std::fmt::Debug {
    /// Called once per successful non-empty read or write
    fn observe(&self, peer: SocketAddr, direction: Direction, bytes: &[u8]);
}

/// Sink that logs byte counts at `info` and a hex/text dump at `debug`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn observe(&self, peer: SocketAddr, direction: Direction, bytes: &[u8]) {
        match direction {
            Direction::Received => info!("Received {} bytes from {}", bytes.len(), peer),
            Direction::Sent => info!("Wrote {} bytes to {}", bytes.len(), peer),
        }
        debug!("{} | {}", hex_dump(bytes), String::from_utf8_lossy(bytes));
    }
}

/// Sink that keeps every transfer in memory, in arrival order
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<(Direction, Vec<u8>)>>,
}

impl RecordingSink {
    /// Create an empty recorder behind an `Arc`, ready to hand to a context
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// All bytes observed in one direction, concatenated
    pub fn bytes(&self, direction: Direction) -> Vec<u8> {
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events
            .iter()
            .filter(|(d, _)| *d == direction)
            .flat_map(|(_, b)| b.iter().copied())
            .collect()
    }

    /// Number of transfers observed in one direction
    pub fn count(&self, direction: Direction) -> usize {
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.iter().filter(|(d, _)| *d == direction).count()
    }
}

impl DiagnosticSink for RecordingSink {
    fn observe(&self, _peer: SocketAddr, direction: Direction, bytes: &[u8]) {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.push((direction, bytes.to_vec()));
    }
}

/// Render bytes as `0x68 0x69 0x0`
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 5);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "0x{:X}", b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_hex_dump() {
        assert_eq!(hex_dump(b"hi\0"), "0x68 0x69 0x0");
        assert_eq!(hex_dump(&[]), "");
    }

    #[test]
    fn test_recording_sink_orders_by_direction() {
        let sink = RecordingSink::new();
        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 443);

        sink.observe(peer, Direction::Received, b"ab");
        sink.observe(peer, Direction::Sent, b"xy");
        sink.observe(peer, Direction::Received, b"c");

        assert_eq!(sink.bytes(Direction::Received), b"abc");
        assert_eq!(sink.bytes(Direction::Sent), b"xy");
        assert_eq!(sink.count(Direction::Received), 2);
    }
}
