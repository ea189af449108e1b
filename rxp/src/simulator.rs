//! Fault-injecting transport for deterministic testing.
//!
//! [`Simulator`] wraps any [`Transport`] and intercepts sends and receives,
//! applying a fault model:
//!
//! | Fault       | Outbound                  | Inbound                          |
//! |-------------|---------------------------|----------------------------------|
//! | Drop        | never reaches the wire    | never delivered                  |
//! | Duplicate   | sent twice                | delivered twice                  |
//! | Corrupt     | dropped (fails checksum)  | delivered as a checksum failure  |
//! | Reorder     | held, sent after the next | held, delivered after the next   |
//!
//! A reordered packet waits for the next packet in its direction and then
//! follows it, so it is only as late as the traffic behind it.
//!
//! Faults come from two sources: a script keyed by per-direction packet
//! index, checked first, and per-packet rates drawn from a seeded RNG so a
//! failing run can be replayed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::packet::{Packet, PacketError, HEADER_LEN};
use crate::socket::{SocketError, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Drop,
    Duplicate,
    Corrupt,
    Reorder,
}

/// Configuration for the fault-injection model.
///
/// All rates are probabilities in `[0.0, 1.0]`.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub loss_rate: f64,
    pub duplicate_rate: f64,
    pub corrupt_rate: f64,
    pub reorder_rate: f64,
    pub seed: u64,
    /// `(direction, index, fault)`: the `index`-th packet (0-based) in that
    /// direction suffers `fault`.
    pub script: Vec<(Direction, usize, Fault)>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        // No faults by default; the simulator is a transparent pass-through.
        Self {
            loss_rate: 0.0,
            duplicate_rate: 0.0,
            corrupt_rate: 0.0,
            reorder_rate: 0.0,
            seed: 0,
            script: Vec::new(),
        }
    }
}

impl SimulatorConfig {
    pub fn scripted(script: Vec<(Direction, usize, Fault)>) -> Self {
        Self {
            script,
            ..Self::default()
        }
    }
}

/// Counts of injected faults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub dropped: usize,
    pub duplicated: usize,
    pub corrupted: usize,
    pub reordered: usize,
}

/// A fault-injecting wrapper around another transport.
pub struct Simulator<T> {
    inner: T,
    config: SimulatorConfig,
    rng: Mutex<StdRng>,
    sent: AtomicUsize,
    received: AtomicUsize,
    dropped: AtomicUsize,
    duplicated: AtomicUsize,
    corrupted: AtomicUsize,
    reordered: AtomicUsize,
    /// Outbound packet waiting for the next send.
    held: Mutex<Option<Packet>>,
    /// Inbound packet waiting for the next receive from the wire.
    held_inbound: Option<Packet>,
    /// Duplicates and released packets waiting to be delivered.
    pending: VecDeque<Packet>,
}

impl<T: Transport> Simulator<T> {
    pub fn new(inner: T, config: SimulatorConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            inner,
            config,
            rng: Mutex::new(rng),
            sent: AtomicUsize::new(0),
            received: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
            duplicated: AtomicUsize::new(0),
            corrupted: AtomicUsize::new(0),
            reordered: AtomicUsize::new(0),
            held: Mutex::new(None),
            held_inbound: None,
            pending: VecDeque::new(),
        }
    }

    pub fn stats(&self) -> SimStats {
        SimStats {
            dropped: self.dropped.load(Ordering::Relaxed),
            duplicated: self.duplicated.load(Ordering::Relaxed),
            corrupted: self.corrupted.load(Ordering::Relaxed),
            reordered: self.reordered.load(Ordering::Relaxed),
        }
    }

    /// Pick the fault, if any, for the next packet in `direction`.
    fn decide(&self, direction: Direction) -> Option<Fault> {
        let counter = match direction {
            Direction::Outbound => &self.sent,
            Direction::Inbound => &self.received,
        };
        let index = counter.fetch_add(1, Ordering::Relaxed);

        let scripted = self
            .config
            .script
            .iter()
            .find(|(d, i, _)| *d == direction && *i == index)
            .map(|(_, _, fault)| *fault);
        let fault = scripted.or_else(|| {
            let mut rng = self.rng.lock().ok()?;
            if rng.gen_bool(self.config.loss_rate.clamp(0.0, 1.0)) {
                Some(Fault::Drop)
            } else if rng.gen_bool(self.config.corrupt_rate.clamp(0.0, 1.0)) {
                Some(Fault::Corrupt)
            } else if rng.gen_bool(self.config.duplicate_rate.clamp(0.0, 1.0)) {
                Some(Fault::Duplicate)
            } else if rng.gen_bool(self.config.reorder_rate.clamp(0.0, 1.0)) {
                Some(Fault::Reorder)
            } else {
                None
            }
        })?;

        let stat = match fault {
            Fault::Drop => &self.dropped,
            Fault::Duplicate => &self.duplicated,
            Fault::Corrupt => &self.corrupted,
            Fault::Reorder => &self.reordered,
        };
        stat.fetch_add(1, Ordering::Relaxed);
        log::debug!("[sim] {fault:?} {direction:?} packet #{index}");
        Some(fault)
    }
}

impl<T> Simulator<T> {
    fn take_held(&self) -> Option<Packet> {
        self.held.lock().ok().and_then(|mut slot| slot.take())
    }

    fn hold(&self, packet: Packet) {
        if let Ok(mut slot) = self.held.lock() {
            *slot = Some(packet);
        }
    }
}

/// Flip one payload byte (or a checksum byte for an empty payload) and run
/// the result back through the decoder.
fn corrupt(packet: &Packet) -> SocketError {
    let mut bytes = match packet.encode() {
        Ok(bytes) => bytes,
        Err(e) => return e.into(),
    };
    let at = if packet.payload.is_empty() {
        HEADER_LEN - 1
    } else {
        HEADER_LEN
    };
    bytes[at] ^= 0xFF;
    match Packet::decode(&bytes) {
        Err(e) => e.into(),
        Ok(_) => PacketError::ChecksumMismatch.into(),
    }
}

impl<T: Transport> Transport for Simulator<T> {
    async fn send(&self, packet: &Packet) -> Result<(), SocketError> {
        let fault = self.decide(Direction::Outbound);
        let released = self.take_held();
        match fault {
            Some(Fault::Drop | Fault::Corrupt) => {}
            Some(Fault::Duplicate) => {
                self.inner.send(packet).await?;
                self.inner.send(packet).await?;
            }
            Some(Fault::Reorder) => self.hold(packet.clone()),
            None => self.inner.send(packet).await?,
        }
        match released {
            Some(earlier) => self.inner.send(&earlier).await,
            None => Ok(()),
        }
    }

    async fn recv(&mut self) -> Result<Packet, SocketError> {
        loop {
            if let Some(packet) = self.pending.pop_front() {
                return Ok(packet);
            }
            let packet = self.inner.recv().await?;
            let fault = self.decide(Direction::Inbound);
            if let Some(earlier) = self.held_inbound.take() {
                self.pending.push_back(earlier);
            }
            match fault {
                Some(Fault::Drop) => continue,
                Some(Fault::Corrupt) => return Err(corrupt(&packet)),
                Some(Fault::Duplicate) => {
                    self.pending.push_front(packet.clone());
                    return Ok(packet);
                }
                Some(Fault::Reorder) => {
                    self.held_inbound = Some(packet);
                    continue;
                }
                None => return Ok(packet),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{flags, Header};
    use tokio::sync::mpsc;

    /// In-process transport: sends go to `out`, receives come from `inbox`.
    struct Pipe {
        out: mpsc::UnboundedSender<Packet>,
        inbox: mpsc::UnboundedReceiver<Packet>,
    }

    impl Transport for Pipe {
        async fn send(&self, packet: &Packet) -> Result<(), SocketError> {
            self.out.send(packet.clone()).map_err(|_| SocketError::Closed)
        }

        async fn recv(&mut self) -> Result<Packet, SocketError> {
            self.inbox.recv().await.ok_or(SocketError::Closed)
        }
    }

    fn pipe() -> (Pipe, mpsc::UnboundedReceiver<Packet>, mpsc::UnboundedSender<Packet>) {
        let (out, sent) = mpsc::unbounded_channel();
        let (deliver, inbox) = mpsc::unbounded_channel();
        (Pipe { out, inbox }, sent, deliver)
    }

    fn pkt(seq: u16, payload: &[u8]) -> Packet {
        Packet::new(Header::new(1, 2, seq, 0, flags::ACK), payload.to_vec())
    }

    #[tokio::test]
    async fn default_config_is_transparent() {
        let (inner, mut sent, deliver) = pipe();
        let mut sim = Simulator::new(inner, SimulatorConfig::default());

        sim.send(&pkt(1, b"a")).await.unwrap();
        assert_eq!(sent.recv().await.unwrap().header.seq, 1);

        deliver.send(pkt(2, b"b")).unwrap();
        assert_eq!(sim.recv().await.unwrap().header.seq, 2);
        assert_eq!(sim.stats(), SimStats::default());
    }

    #[tokio::test]
    async fn scripted_faults_hit_the_indexed_packets() {
        let (inner, mut sent, deliver) = pipe();
        let mut sim = Simulator::new(
            inner,
            SimulatorConfig::scripted(vec![
                (Direction::Outbound, 0, Fault::Drop),
                (Direction::Outbound, 1, Fault::Duplicate),
                (Direction::Inbound, 0, Fault::Corrupt),
                (Direction::Inbound, 1, Fault::Duplicate),
            ]),
        );

        sim.send(&pkt(0, b"x")).await.unwrap();
        sim.send(&pkt(1, b"y")).await.unwrap();
        assert_eq!(sent.recv().await.unwrap().header.seq, 1);
        assert_eq!(sent.recv().await.unwrap().header.seq, 1);
        assert!(sent.try_recv().is_err());

        deliver.send(pkt(10, b"z")).unwrap();
        deliver.send(pkt(11, b"")).unwrap();
        assert!(matches!(
            sim.recv().await,
            Err(SocketError::Packet(PacketError::ChecksumMismatch))
        ));
        assert_eq!(sim.recv().await.unwrap().header.seq, 11);
        assert_eq!(sim.recv().await.unwrap().header.seq, 11);

        assert_eq!(
            sim.stats(),
            SimStats {
                dropped: 1,
                duplicated: 2,
                corrupted: 1,
                reordered: 0,
            }
        );
    }

    #[tokio::test]
    async fn reordered_packets_follow_the_next_one() {
        let (inner, mut sent, deliver) = pipe();
        let mut sim = Simulator::new(
            inner,
            SimulatorConfig::scripted(vec![
                (Direction::Outbound, 0, Fault::Reorder),
                (Direction::Inbound, 1, Fault::Reorder),
            ]),
        );

        sim.send(&pkt(0, b"a")).await.unwrap();
        assert!(sent.try_recv().is_err());
        sim.send(&pkt(1, b"b")).await.unwrap();
        assert_eq!(sent.recv().await.unwrap().header.seq, 1);
        assert_eq!(sent.recv().await.unwrap().header.seq, 0);

        for seq in 10..13 {
            deliver.send(pkt(seq, b"c")).unwrap();
        }
        let order: Vec<u16> = [
            sim.recv().await.unwrap(),
            sim.recv().await.unwrap(),
            sim.recv().await.unwrap(),
        ]
        .iter()
        .map(|p| p.header.seq)
        .collect();
        assert_eq!(order, vec![10, 12, 11]);
        assert_eq!(sim.stats().reordered, 2);
    }

    #[test]
    fn corrupting_an_empty_packet_still_fails_checksum() {
        assert!(matches!(
            corrupt(&pkt(0, b"")),
            SocketError::Packet(PacketError::ChecksumMismatch)
        ));
    }

    #[tokio::test]
    async fn full_loss_rate_drops_everything_sent() {
        let (inner, mut sent, _deliver) = pipe();
        let sim = Simulator::new(
            inner,
            SimulatorConfig {
                loss_rate: 1.0,
                ..SimulatorConfig::default()
            },
        );
        for seq in 0..10 {
            sim.send(&pkt(seq, b"p")).await.unwrap();
        }
        assert!(sent.try_recv().is_err());
        assert_eq!(sim.stats().dropped, 10);
    }
}
