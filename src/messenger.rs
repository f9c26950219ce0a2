//! Background communication thread, one per rank.
//!
//! The messenger owns the substrate endpoint and is the only code that
//! touches it after startup. It shares exactly four things with the
//! simulation thread: the outbound queue, the inbound queue, the
//! finished-particle counter and the shutdown flag, each internally
//! synchronized. Lifecycle: startup handshake, then a non-blocking
//! drain/probe loop, then a graceful exit once shutdown is requested and
//! both queues have emptied.

use crate::counter::Counter;
use crate::particle::Particle;
use crate::queue::Queue;
use crate::substrate::Substrate;
use anyhow::{Context, Result};
use log::{debug, trace};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use walker_common::SlabLayout;

/// A message queued by the simulation thread for the messenger to
/// dispatch.
#[derive(Debug)]
pub enum OutboundMessage {
    /// Hand a particle to the rank now owning its position. The particle
    /// is owned by the message from here on.
    Particle {
        particle: Particle,
        destination: usize,
    },
    /// Broadcast a locally-finished tally increment to every rank.
    Count { delta: u64 },
    /// Write the final histogram slab; enqueued exactly once, at
    /// shutdown.
    Dump { slab: Vec<u64>, layout: SlabLayout },
}

impl OutboundMessage {
    fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::Particle { .. } => "particle",
            OutboundMessage::Count { .. } => "count",
            OutboundMessage::Dump { .. } => "dump",
        }
    }
}

/// State shared between the simulation thread and the messenger thread.
#[derive(Debug, Default)]
struct Shared {
    outbound: Queue<OutboundMessage>,
    inbound: Queue<Particle>,
    /// Finished-count reports received from all ranks (self included),
    /// folded in by the messenger and drained by the simulation loop.
    finished_count: Counter,
    /// Non-zero once the simulation thread has requested shutdown.
    shutdown: Counter,
}

/// Handle held by the simulation thread.
pub struct Messenger {
    shared: Arc<Shared>,
    handle: JoinHandle<Result<()>>,
    rank: usize,
    size: usize,
}

impl Messenger {
    /// Spawns the communication thread over `substrate` and blocks until
    /// it reports this process's rank and the rank count. The one-shot
    /// rendezvous is the only place the simulation thread ever waits; it
    /// cannot lay out its region before the rank is known.
    pub fn spawn<S: Substrate>(substrate: S) -> Result<Self> {
        let shared = Arc::new(Shared::default());
        let thread_shared = Arc::clone(&shared);
        let (ready_tx, ready_rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("messenger".into())
            .spawn(move || {
                let rank = substrate.rank();
                let size = substrate.size();
                debug!("messenger up on rank {} of {}", rank, size);
                if ready_tx.send((rank, size)).is_err() {
                    anyhow::bail!("simulation thread went away during the startup handshake");
                }
                run(&thread_shared, substrate)
            })
            .context("spawning the messenger thread")?;
        let (rank, size) = ready_rx
            .recv()
            .context("messenger thread exited before the startup handshake")?;
        Ok(Self {
            shared,
            handle,
            rank,
            size,
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the finished-count reports accumulated since the last
    /// call and resets the tally, in one atomic exchange.
    pub fn take_finished_count(&self) -> u64 {
        self.shared.finished_count.exchange(0)
    }

    /// Claims one particle delivered by a peer, if any is waiting.
    pub fn pop_particle(&self) -> Option<Particle> {
        self.shared.inbound.pop()
    }

    pub fn inbound_len(&self) -> usize {
        self.shared.inbound.len()
    }

    /// Queues a particle for migration; the particle now belongs to the
    /// message.
    pub fn send_particle(&self, particle: Particle, destination: usize) {
        self.shared.outbound.push(OutboundMessage::Particle {
            particle,
            destination,
        });
    }

    /// Queues a finished-count delta for broadcast to every rank.
    pub fn send_count(&self, delta: u64) {
        self.shared.outbound.push(OutboundMessage::Count { delta });
    }

    /// Queues the final histogram write.
    pub fn dump(&self, slab: Vec<u64>, layout: SlabLayout) {
        self.shared.outbound.push(OutboundMessage::Dump { slab, layout });
    }

    /// Requests a graceful exit; the thread still drains both queues
    /// before stopping.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(1);
    }

    /// Waits for the thread to stop and surfaces its result.
    pub fn join(self) -> Result<()> {
        match self.handle.join() {
            Ok(result) => result,
            Err(_) => anyhow::bail!("messenger thread panicked"),
        }
    }
}

/// The messenger loop. Every pass drains the outbound queue, then polls
/// each peer for count and particle traffic; nothing in here blocks.
fn run<S: Substrate>(shared: &Shared, mut substrate: S) -> Result<()> {
    let size = substrate.size();
    loop {
        // Exit only once shutdown is requested and nothing is in flight
        // on either queue, so no message is dropped on the way out.
        if shared.shutdown.load() != 0
            && shared.outbound.is_empty()
            && shared.inbound.is_empty()
        {
            break;
        }

        if log::log_enabled!(log::Level::Trace) {
            if let Some(kind) = shared.outbound.with_front(|message| message.kind()) {
                trace!("dispatching queued {} message", kind);
            }
        }
        while let Some(message) = shared.outbound.pop() {
            dispatch(&mut substrate, size, message)?;
        }

        for peer in 0..size {
            if let Some(delta) = substrate.try_recv_count(peer)? {
                trace!("count report {} from rank {}", delta, peer);
                shared.finished_count.fetch_add(delta);
            }
        }
        for peer in 0..size {
            if let Some(particle) = substrate.try_recv_particle(peer)? {
                shared.inbound.push(particle);
            }
        }

        thread::yield_now();
    }
    debug!("messenger on rank {} drained and stopping", substrate.rank());
    Ok(())
}

fn dispatch<S: Substrate>(substrate: &mut S, size: usize, message: OutboundMessage) -> Result<()> {
    match message {
        OutboundMessage::Particle {
            particle,
            destination,
        } => substrate.send_particle(destination, &particle),
        OutboundMessage::Count { delta } => {
            // Broadcast-by-loop, self included: the local tally reaches
            // this rank's own finished counter through the loop-back.
            for peer in 0..size {
                substrate.send_count(peer, delta)?;
            }
            Ok(())
        }
        OutboundMessage::Dump { slab, layout } => substrate.write_histogram(&slab, &layout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::LocalCluster;
    use std::path::PathBuf;
    use std::time::{Duration, Instant};

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("walker-messenger-{}-{}.bin", tag, std::process::id()))
    }

    fn wait_for<T>(mut poll: impl FnMut() -> Option<T>) -> T {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(value) = poll() {
                return value;
            }
            assert!(Instant::now() < deadline, "timed out waiting for delivery");
            thread::yield_now();
        }
    }

    #[test]
    fn handshake_reports_rank_and_size() {
        let endpoints = LocalCluster::new(2, temp_path("handshake"));
        let messengers: Vec<_> = endpoints
            .into_iter()
            .map(|endpoint| Messenger::spawn(endpoint).unwrap())
            .collect();
        for (rank, messenger) in messengers.iter().enumerate() {
            assert_eq!(messenger.rank(), rank);
            assert_eq!(messenger.size(), 2);
        }
        for messenger in messengers {
            messenger.shutdown();
            messenger.join().unwrap();
        }
    }

    #[test]
    fn particles_cross_between_ranks() {
        let endpoints = LocalCluster::new(2, temp_path("particles"));
        let mut messengers: Vec<_> = endpoints
            .into_iter()
            .map(|endpoint| Messenger::spawn(endpoint).unwrap())
            .collect();
        let sent = Particle {
            x: 14,
            y: 2,
            origin: 0,
            iterations: 9,
        };
        messengers[0].send_particle(sent, 1);
        let received = wait_for(|| messengers[1].pop_particle());
        assert_eq!(received, sent);
        for messenger in messengers.drain(..) {
            messenger.shutdown();
            messenger.join().unwrap();
        }
    }

    #[test]
    fn count_broadcast_reaches_every_rank_including_self() {
        let endpoints = LocalCluster::new(2, temp_path("counts"));
        let mut messengers: Vec<_> = endpoints
            .into_iter()
            .map(|endpoint| Messenger::spawn(endpoint).unwrap())
            .collect();
        messengers[1].send_count(5);
        for messenger in &messengers {
            let got = wait_for(|| {
                let value = messenger.take_finished_count();
                (value > 0).then_some(value)
            });
            assert_eq!(got, 5);
            // The exchange reset the tally.
            assert_eq!(messenger.take_finished_count(), 0);
        }
        for messenger in messengers.drain(..) {
            messenger.shutdown();
            messenger.join().unwrap();
        }
    }

    #[test]
    fn shutdown_waits_for_queued_messages() {
        let endpoints = LocalCluster::new(2, temp_path("drain"));
        let mut messengers: Vec<_> = endpoints
            .into_iter()
            .map(|endpoint| Messenger::spawn(endpoint).unwrap())
            .collect();
        let sent = Particle {
            x: 1,
            y: 1,
            origin: 0,
            iterations: 0,
        };
        // Queue first, request shutdown immediately after; the message
        // must still go out.
        messengers[0].send_particle(sent, 1);
        messengers[0].shutdown();
        messengers.remove(0).join().unwrap();
        let received = wait_for(|| messengers[0].pop_particle());
        assert_eq!(received, sent);
        let last = messengers.remove(0);
        last.shutdown();
        last.join().unwrap();
    }
}
