//! Rank-addressed messaging and shared-file substrate.
//!
//! The engine never talks to a transport directly; everything goes
//! through the [`Substrate`] trait, which models the three facilities the
//! messenger thread needs: non-blocking point-to-point sends, non-blocking
//! per-peer probe-and-receive (fused into `try_recv_*`), and the
//! positioned write of this rank's histogram slab into the shared output
//! file. Particle and count traffic are independent streams and never
//! collide.
//!
//! Two implementations: [`LocalCluster`] runs every rank inside one
//! process over byte mailboxes (the default mode, and what the scenario
//! tests drive), and `MpiWorld` (behind the `mpi` feature) runs one rank
//! per OS process over an MPI world.

use crate::particle::Particle;
use anyhow::{Context, Result};
use bincode::config::{
    DefaultOptions, FixintEncoding, LittleEndian, WithOtherEndian, WithOtherIntEncoding,
};
use bincode::Options;
use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use walker_common::SlabLayout;
use zerocopy::IntoBytes;

/// Non-blocking, rank-addressed messaging plus the final file write.
///
/// `try_recv_*` combines the probe and the receive: `Ok(None)` means no
/// message from that peer is pending right now. No method may block
/// waiting for a specific peer. Failures are fatal to the run; there is
/// no retry layer.
pub trait Substrate: Send + 'static {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    /// Issues a particle send; ownership of the record transfers to the
    /// substrate once this returns.
    fn send_particle(&mut self, destination: usize, particle: &Particle) -> Result<()>;
    fn try_recv_particle(&mut self, from: usize) -> Result<Option<Particle>>;

    fn send_count(&mut self, destination: usize, delta: u64) -> Result<()>;
    fn try_recv_count(&mut self, from: usize) -> Result<Option<u64>>;

    /// Writes this rank's slab into its strided region of the shared
    /// histogram file.
    fn write_histogram(&mut self, slab: &[u64], layout: &SlabLayout) -> Result<()>;
}

type WireOptions = WithOtherIntEncoding<WithOtherEndian<DefaultOptions, LittleEndian>, FixintEncoding>;

/// Wire-format context for the two structured payloads.
///
/// Constructed once per endpoint and carried with it, so the format
/// descriptors live with their user instead of in process-wide state.
/// Fixed-width little-endian integers keep the particle record at its
/// declared 20 bytes.
#[derive(Clone, Copy)]
pub struct WireCodec {
    options: WireOptions,
}

impl WireCodec {
    pub fn new() -> Self {
        Self {
            options: DefaultOptions::new()
                .with_little_endian()
                .with_fixint_encoding(),
        }
    }

    pub fn encode_particle(&self, particle: &Particle) -> Result<Vec<u8>> {
        Ok(self.options.serialize(particle)?)
    }

    pub fn decode_particle(&self, bytes: &[u8]) -> Result<Particle> {
        Ok(self.options.deserialize(bytes)?)
    }

    pub fn encode_count(&self, delta: u64) -> Result<Vec<u8>> {
        Ok(self.options.serialize(&delta)?)
    }

    pub fn decode_count(&self, bytes: &[u8]) -> Result<u64> {
        Ok(self.options.deserialize(bytes)?)
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// One byte mailbox per (source, destination) pair per message kind.
type Mailboxes = Vec<Mutex<VecDeque<Vec<u8>>>>;

#[derive(Debug)]
struct ClusterShared {
    size: usize,
    output: PathBuf,
    particle_mail: Mailboxes,
    count_mail: Mailboxes,
    // Ranks write disjoint regions, but they share one file handle's
    // worth of create/seek traffic; serialize the whole write instead.
    file_lock: Mutex<()>,
}

/// In-process cluster: every rank lives in this process and exchanges
/// encoded messages through shared mailboxes.
pub struct LocalCluster;

impl LocalCluster {
    /// Builds a cluster of `size` ranks, returning one endpoint per rank
    /// in rank order.
    pub fn new(size: usize, output: impl Into<PathBuf>) -> Vec<LocalEndpoint> {
        assert!(size > 0, "cluster needs at least one rank");
        let mailboxes = |n: usize| -> Mailboxes {
            (0..n).map(|_| Mutex::new(VecDeque::new())).collect()
        };
        let shared = Arc::new(ClusterShared {
            size,
            output: output.into(),
            particle_mail: mailboxes(size * size),
            count_mail: mailboxes(size * size),
            file_lock: Mutex::new(()),
        });
        (0..size)
            .map(|rank| LocalEndpoint {
                rank,
                shared: Arc::clone(&shared),
                codec: WireCodec::new(),
            })
            .collect()
    }
}

/// One rank's handle onto a [`LocalCluster`].
pub struct LocalEndpoint {
    rank: usize,
    shared: Arc<ClusterShared>,
    codec: WireCodec,
}

impl LocalEndpoint {
    fn mailbox(mail: &Mailboxes, size: usize, from: usize, to: usize) -> &Mutex<VecDeque<Vec<u8>>> {
        &mail[from * size + to]
    }

    fn post(&self, mail: &Mailboxes, destination: usize, bytes: Vec<u8>) {
        let slot = Self::mailbox(mail, self.shared.size, self.rank, destination);
        slot.lock().expect("mailbox mutex poisoned").push_back(bytes);
    }

    fn take(&self, mail: &Mailboxes, from: usize) -> Option<Vec<u8>> {
        let slot = Self::mailbox(mail, self.shared.size, from, self.rank);
        slot.lock().expect("mailbox mutex poisoned").pop_front()
    }
}

impl Substrate for LocalEndpoint {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn send_particle(&mut self, destination: usize, particle: &Particle) -> Result<()> {
        let bytes = self.codec.encode_particle(particle)?;
        self.post(&self.shared.particle_mail, destination, bytes);
        Ok(())
    }

    fn try_recv_particle(&mut self, from: usize) -> Result<Option<Particle>> {
        match self.take(&self.shared.particle_mail, from) {
            Some(bytes) => Ok(Some(self.codec.decode_particle(&bytes)?)),
            None => Ok(None),
        }
    }

    fn send_count(&mut self, destination: usize, delta: u64) -> Result<()> {
        let bytes = self.codec.encode_count(delta)?;
        self.post(&self.shared.count_mail, destination, bytes);
        Ok(())
    }

    fn try_recv_count(&mut self, from: usize) -> Result<Option<u64>> {
        match self.take(&self.shared.count_mail, from) {
            Some(bytes) => Ok(Some(self.codec.decode_count(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write_histogram(&mut self, slab: &[u64], layout: &SlabLayout) -> Result<()> {
        anyhow::ensure!(
            slab.len() as u64 == layout.slab_len(),
            "slab holds {} elements, layout expects {}",
            slab.len(),
            layout.slab_len()
        );
        let _guard = self.shared.file_lock.lock().expect("dump mutex poisoned");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&self.shared.output)
            .with_context(|| format!("opening dump file {}", self.shared.output.display()))?;
        for k in 0..layout.block_count {
            let start = (k * layout.block_len) as usize;
            let block = &slab[start..start + layout.block_len as usize];
            file.seek(SeekFrom::Start(layout.block_offset(k) * SlabLayout::ELEM_BYTES))?;
            file.write_all(block.as_bytes())?;
        }
        Ok(())
    }
}

/// MPI-backed substrate: one rank per OS process, launched under
/// `mpirun`. Requires an MPI installation and the `mpi` feature.
#[cfg(feature = "mpi")]
pub mod mpi_world {
    use super::{Substrate, WireCodec};
    use crate::particle::Particle;
    use anyhow::{Context, Result};
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::*;
    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom, Write};
    use std::path::PathBuf;
    use walker_common::SlabLayout;
    use zerocopy::IntoBytes;

    // Message-kind tags; they keep the two streams from colliding.
    const PARTICLE_TAG: i32 = 1;
    const COUNT_TAG: i32 = 2;

    pub struct MpiWorld {
        // Finalizes MPI when the messenger thread drops the substrate.
        _universe: mpi::environment::Universe,
        world: SimpleCommunicator,
        codec: WireCodec,
        output: PathBuf,
    }

    impl MpiWorld {
        /// Joins the MPI world. Serialized threading matches the usage
        /// pattern: after startup only the messenger thread issues MPI
        /// calls.
        pub fn initialize(output: impl Into<PathBuf>) -> Result<Self> {
            let (universe, _threading) =
                mpi::initialize_with_threading(mpi::Threading::Serialized)
                    .context("MPI initialization failed (already initialized?)")?;
            let world = universe.world();
            Ok(Self {
                _universe: universe,
                world,
                codec: WireCodec::new(),
                output: output.into(),
            })
        }
    }

    impl Substrate for MpiWorld {
        fn rank(&self) -> usize {
            self.world.rank() as usize
        }

        fn size(&self) -> usize {
            self.world.size() as usize
        }

        fn send_particle(&mut self, destination: usize, particle: &Particle) -> Result<()> {
            let buf = self.codec.encode_particle(particle)?;
            // Blocking send from the messenger thread; the message is
            // small enough to buffer, and nothing else runs on this
            // thread anyway. TODO: move to immediate_send once the
            // request scope can outlive the dispatch call.
            self.world
                .process_at_rank(destination as i32)
                .send_with_tag(&buf[..], PARTICLE_TAG);
            Ok(())
        }

        fn try_recv_particle(&mut self, from: usize) -> Result<Option<Particle>> {
            let process = self.world.process_at_rank(from as i32);
            match process.immediate_matched_probe_with_tag(PARTICLE_TAG) {
                Some((message, _status)) => {
                    let (buf, _status) = message.matched_receive_vec::<u8>();
                    Ok(Some(self.codec.decode_particle(&buf)?))
                }
                None => Ok(None),
            }
        }

        fn send_count(&mut self, destination: usize, delta: u64) -> Result<()> {
            let buf = self.codec.encode_count(delta)?;
            self.world
                .process_at_rank(destination as i32)
                .send_with_tag(&buf[..], COUNT_TAG);
            Ok(())
        }

        fn try_recv_count(&mut self, from: usize) -> Result<Option<u64>> {
            let process = self.world.process_at_rank(from as i32);
            match process.immediate_matched_probe_with_tag(COUNT_TAG) {
                Some((message, _status)) => {
                    let (buf, _status) = message.matched_receive_vec::<u8>();
                    Ok(Some(self.codec.decode_count(&buf)?))
                }
                None => Ok(None),
            }
        }

        fn write_histogram(&mut self, slab: &[u64], layout: &SlabLayout) -> Result<()> {
            anyhow::ensure!(
                slab.len() as u64 == layout.slab_len(),
                "slab holds {} elements, layout expects {}",
                slab.len(),
                layout.slab_len()
            );
            // Every rank writes a disjoint strided region, so plain
            // positioned writes need no cross-process coordination.
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .open(&self.output)
                .with_context(|| format!("opening dump file {}", self.output.display()))?;
            for k in 0..layout.block_count {
                let start = (k * layout.block_len) as usize;
                let block = &slab[start..start + layout.block_len as usize];
                file.seek(SeekFrom::Start(layout.block_offset(k) * SlabLayout::ELEM_BYTES))?;
                file.write_all(block.as_bytes())?;
            }
            Ok(())
        }
    }
}
