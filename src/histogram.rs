/// Per-rank tally of finished particles.
///
/// Three-dimensional table indexed by `(local_x, local_y, origin_rank)`
/// with the origin axis innermost; `local_*` are coordinates relative to
/// the owning region's lower corner. Only the simulation thread of the
/// owning rank ever touches it, so it needs no locking.
#[derive(Debug, Clone)]
pub struct Histogram {
    bound: i32,
    ranks: usize,
    counts: Vec<u64>,
}

impl Histogram {
    pub fn new(bound: i32, ranks: usize) -> Self {
        let cells = bound as usize * bound as usize;
        Self {
            bound,
            ranks,
            counts: vec![0; cells * ranks],
        }
    }

    /// Records one finished particle. The coordinates must already be
    /// region-local; anything else means a particle was routed to the
    /// wrong rank, which is a logic defect worth dying for.
    pub fn record(&mut self, local_x: i32, local_y: i32, origin: i32) {
        assert!(
            local_x >= 0 && local_x < self.bound,
            "finished particle local x {} outside region (bound {})",
            local_x,
            self.bound
        );
        assert!(
            local_y >= 0 && local_y < self.bound,
            "finished particle local y {} outside region (bound {})",
            local_y,
            self.bound
        );
        assert!(
            origin >= 0 && (origin as usize) < self.ranks,
            "finished particle origin rank {} out of range ({} ranks)",
            origin,
            self.ranks
        );
        let index =
            (local_x as usize * self.bound as usize + local_y as usize) * self.ranks
                + origin as usize;
        self.counts[index] += 1;
    }

    /// Sum over every cell and origin.
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// The raw table in `(x, y, origin)` order, as written to the dump.
    pub fn counts(&self) -> &[u64] {
        &self.counts
    }
}
