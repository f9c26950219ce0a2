//! Reads the engine's shared histogram dump back through the same slab
//! layout the ranks used to write it, and reports where particles
//! finished and which rank they came from.

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use walker_common::{RankGrid, SlabLayout};
use zerocopy::IntoBytes;

/// Command-line arguments for the inspector
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Histogram dump produced by the engine
    input: PathBuf,

    /// Region side length the run used
    bound: u32,

    /// Rank grid width the run used
    width: u32,

    /// Rank grid height the run used
    height: u32,

    /// Also print per-origin counts for every rank
    #[arg(long)]
    per_origin: bool,

    /// Export (finishing_rank, origin_rank, count) rows as CSV
    #[arg(long)]
    csv: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();
    anyhow::ensure!(
        args.bound > 0 && args.width > 0 && args.height > 0,
        "domain dimensions must be positive"
    );
    let grid = RankGrid::new(args.bound, args.width, args.height);

    let bytes = fs::read(&args.input)
        .with_context(|| format!("reading dump file {}", args.input.display()))?;
    anyhow::ensure!(
        bytes.len() % SlabLayout::ELEM_BYTES as usize == 0,
        "dump length {} is not a whole number of u64 elements",
        bytes.len()
    );
    // The file is native-endian; view it in place as u64s.
    let mut elems = vec![0u64; bytes.len() / SlabLayout::ELEM_BYTES as usize];
    elems.as_mut_bytes().copy_from_slice(&bytes);

    let required = SlabLayout::required_file_len(&grid) as usize;
    anyhow::ensure!(
        elems.len() >= required,
        "dump holds {} elements but a {}x{} grid with bound {} needs {}; wrong dimensions?",
        elems.len(),
        args.width,
        args.height,
        args.bound,
        required
    );
    if elems.len() != required {
        warn!(
            "dump holds {} elements beyond the {} this layout addresses",
            elems.len() - required,
            required
        );
    }

    let ranks = grid.rank_count();
    let mut matrix = Vec::with_capacity(ranks);
    let mut grand_total = 0u64;
    for rank in 0..ranks {
        let layout = SlabLayout::for_rank(&grid, rank);
        let slab = gather_slab(&elems, &layout);
        let by_origin = origin_totals(&slab, ranks);
        let total: u64 = by_origin.iter().sum();
        grand_total += total;

        println!(
            "rank {} (row {}, col {}): {} finished",
            rank,
            rank / args.width as usize,
            rank % args.width as usize,
            total
        );
        if args.per_origin {
            for (origin, count) in by_origin.iter().enumerate() {
                if *count > 0 {
                    println!("  from origin {}: {}", origin, count);
                }
            }
        }
        matrix.push(by_origin);
    }
    println!("total finished particles: {}", grand_total);

    if let Some(path) = &args.csv {
        write_csv(path, &matrix)?;
        info!("origin matrix exported to {}", path.display());
    }
    Ok(())
}

/// Collects one rank's slab out of the strided shared file.
fn gather_slab(elems: &[u64], layout: &SlabLayout) -> Vec<u64> {
    let mut slab = Vec::with_capacity(layout.slab_len() as usize);
    for k in 0..layout.block_count {
        let start = layout.block_offset(k) as usize;
        slab.extend_from_slice(&elems[start..start + layout.block_len as usize]);
    }
    slab
}

/// Sums a slab over its cells, leaving one total per origin rank. The
/// origin axis is innermost in the dump layout.
fn origin_totals(slab: &[u64], ranks: usize) -> Vec<u64> {
    let mut totals = vec![0u64; ranks];
    for (index, count) in slab.iter().enumerate() {
        totals[index % ranks] += count;
    }
    totals
}

fn write_csv(path: &Path, matrix: &[Vec<u64>]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("creating CSV file {}", path.display()))?;
    writer.write_record(["finishing_rank", "origin_rank", "count"])?;
    for (rank, by_origin) in matrix.iter().enumerate() {
        for (origin, count) in by_origin.iter().enumerate() {
            writer.write_record(&[rank.to_string(), origin.to_string(), count.to_string()])?;
        }
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_inverts_the_interleaved_write() {
        // Two ranks, bound 2: blocks of 4 elements alternate between the
        // ranks through the file.
        let grid = RankGrid::new(2, 2, 1);
        let elems: Vec<u64> = vec![1, 2, 3, 4, 11, 12, 13, 14, 5, 6, 7, 8, 15, 16, 17, 18];
        let left = gather_slab(&elems, &SlabLayout::for_rank(&grid, 0));
        let right = gather_slab(&elems, &SlabLayout::for_rank(&grid, 1));
        assert_eq!(left, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(right, vec![11, 12, 13, 14, 15, 16, 17, 18]);
    }

    #[test]
    fn origin_totals_fold_the_innermost_axis() {
        let slab = vec![1, 10, 2, 20, 3, 30];
        assert_eq!(origin_totals(&slab, 2), vec![6, 60]);
    }
}
