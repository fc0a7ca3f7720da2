use std::io;
use std::path::Path;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use crate::utils::fastx::{fastq_writer, ReadRecord};
use crate::utils::file::WriteToFile;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DNA {
    A,
    C,
    G,
    T,
}

impl DNA {
    /// Convert nucleotide to its byte representation.
    pub fn to_byte(&self) -> u8 {
        match self {
            DNA::A => b'A',
            DNA::C => b'C',
            DNA::G => b'G',
            DNA::T => b'T',
        }
    }

    /// Get all possible nucleotides as a static slice.
    pub fn all() -> &'static [DNA] {
        &[DNA::A, DNA::C, DNA::G, DNA::T]
    }

    /// Generate a random sequence of nucleotides of the given length.
    pub fn random_sequence<R: Rng>(rng: &mut R, length: usize) -> Vec<u8> {
        (0..length)
            .map(|_| DNA::all().choose(rng).map_or(b'N', DNA::to_byte))
            .collect()
    }
}

/// Creates a reproducible RNG; `None` seeds from the OS.
pub fn generate_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_os_rng(),
    }
}

fn phred33(score: u8) -> u8 {
    score + 33
}

/// Phred+33 qualities drawn from a normal distribution, clamped to 0..=40.
pub fn normal_phred_qual_string<R: Rng>(rng: &mut R, length: usize, mean: f32, stdev: f32) -> Vec<u8> {
    let normal = match Normal::new(mean, stdev) {
        Ok(n) => n,
        Err(_) => return vec![phred33(mean.clamp(0.0, 40.0) as u8); length],
    };
    (0..length)
        .map(|_| phred33(normal.sample(rng).clamp(0.0, 40.0) as u8))
        .collect()
}

/// Random reads named `<prefix><n>` with an optional `/1` `/2` tag.
pub fn synthetic_reads<R: Rng>(rng: &mut R, prefix: &str, count: usize, length: usize, mate: Option<u8>) -> Vec<ReadRecord> {
    (0..count)
        .map(|i| {
            let id = match mate {
                Some(m) => format!("{}{}/{}", prefix, i, m),
                None => format!("{}{}", prefix, i),
            };
            let seq = DNA::random_sequence(rng, length);
            let qual = normal_phred_qual_string(rng, length, 30.0, 5.0);
            ReadRecord::new(&id, None, &seq, &qual)
        })
        .collect()
}

/// A read made of one short unit repeated to `length`.
pub fn tandem_repeat_read(id: &str, unit: &[u8], length: usize) -> ReadRecord {
    let seq: Vec<u8> = unit.iter().copied().cycle().take(length).collect();
    ReadRecord::new(id, None, &seq, &vec![b'I'; seq.len()])
}

pub fn write_reads(path: &Path, reads: &[ReadRecord]) -> io::Result<()> {
    let mut writer = fastq_writer(path)?;
    for read in reads {
        read.write_to_file(&mut writer)?;
    }
    io::Write::flush(&mut writer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_sequence() {
        let mut rng = generate_rng(Some(7));
        let seq = DNA::random_sequence(&mut rng, 10);
        assert_eq!(seq.len(), 10);
        assert!(seq.iter().all(|c| b"ACGT".contains(c)));
    }

    #[test]
    fn test_synthetic_reads_are_reproducible() {
        let a = synthetic_reads(&mut generate_rng(Some(42)), "r", 5, 50, Some(1));
        let b = synthetic_reads(&mut generate_rng(Some(42)), "r", 5, 50, Some(1));
        assert_eq!(a, b);
        assert_eq!(a[3].id, "r3/1");
        assert!(a.iter().all(|r| r.seq.len() == r.qual.len()));
        assert!(a[0].qual.iter().all(|&q| (33..=73).contains(&q)));
    }

    #[test]
    fn test_tandem_repeat_read() {
        let r = tandem_repeat_read("rep", b"CA", 7);
        assert_eq!(r.seq, b"CACACAC".to_vec());
        assert_eq!(r.qual.len(), 7);
    }
}
