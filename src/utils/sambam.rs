use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::path::{Path, PathBuf};
use log::{info, warn};
use crate::cli::PairMode;
use crate::config::defs::{PipelineError, FASTQ_EXT};
use crate::utils::fastx::{split_mate_tag, write_fastq_record, Mate};
use crate::utils::file::{open_reader, FileReader};

const FLAG_UNMAPPED: u16 = 0x4;
const FLAG_REVERSE: u16 = 0x10;
const FLAG_SECONDARY: u16 = 0x100;
const FLAG_SUPPLEMENTARY: u16 = 0x800;

/// The fields of one SAM line that reconciliation needs.
#[derive(Debug, Clone, PartialEq)]
pub struct SamRecord {
    pub name: String,
    pub flag: u16,
    pub seq: Vec<u8>,
    pub qual: Vec<u8>,
}

impl SamRecord {
    pub fn parse_line(line: &str) -> Result<Self, String> {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 11 {
            return Err(format!("expected at least 11 tab-separated fields, found {}", fields.len()));
        }
        let flag: u16 = fields[1]
            .parse()
            .map_err(|_| format!("invalid flag '{}'", fields[1]))?;
        let seq = fields[9].as_bytes().to_vec();
        let qual = if fields[10] == "*" {
            vec![b'I'; seq.len()]
        } else {
            fields[10].as_bytes().to_vec()
        };

        Ok(SamRecord {
            name: fields[0].to_string(),
            flag,
            seq,
            qual,
        })
    }

    pub fn aligned(&self) -> bool {
        self.flag & FLAG_UNMAPPED == 0
    }

    pub fn base_id(&self) -> &str {
        split_mate_tag(&self.name).0
    }

    pub fn mate(&self) -> Mate {
        split_mate_tag(&self.name).1
    }

    fn is_primary(&self) -> bool {
        self.flag & (FLAG_SECONDARY | FLAG_SUPPLEMENTARY) == 0
    }

    /// Sequence and quality in the orientation the read was sequenced in.
    pub fn original_orientation(&self) -> (Vec<u8>, Vec<u8>) {
        if self.flag & FLAG_REVERSE == 0 {
            return (self.seq.clone(), self.qual.clone());
        }
        let seq = self.seq.iter().rev().map(|&b| complement(b)).collect();
        let qual = self.qual.iter().rev().copied().collect();
        (seq, qual)
    }
}

fn complement(base: u8) -> u8 {
    match base {
        b'A' => b'T',
        b'T' => b'A',
        b'C' => b'G',
        b'G' => b'C',
        b'a' => b't',
        b't' => b'a',
        b'c' => b'g',
        b'g' => b'c',
        other => other,
    }
}

/// Primary-alignment records from a SAM file, with line numbers for error reporting.
pub struct SamStream {
    path: PathBuf,
    lines: Lines<BufReader<FileReader>>,
    line_no: u64,
}

impl SamStream {
    pub fn open(path: &Path) -> Result<Self, PipelineError> {
        let reader = open_reader(path)?;
        Ok(SamStream {
            path: path.to_path_buf(),
            lines: BufReader::new(reader).lines(),
            line_no: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Next primary record, skipping headers and secondary/supplementary lines.
    pub fn next_record(&mut self) -> Result<Option<(u64, SamRecord)>, PipelineError> {
        for line in self.lines.by_ref() {
            let line = line?;
            self.line_no += 1;
            if line.is_empty() || line.starts_with('@') {
                continue;
            }
            let record = SamRecord::parse_line(&line)
                .map_err(|msg| PipelineError::validation(self.path.display().to_string(), self.line_no, msg))?;
            if record.is_primary() {
                return Ok(Some((self.line_no, record)));
            }
        }
        Ok(None)
    }
}


/// Which bucket a read pair falls in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairClassification {
    BothAligned,
    BothUnaligned,
    OnlyFirstAligned,
    OnlySecondAligned,
}

pub fn classify_pair(first_aligned: bool, second_aligned: bool, mode: PairMode) -> PairClassification {
    match (first_aligned, second_aligned) {
        (true, true) => PairClassification::BothAligned,
        (false, false) => PairClassification::BothUnaligned,
        _ if mode == PairMode::Lenient => PairClassification::BothAligned,
        (true, false) => PairClassification::OnlyFirstAligned,
        (false, true) => PairClassification::OnlySecondAligned,
    }
}

/// The four output files for one mate.
#[derive(Debug, Clone, PartialEq)]
pub struct MateOutputs {
    pub paired_contam: PathBuf,
    pub paired_clean: PathBuf,
    pub unmatched_contam: PathBuf,
    pub unmatched_clean: PathBuf,
}

impl MateOutputs {
    pub fn new(out_dir: &Path, stem: &str, mate: usize) -> Self {
        MateOutputs {
            paired_contam: out_dir.join(format!("{}_paired_contam_{}.{}", stem, mate, FASTQ_EXT)),
            paired_clean: out_dir.join(format!("{}_paired_clean_{}.{}", stem, mate, FASTQ_EXT)),
            unmatched_contam: out_dir.join(format!("{}_unmatched_{}_contam.{}", stem, mate, FASTQ_EXT)),
            unmatched_clean: out_dir.join(format!("{}_unmatched_{}_clean.{}", stem, mate, FASTQ_EXT)),
        }
    }

    pub fn all(&self) -> [&PathBuf; 4] {
        [&self.paired_contam, &self.paired_clean, &self.unmatched_contam, &self.unmatched_clean]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOutputs {
    pub mate1: MateOutputs,
    pub mate2: MateOutputs,
}

impl ReconcileOutputs {
    /// `<out_dir>/<stem>_paired_contam_1.fastq` and friends.
    pub fn new(out_dir: &Path, stem: &str) -> Self {
        ReconcileOutputs {
            mate1: MateOutputs::new(out_dir, stem, 1),
            mate2: MateOutputs::new(out_dir, stem, 2),
        }
    }

    pub fn mate(&self, number: usize) -> &MateOutputs {
        if number == 2 { &self.mate2 } else { &self.mate1 }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileCounts {
    pub pairs: u64,
    pub both_aligned: u64,
    pub both_unaligned: u64,
    pub only_first_aligned: u64,
    pub only_second_aligned: u64,
    /// Records left over when one mate stream ran longer than the other.
    pub tail_aligned: u64,
    pub tail_unaligned: u64,
    pub orphans_aligned: u64,
    pub orphans_unaligned: u64,
}

impl ReconcileCounts {
    pub fn partition_total(&self) -> u64 {
        self.both_aligned + self.both_unaligned + self.only_first_aligned + self.only_second_aligned
    }
}

struct MateWriters {
    paired_contam: BufWriter<File>,
    paired_clean: BufWriter<File>,
    unmatched_contam: BufWriter<File>,
    unmatched_clean: BufWriter<File>,
}

impl MateWriters {
    fn create(outputs: &MateOutputs) -> Result<Self, PipelineError> {
        Ok(MateWriters {
            paired_contam: BufWriter::new(File::create(&outputs.paired_contam)?),
            paired_clean: BufWriter::new(File::create(&outputs.paired_clean)?),
            unmatched_contam: BufWriter::new(File::create(&outputs.unmatched_contam)?),
            unmatched_clean: BufWriter::new(File::create(&outputs.unmatched_clean)?),
        })
    }

    fn flush(&mut self) -> Result<(), PipelineError> {
        self.paired_contam.flush()?;
        self.paired_clean.flush()?;
        self.unmatched_contam.flush()?;
        self.unmatched_clean.flush()?;
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Role {
    PairedContam,
    PairedClean,
    UnmatchedContam,
    UnmatchedClean,
}

fn emit(writers: &mut MateWriters, role: Role, record: &SamRecord) -> Result<(), PipelineError> {
    let writer = match role {
        Role::PairedContam => &mut writers.paired_contam,
        Role::PairedClean => &mut writers.paired_clean,
        Role::UnmatchedContam => &mut writers.unmatched_contam,
        Role::UnmatchedClean => &mut writers.unmatched_clean,
    };
    let (seq, qual) = record.original_orientation();
    write_fastq_record(writer, &record.name, None, &seq, &qual)?;
    Ok(())
}

fn single_role(aligned: bool) -> Role {
    if aligned { Role::UnmatchedContam } else { Role::UnmatchedClean }
}

/// Walks independently aligned mate streams in lockstep and splits reads into
/// paired/unmatched, contaminant/clean files per mate.
///
/// # Arguments
///
/// * `mate1_sam` - SAM from aligning mate 1 reads as single-end.
/// * `mate2_sam` - SAM from aligning mate 2 reads, same read order as mate 1.
/// * `orphans_sam` - Optional SAM of reads without a mate.
/// * `mode` - Strict or lenient pair calling.
/// * `outputs` - The eight destination files.
///
/// # Returns
/// ReconcileCounts; errors with Validation if the mate streams fall out of step.
pub fn reconcile_pairs(
    mate1_sam: &Path,
    mate2_sam: &Path,
    orphans_sam: Option<&Path>,
    mode: PairMode,
    outputs: &ReconcileOutputs,
) -> Result<ReconcileCounts, PipelineError> {
    let mut first = SamStream::open(mate1_sam)?;
    let mut second = SamStream::open(mate2_sam)?;
    let mut w1 = MateWriters::create(&outputs.mate1)?;
    let mut w2 = MateWriters::create(&outputs.mate2)?;
    let mut counts = ReconcileCounts::default();

    loop {
        match (first.next_record()?, second.next_record()?) {
            (Some((line1, r1)), Some((line2, r2))) => {
                if r1.base_id() != r2.base_id() {
                    return Err(PipelineError::validation(
                        first.path().display().to_string(),
                        line1,
                        format!(
                            "read '{}' is paired with '{}' at {} line {}; mate files are out of sync",
                            r1.name,
                            r2.name,
                            second.path().display(),
                            line2
                        ),
                    ));
                }

                counts.pairs += 1;
                match classify_pair(r1.aligned(), r2.aligned(), mode) {
                    PairClassification::BothAligned => {
                        counts.both_aligned += 1;
                        emit(&mut w1, Role::PairedContam, &r1)?;
                        emit(&mut w2, Role::PairedContam, &r2)?;
                    }
                    PairClassification::BothUnaligned => {
                        counts.both_unaligned += 1;
                        emit(&mut w1, Role::PairedClean, &r1)?;
                        emit(&mut w2, Role::PairedClean, &r2)?;
                    }
                    PairClassification::OnlyFirstAligned => {
                        counts.only_first_aligned += 1;
                        emit(&mut w1, Role::UnmatchedContam, &r1)?;
                        emit(&mut w2, Role::UnmatchedClean, &r2)?;
                    }
                    PairClassification::OnlySecondAligned => {
                        counts.only_second_aligned += 1;
                        emit(&mut w1, Role::UnmatchedClean, &r1)?;
                        emit(&mut w2, Role::UnmatchedContam, &r2)?;
                    }
                }
            }
            (Some((line, r1)), None) => {
                warn!(
                    "{} has reads beyond the end of {} (from line {}); routing them as unpaired",
                    first.path().display(),
                    second.path().display(),
                    line
                );
                route_tail(r1, &mut first, &mut w1, &mut counts)?;
                break;
            }
            (None, Some((line, r2))) => {
                warn!(
                    "{} has reads beyond the end of {} (from line {}); routing them as unpaired",
                    second.path().display(),
                    first.path().display(),
                    line
                );
                route_tail(r2, &mut second, &mut w2, &mut counts)?;
                break;
            }
            (None, None) => break,
        }
    }

    if let Some(orphans) = orphans_sam {
        let mut stream = SamStream::open(orphans)?;
        while let Some((_, record)) = stream.next_record()? {
            let writers = if record.mate().number() == 2 { &mut w2 } else { &mut w1 };
            if record.aligned() {
                counts.orphans_aligned += 1;
            } else {
                counts.orphans_unaligned += 1;
            }
            emit(writers, single_role(record.aligned()), &record)?;
        }
    }

    w1.flush()?;
    w2.flush()?;

    info!(
        "Pairs: {} (both aligned {}, both unaligned {}, only mate 1 aligned {}, only mate 2 aligned {}); orphans aligned {}, unaligned {}",
        counts.pairs,
        counts.both_aligned,
        counts.both_unaligned,
        counts.only_first_aligned,
        counts.only_second_aligned,
        counts.orphans_aligned,
        counts.orphans_unaligned
    );
    Ok(counts)
}

fn route_tail(
    pending: SamRecord,
    stream: &mut SamStream,
    writers: &mut MateWriters,
    counts: &mut ReconcileCounts,
) -> Result<(), PipelineError> {
    let mut next = Some(pending);
    while let Some(record) = next {
        if record.aligned() {
            counts.tail_aligned += 1;
        } else {
            counts.tail_unaligned += 1;
        }
        emit(writers, single_role(record.aligned()), &record)?;
        next = stream.next_record()?.map(|(_, r)| r);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use crate::utils::fastx::read_all;
    use tempfile::tempdir;

    const HEADER: &str = "@HD\tVN:1.6\n@SQ\tSN:chrX\tLN:1000\n";

    fn sam_line(name: &str, flag: u16, seq: &str, qual: &str) -> String {
        format!("{}\t{}\tchrX\t1\t42\t4M\t*\t0\t0\t{}\t{}\n", name, flag, seq, qual)
    }

    fn write_sam(path: &Path, lines: &[String]) {
        let mut text = HEADER.to_string();
        for l in lines {
            text.push_str(l);
        }
        fs::write(path, text).unwrap();
    }

    /// Mate flags per pair: (mate 1 aligned, mate 2 aligned)
    fn pair_files(dir: &Path, pairs: &[(bool, bool)]) -> (PathBuf, PathBuf) {
        let flag = |aligned: bool| if aligned { 0 } else { 4 };
        let m1: Vec<String> = pairs.iter().enumerate()
            .map(|(i, (a, _))| sam_line(&format!("r{}/1", i), flag(*a), "ACGT", "ABCD"))
            .collect();
        let m2: Vec<String> = pairs.iter().enumerate()
            .map(|(i, (_, b))| sam_line(&format!("r{}/2", i), flag(*b), "TTGA", "EFGH"))
            .collect();
        let p1 = dir.join("m1.sam");
        let p2 = dir.join("m2.sam");
        write_sam(&p1, &m1);
        write_sam(&p2, &m2);
        (p1, p2)
    }

    #[test]
    fn test_classify_pair() {
        use PairClassification::*;
        assert_eq!(classify_pair(true, true, PairMode::Strict), BothAligned);
        assert_eq!(classify_pair(true, false, PairMode::Strict), OnlyFirstAligned);
        assert_eq!(classify_pair(false, true, PairMode::Strict), OnlySecondAligned);
        assert_eq!(classify_pair(false, false, PairMode::Lenient), BothUnaligned);
        assert_eq!(classify_pair(false, true, PairMode::Lenient), BothAligned);
    }

    #[test]
    fn test_parse_line_and_orientation() {
        let rec = SamRecord::parse_line("q/1\t16\tchr\t5\t60\t4M\t*\t0\t0\tAACG\tABCD").unwrap();
        assert!(rec.aligned());
        assert_eq!(rec.base_id(), "q");
        assert_eq!(rec.mate(), Mate::First);
        assert_eq!(rec.original_orientation(), (b"CGTT".to_vec(), b"DCBA".to_vec()));
        assert!(SamRecord::parse_line("q\t4\tchr").is_err());
        assert!(SamRecord::parse_line("q\tx\t*\t0\t0\t*\t*\t0\t0\tA\tI").is_err());
    }

    #[test]
    fn test_partition_invariant_and_monotonicity() -> anyhow::Result<()> {
        let pairs = [(true, true), (true, false), (false, true), (false, false), (false, false), (true, false)];
        let dir = tempdir()?;
        let (p1, p2) = pair_files(dir.path(), &pairs);

        let strict = reconcile_pairs(&p1, &p2, None, PairMode::Strict, &ReconcileOutputs::new(dir.path(), "strict"))?;
        let lenient = reconcile_pairs(&p1, &p2, None, PairMode::Lenient, &ReconcileOutputs::new(dir.path(), "lenient"))?;

        for counts in [&strict, &lenient] {
            assert_eq!(counts.pairs, pairs.len() as u64);
            assert_eq!(counts.partition_total(), counts.pairs);
        }
        assert_eq!(strict.both_aligned, 1);
        assert_eq!(strict.only_first_aligned, 2);
        assert_eq!(strict.only_second_aligned, 1);
        assert_eq!(strict.both_unaligned, 2);
        assert_eq!(lenient.both_aligned, 4);
        assert!(lenient.both_aligned >= strict.both_aligned);
        Ok(())
    }

    #[test]
    fn test_routing_to_files() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let (p1, p2) = pair_files(dir.path(), &[(true, true), (true, false), (false, false)]);
        let outputs = ReconcileOutputs::new(dir.path(), "s_db");
        reconcile_pairs(&p1, &p2, None, PairMode::Strict, &outputs)?;

        let ids = |p: &PathBuf| -> Vec<String> { read_all(p).unwrap().into_iter().map(|r| r.id).collect() };
        assert_eq!(ids(&outputs.mate1.paired_contam), vec!["r0/1"]);
        assert_eq!(ids(&outputs.mate2.paired_contam), vec!["r0/2"]);
        assert_eq!(ids(&outputs.mate1.unmatched_contam), vec!["r1/1"]);
        assert_eq!(ids(&outputs.mate2.unmatched_clean), vec!["r1/2"]);
        assert_eq!(ids(&outputs.mate1.paired_clean), vec!["r2/1"]);
        assert_eq!(ids(&outputs.mate2.paired_clean), vec!["r2/2"]);
        assert!(ids(&outputs.mate2.unmatched_contam).is_empty());

        let written = read_all(&outputs.mate2.paired_clean)?;
        assert_eq!(written[0].seq, b"TTGA".to_vec());
        assert_eq!(written[0].qual, b"EFGH".to_vec());
        Ok(())
    }

    #[test]
    fn test_desynchronized_streams_fail() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let p1 = dir.path().join("a.sam");
        let p2 = dir.path().join("b.sam");
        write_sam(&p1, &[sam_line("r0/1", 0, "ACGT", "IIII"), sam_line("r1/1", 4, "ACGT", "IIII")]);
        write_sam(&p2, &[sam_line("r0/2", 0, "ACGT", "IIII"), sam_line("r9/2", 4, "ACGT", "IIII")]);

        let err = reconcile_pairs(&p1, &p2, None, PairMode::Strict, &ReconcileOutputs::new(dir.path(), "x")).unwrap_err();
        match err {
            PipelineError::Validation { file, line, message } => {
                assert!(file.ends_with("a.sam"));
                assert_eq!(line, 4);
                assert!(message.contains("r9/2"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_uneven_streams_and_orphans() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let p1 = dir.path().join("a.sam");
        let p2 = dir.path().join("b.sam");
        let orphans = dir.path().join("o.sam");
        write_sam(&p1, &[
            sam_line("r0/1", 4, "ACGT", "IIII"),
            sam_line("r1/1", 0, "ACGT", "IIII"),
            sam_line("r1/1", 256, "ACGT", "IIII"),
            sam_line("r2/1", 4, "ACGT", "IIII"),
        ]);
        write_sam(&p2, &[sam_line("r0/2", 4, "ACGT", "IIII")]);
        write_sam(&orphans, &[sam_line("o1/2", 0, "GG", "II"), sam_line("o2", 4, "CC", "II")]);

        let outputs = ReconcileOutputs::new(dir.path(), "t");
        let counts = reconcile_pairs(&p1, &p2, Some(&orphans), PairMode::Strict, &outputs)?;
        assert_eq!(counts.pairs, 1);
        assert_eq!(counts.partition_total(), 1);
        assert_eq!((counts.tail_aligned, counts.tail_unaligned), (1, 1));
        assert_eq!((counts.orphans_aligned, counts.orphans_unaligned), (1, 1));

        let ids = |p: &PathBuf| -> Vec<String> { read_all(p).unwrap().into_iter().map(|r| r.id).collect() };
        assert_eq!(ids(&outputs.mate1.unmatched_contam), vec!["r1/1"]);
        assert_eq!(ids(&outputs.mate1.unmatched_clean), vec!["r2/1", "o2"]);
        assert_eq!(ids(&outputs.mate2.unmatched_contam), vec!["o1/2"]);
        Ok(())
    }
}
