// Combines per-database outputs into one read set: clean reads must survive every
// database (intersection), contaminants from any database are kept once (union).

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use fxhash::{FxHashMap as HashMap, FxHashSet as HashSet};
use log::{debug, info};
use crate::config::defs::PipelineError;
use seq_io::fastq::Record;
use crate::utils::fastx::{fastq_reader, record_counter, split_mate_tag};
use crate::utils::file::{is_gzipped, move_file, open_reader, remove_files, FileWriter};

/// Occurrence counts keyed by raw record bytes, each file counted at most once.
#[derive(Default)]
pub struct MergeSet {
    // key -> (files seen in, index of the last file that bumped it)
    counts: HashMap<Vec<u8>, (usize, usize)>,
}

impl MergeSet {
    pub fn new() -> Self {
        MergeSet::default()
    }

    /// Records `key` as present in file `file_idx`. Repeats within the same file are ignored.
    pub fn observe(&mut self, key: Vec<u8>, file_idx: usize) {
        let entry = self.counts.entry(key).or_insert((0, usize::MAX));
        if entry.1 != file_idx {
            entry.0 += 1;
            entry.1 = file_idx;
        }
    }

    /// Like `observe`, but only for keys already present.
    pub fn observe_existing(&mut self, key: &[u8], file_idx: usize) {
        if let Some(entry) = self.counts.get_mut(key) {
            if entry.1 != file_idx {
                entry.0 += 1;
                entry.1 = file_idx;
            }
        }
    }

    pub fn count(&self, key: &[u8]) -> usize {
        self.counts.get(key).map_or(0, |e| e.0)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeKind {
    Intersection,
    Union,
}

/// Record counts before and after a merge.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeStats {
    pub inputs: Vec<u64>,
    pub output: u64,
}

/// Calls `f` with each record's id and its bytes exactly as stored in the FASTQ
/// (after gzip decoding), returning the record count.
pub fn scan_raw_fastq<F>(path: &Path, mut f: F) -> Result<u64, PipelineError>
where
    F: FnMut(&str, &[u8]) -> Result<(), PipelineError>,
{
    let mut reader = fastq_reader(path)?;
    let mut raw = Vec::new();
    let mut count = 0u64;
    while let Some(result) = reader.next() {
        let line = count * 4 + 1;
        let record = result.map_err(|e| PipelineError::validation(path.display().to_string(), line, e.to_string()))?;
        let id = record
            .id()
            .map_err(|e| PipelineError::validation(path.display().to_string(), line, e.to_string()))?;
        raw.clear();
        record.write_unchanged(&mut raw)?;
        f(id, &raw)?;
        count += 1;
    }
    Ok(count)
}

/// Keeps records present in every input, in the order (and multiplicity) of the first input.
///
/// # Arguments
///
/// * `inputs` - Clean FASTQ from each database, one mate.
/// * `output` - Merged FASTQ.
///
/// # Returns
/// MergeStats with each input's record count and the number written.
pub fn intersect_fastq(inputs: &[PathBuf], output: &Path) -> Result<MergeStats, PipelineError> {
    let first = inputs
        .first()
        .ok_or_else(|| PipelineError::Configuration("Nothing to intersect".to_string()))?;

    let mut set = MergeSet::new();
    let mut stats = MergeStats::default();
    stats.inputs.push(scan_raw_fastq(first, |_, raw| {
        set.observe(raw.to_vec(), 0);
        Ok(())
    })?);
    for (idx, path) in inputs.iter().enumerate().skip(1) {
        stats.inputs.push(scan_raw_fastq(path, |_, raw| {
            set.observe_existing(raw, idx);
            Ok(())
        })?);
    }

    let mut writer = FileWriter::create(output, is_gzipped(first)?)?;
    let needed = inputs.len();
    scan_raw_fastq(first, |_, raw| {
        if set.count(raw) == needed {
            writer.write_all(raw)?;
            stats.output += 1;
        }
        Ok(())
    })?;
    writer.finish()?;

    debug!("Intersection kept {} of {} distinct records", stats.output, set.len());
    Ok(stats)
}

/// One copy of every distinct record across the inputs, in order of first appearance.
pub fn union_fastq(inputs: &[PathBuf], output: &Path) -> Result<MergeStats, PipelineError> {
    let mut seen: HashSet<Vec<u8>> = HashSet::default();
    let mut stats = MergeStats::default();
    let gzip = match inputs.first() {
        Some(first) => is_gzipped(first)?,
        None => false,
    };
    let mut writer = FileWriter::create(output, gzip)?;

    for path in inputs {
        let n = scan_raw_fastq(path, |_, raw| {
            if !seen.contains(raw) {
                writer.write_all(raw)?;
                seen.insert(raw.to_vec());
                stats.output += 1;
            }
            Ok(())
        })?;
        stats.inputs.push(n);
    }
    writer.finish()?;
    Ok(stats)
}

fn read_ids(path: &Path) -> Result<Vec<String>, PipelineError> {
    let reader = BufReader::new(open_reader(path)?);
    let mut ids = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let id = line.trim();
        if !id.is_empty() {
            ids.push(id.to_string());
        }
    }
    Ok(ids)
}

/// Union of identifier lists, one identifier per line, first appearance order.
pub fn union_id_lists(inputs: &[PathBuf], output: &Path) -> Result<MergeStats, PipelineError> {
    let mut seen: HashSet<String> = HashSet::default();
    let mut stats = MergeStats::default();
    let mut writer = BufWriter::new(File::create(output)?);

    for path in inputs {
        let ids = read_ids(path)?;
        stats.inputs.push(ids.len() as u64);
        for id in ids {
            if seen.insert(id.clone()) {
                writeln!(writer, "{}", id)?;
                stats.output += 1;
            }
        }
    }
    writer.flush()?;
    Ok(stats)
}

/// Splits a FASTQ into clean and contaminant files using a contaminant id list.
/// A read matches on its full name or its name without a `/1` `/2` tag.
///
/// # Returns
/// Tuple: (clean count, contaminant count).
pub fn filter_by_id_list(
    input: &Path,
    id_list: &Path,
    clean_out: &Path,
    contam_out: &Path,
) -> Result<(u64, u64), PipelineError> {
    let mut ids: HashSet<String> = HashSet::default();
    for id in read_ids(id_list)? {
        ids.insert(split_mate_tag(&id).0.to_string());
        ids.insert(id);
    }

    let gzip = is_gzipped(input)?;
    let mut clean = FileWriter::create(clean_out, gzip)?;
    let mut contam = FileWriter::create(contam_out, gzip)?;
    let (mut n_clean, mut n_contam) = (0u64, 0u64);
    scan_raw_fastq(input, |id, raw| {
        if ids.contains(id) || ids.contains(split_mate_tag(id).0) {
            contam.write_all(raw)?;
            n_contam += 1;
        } else {
            clean.write_all(raw)?;
            n_clean += 1;
        }
        Ok(())
    })?;
    clean.finish()?;
    contam.finish()?;
    Ok((n_clean, n_contam))
}

fn count_entries(path: &Path, is_fastq: bool) -> Result<u64, PipelineError> {
    if is_fastq {
        Ok(record_counter(path)?)
    } else {
        Ok(read_ids(path)?.len() as u64)
    }
}

/// Merges one mate's per-database files into `output`.
///
/// A single input is moved (or copied, when intermediates are kept) into place.
/// Otherwise the inputs are intersected or unioned and then deleted unless `keep_intermediates`.
///
/// # Arguments
///
/// * `kind` - Intersection for clean reads, union for contaminants.
/// * `inputs` - Per-database files, all FASTQ or all id lists.
/// * `output` - Destination.
/// * `keep_intermediates` - Leave the per-database files on disk.
///
/// # Returns
/// MergeStats
pub fn merge_files(
    kind: MergeKind,
    inputs: &[PathBuf],
    output: &Path,
    keep_intermediates: bool,
) -> Result<MergeStats, PipelineError> {
    if inputs.is_empty() {
        return Err(PipelineError::Configuration(format!(
            "No per-database files to merge into {}",
            output.display()
        )));
    }
    let is_fastq = !inputs[0]
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case(crate::config::defs::ID_LIST_EXT));

    let stats = if inputs.len() == 1 {
        let n = count_entries(&inputs[0], is_fastq)?;
        if keep_intermediates {
            fs::copy(&inputs[0], output)?;
        } else {
            move_file(&inputs[0], output)?;
        }
        MergeStats { inputs: vec![n], output: n }
    } else {
        let stats = match (kind, is_fastq) {
            (MergeKind::Intersection, true) => intersect_fastq(inputs, output)?,
            (MergeKind::Union, true) => union_fastq(inputs, output)?,
            (MergeKind::Union, false) => union_id_lists(inputs, output)?,
            (MergeKind::Intersection, false) => {
                return Err(PipelineError::Configuration(
                    "Identifier lists can only be merged by union".to_string(),
                ));
            }
        };
        if !keep_intermediates {
            remove_files(inputs);
        }
        stats
    };

    info!(
        "Merged {} file(s) into {} ({:?}): {:?} -> {}",
        inputs.len(),
        output.display(),
        kind,
        stats.inputs,
        stats.output
    );
    Ok(stats)
}

/// Groups per-database outputs by mate, keeping only files that exist.
///
/// # Arguments
///
/// * `per_database` - For each database, its planned outputs in mate order.
///
/// # Returns
/// One Vec per mate holding that mate's file from every database; FormatMismatch
/// if a mate's file exists for some databases but not all.
pub fn group_by_mate(per_database: &[Vec<PathBuf>]) -> Result<Vec<Vec<PathBuf>>, PipelineError> {
    let mates = per_database.iter().map(Vec::len).max().unwrap_or(0);
    let mut grouped = Vec::with_capacity(mates);

    for mate in 0..mates {
        let present: Vec<PathBuf> = per_database
            .iter()
            .filter_map(|files| files.get(mate))
            .filter(|p| p.is_file())
            .cloned()
            .collect();
        if present.is_empty() {
            continue;
        }
        if present.len() != per_database.len() {
            return Err(PipelineError::FormatMismatch(format!(
                "mate {} output exists for {} of {} databases",
                mate + 1,
                present.len(),
                per_database.len()
            )));
        }
        grouped.push(present);
    }
    Ok(grouped)
}
