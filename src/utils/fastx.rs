use seq_io::fastq::{Reader as FastqReader, Record, OwnedRecord as FastqOwnedRecord};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::collections::HashMap;
use lazy_static::lazy_static;
use regex::Regex;
use crate::utils::file::{extension_remover, open_reader, FileReader, WriteToFile};

lazy_static! {
    static ref R1_R2_TAGS: HashMap<&'static str, &'static str> = {
        let mut m = HashMap::new();
        m.insert("R1", "R2");
        m.insert("r1", "r2");
        m.insert("1", "2");
        m.insert("PE1", "PE2");
        m.insert("pe1", "pe2");
        m.insert("READ1", "READ2");
        m.insert("read1", "read2");
        m
    };

    static ref MATE_SUFFIX: Regex = Regex::new(r"^(.+)/([12])$").unwrap();
}

/// Which read of a fragment a record is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mate {
    None,
    First,
    Second,
}

impl Mate {
    /// 1 or 2; untagged reads are treated as mate 1.
    pub fn number(&self) -> usize {
        match self {
            Mate::Second => 2,
            _ => 1,
        }
    }
}

/// Splits a trailing `/1` or `/2` off a read name.
///
/// # Arguments
///
/// * `name` - Read name as written by the sequencer or aligner.
///
/// # Returns
/// Tuple: (name without mate tag, mate).
pub fn split_mate_tag(name: &str) -> (&str, Mate) {
    match MATE_SUFFIX.captures(name) {
        Some(caps) => {
            let base = caps.get(1).map_or(name, |m| m.as_str());
            let mate = match caps.get(2).map(|m| m.as_str()) {
                Some("1") => Mate::First,
                _ => Mate::Second,
            };
            (base, mate)
        }
        None => (name, Mate::None),
    }
}

/// A FASTQ read. Built once from a file and only ever copied out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRecord {
    pub id: String,
    pub desc: Option<String>,
    pub mate: Mate,
    pub seq: Vec<u8>,
    pub qual: Vec<u8>,
}

impl ReadRecord {
    pub fn new(id: &str, desc: Option<&str>, seq: &[u8], qual: &[u8]) -> Self {
        let (_, mate) = split_mate_tag(id);
        ReadRecord {
            id: id.to_string(),
            desc: desc.map(String::from),
            mate,
            seq: seq.to_vec(),
            qual: qual.to_vec(),
        }
    }
}

impl From<FastqOwnedRecord> for ReadRecord {
    fn from(record: FastqOwnedRecord) -> Self {
        let (id, desc) = parse_header(&record.head, '@');
        let (_, mate) = split_mate_tag(&id);
        ReadRecord {
            id,
            desc,
            mate,
            seq: record.seq,
            qual: record.qual,
        }
    }
}

impl WriteToFile for ReadRecord {
    fn write_to_file<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        write_fastq_record(writer, &self.id, self.desc.as_deref(), &self.seq, &self.qual)
    }
}

/// Opens a FASTQ file (plain or gzipped) with seq_io.
pub fn fastq_reader(path: &Path) -> io::Result<FastqReader<FileReader>> {
    Ok(FastqReader::new(open_reader(path)?))
}

pub fn fastq_writer(path: &Path) -> io::Result<BufWriter<File>> {
    Ok(BufWriter::new(File::create(path)?))
}

pub fn write_fasta_record<W: Write>(
    writer: &mut W,
    id: &str,
    seq: &[u8],
) -> io::Result<()> {
    writer.write_all(b">")?;
    writer.write_all(id.as_bytes())?;
    writer.write_all(b"\n")?;
    // Unwrapped: the repeat finder reads one sequence line per record
    writer.write_all(seq)?;
    writer.write_all(b"\n")?;
    Ok(())
}

pub fn write_fastq_record<W: Write>(
    writer: &mut W,
    id: &str,
    desc: Option<&str>,
    seq: &[u8],
    qual: &[u8],
) -> io::Result<()> {
    // Write header
    writer.write_all(b"@")?;
    writer.write_all(id.as_bytes())?;
    if let Some(desc) = desc {
        writer.write_all(b" ")?;
        writer.write_all(desc.as_bytes())?;
    }
    writer.write_all(b"\n")?;

    // Write sequence
    writer.write_all(seq)?;
    writer.write_all(b"\n")?;

    // Write separator
    writer.write_all(b"+")?;
    writer.write_all(b"\n")?;

    // Write quality scores
    writer.write_all(qual)?;
    writer.write_all(b"\n")?;
    Ok(())
}


/// Parses a FASTX header.
///
///
/// # Arguments
///
/// * `head` - Header line of a FASTX record.
/// * 'prefix' - Leading, defining character of the header. > for FASTA, @ for FASTQ.
///
/// # Returns
/// Tuple: (id, desc) split of header on whitespace.
///
pub fn parse_header(head: &[u8], prefix: char) -> (String, Option<String>) {
    let head_str = String::from_utf8_lossy(head).into_owned();
    let parts: Vec<&str> = head_str.splitn(2, |c: char| c.is_whitespace()).collect();
    let id = parts[0].trim_start_matches(prefix).to_string();
    let desc = parts.get(1).map(|s| s.to_string()).filter(|s| !s.is_empty());
    (id, desc)
}


/// Counts the number of records in a FASTQ.
///
///
/// # Arguments
///
/// * `path` - Valid path to a fastq file.
///
/// # Returns
/// u64: Number of records in the FASTQ.
///
pub fn record_counter(path: &Path) -> io::Result<u64> {
    let mut counter = 0;
    let mut reader = fastq_reader(path)?;
    while let Some(result) = reader.next() {
        result.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        counter += 1;
    }
    Ok(counter)
}

/// Reads every record of a small FASTQ into memory. Test and summary helper.
pub fn read_all(path: &Path) -> io::Result<Vec<ReadRecord>> {
    let reader = fastq_reader(path)?;
    reader
        .into_records()
        .map(|r| r.map(ReadRecord::from).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)))
        .collect()
}

/// Derives a sample name from an input file, dropping R1-style tags and extensions.
///
/// # Arguments
///
/// * `path` - Input FASTQ path.
///
/// # Returns
/// String sample base, e.g. `sampleA` for `sampleA_R1.fastq.gz`.
pub fn sample_base(path: &Path) -> String {
    let delimiters = ['_', '.', '-'];
    let (stem, _) = extension_remover(path);
    let filename = match stem.file_name().and_then(|n| n.to_str()) {
        Some(name) => name.to_string(),
        None => return "sample".to_string(),
    };

    for &delimiter in delimiters.iter() {
        let parts: Vec<&str> = filename.split(delimiter).collect();
        for (index, part) in parts.iter().enumerate() {
            if index > 0 && R1_R2_TAGS.contains_key(part) {
                return parts[..index].join(&delimiter.to_string());
            }
        }
    }
    filename
}
