use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, warn};


/// Enum to hold either an uncompressed or gzipped file reader
pub enum FileReader {
    Uncompressed(BufReader<File>),
    Gzipped(MultiGzDecoder<BufReader<File>>),
}

impl Read for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            FileReader::Uncompressed(r) => r.read(buf),
            FileReader::Gzipped(r) => r.read(buf),
        }
    }
}

pub trait WriteToFile {
    fn write_to_file<W: Write>(&self, writer: &mut W) -> io::Result<()>;
}

pub fn is_gzipped(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut buffer = [0u8; 2];
    match file.read_exact(&mut buffer) {
        Ok(()) => Ok(buffer == [0x1F, 0x8B]), // Gzip magic bytes
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Opens a file for reading, transparently decompressing gzip.
pub fn open_reader(path: &Path) -> io::Result<FileReader> {
    let file = File::open(path)?;
    if is_gzipped(path)? {
        Ok(FileReader::Gzipped(MultiGzDecoder::new(BufReader::new(file))))
    } else {
        Ok(FileReader::Uncompressed(BufReader::new(file)))
    }
}

/// Writer counterpart of `FileReader`; gzip output must be closed with `finish`.
pub enum FileWriter {
    Uncompressed(BufWriter<File>),
    Gzipped(GzEncoder<BufWriter<File>>),
}

impl FileWriter {
    pub fn create(path: &Path, gzip: bool) -> io::Result<Self> {
        let file = BufWriter::new(File::create(path)?);
        Ok(if gzip {
            FileWriter::Gzipped(GzEncoder::new(file, Compression::default()))
        } else {
            FileWriter::Uncompressed(file)
        })
    }

    pub fn finish(self) -> io::Result<()> {
        match self {
            FileWriter::Uncompressed(mut w) => w.flush(),
            FileWriter::Gzipped(w) => w.finish()?.flush(),
        }
    }
}

impl Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            FileWriter::Uncompressed(w) => w.write(buf),
            FileWriter::Gzipped(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            FileWriter::Uncompressed(w) => w.flush(),
            FileWriter::Gzipped(w) => w.flush(),
        }
    }
}

/// Peels known sequence/compression extensions off a path.
/// `dir/sample_R1.fastq.gz` -> (`dir/sample_R1`, ["fastq", "gz"])
///
/// # Arguments
///
/// * `path` - Any file path.
///
/// # Returns
/// Tuple: (path without extensions, extensions in order).
pub fn extension_remover(path: &Path) -> (PathBuf, Vec<String>) {
    const KNOWN: &[&str] = &["gz", "bz2", "fastq", "fq", "fasta", "fa", "sam", "txt"];
    let mut stem = path.to_path_buf();
    let mut extensions = Vec::new();
    while let Some(ext) = stem.extension().and_then(|e| e.to_str()).map(String::from) {
        if !KNOWN.iter().any(|k| k.eq_ignore_ascii_case(&ext)) {
            break;
        }
        stem.set_extension("");
        extensions.insert(0, ext);
    }
    (stem, extensions)
}


/// Builds an output path from a base, an optional directory, prefix and suffix.
///
/// # Arguments
///
/// * `base` - File whose stem is used.
/// * `dir` - Directory to place the result in; defaults to the directory of `base`.
/// * `prefix` - Prepended to the stem.
/// * `suffix` - Appended to the stem.
/// * `delimiter` - Placed between prefix/stem/suffix.
///
/// # Returns
/// PathBuf of the new file.
pub fn file_path_manipulator(
    base: &Path,
    dir: Option<&Path>,
    prefix: Option<&str>,
    suffix: Option<&str>,
    delimiter: &str,
) -> PathBuf {
    let stem = base
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut name = String::new();
    if let Some(p) = prefix {
        name.push_str(p);
        name.push_str(delimiter);
    }
    name.push_str(&stem);
    if let Some(s) = suffix {
        name.push_str(delimiter);
        name.push_str(s);
    }

    match dir {
        Some(d) => d.join(name),
        None => base.with_file_name(name),
    }
}

/// Resolves a possibly relative path against `cwd`.
pub fn absolute_path(path: &Path, cwd: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

/// Moves a file into place, falling back to copy + remove across filesystems.
pub fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
        Err(e) => Err(e),
    }
}

/// Best-effort removal of intermediate files. Failures are logged, never returned.
pub fn remove_files<P: AsRef<Path>>(paths: &[P]) {
    for path in paths {
        let path = path.as_ref();
        if !path.exists() {
            continue;
        }
        match fs::remove_file(path) {
            Ok(()) => debug!("Removed intermediate file {}", path.display()),
            Err(e) => warn!("Unable to remove intermediate file {}: {}", path.display(), e),
        }
    }
}

/// Path for writing output that is only renamed into `final_path` once complete.
pub fn partial_path(final_path: &Path) -> PathBuf {
    let mut name = final_path
        .file_name()
        .map(|s| s.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    final_path.with_file_name(name)
}
