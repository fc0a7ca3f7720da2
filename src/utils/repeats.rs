// Tandem-repeat filtering: FASTQ -> FASTA -> repeat finder -> filter/mask.
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use anyhow::anyhow;
use log::{debug, info, warn};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, UnboundedReceiverStream};
use tokio_stream::StreamExt;
use crate::config::defs::{PipelineError, CHANNEL_BUFFER, TRF_DEFAULT_OPTIONS, TRF_STDIN};
use crate::utils::fastx::{fastq_reader, write_fasta_record, write_fastq_record, ReadRecord};
use crate::utils::scheduler::JobFailure;
use crate::utils::streams::{join_with_error_handling, spawn_stderr_collector};

/// External repeat finder invocation. The finder must read FASTA on stdin and
/// write `@<header>` lines each followed by `start end ...` span lines.
#[derive(Debug, Clone, PartialEq)]
pub struct RepeatFinder {
    pub program: String,
    pub args: Vec<String>,
}

impl RepeatFinder {
    /// `trf /dev/stdin <options>`, with the default parameter set when none are given.
    pub fn trf(program: &str, options: Option<Vec<String>>) -> Self {
        let mut args = vec![TRF_STDIN.to_string()];
        match options {
            Some(opts) if !opts.is_empty() => args.extend(opts),
            _ => args.extend(TRF_DEFAULT_OPTIONS.iter().map(|s| s.to_string())),
        }
        RepeatFinder { program: program.to_string(), args }
    }

    fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A read the finder reported, with 1-based inclusive repeat spans.
#[derive(Debug, Clone, PartialEq)]
pub struct RepeatGroup {
    pub header: String,
    pub spans: Vec<(usize, usize)>,
}

/// Where filtered and masked reads go; at least one must be set.
#[derive(Debug, Clone, Default)]
pub struct RepeatOutputs {
    pub filtered: Option<PathBuf>,
    pub masked: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RepeatStats {
    pub reads: u64,
    pub with_repeats: u64,
    pub filtered_written: u64,
    pub masked_written: u64,
}

/// Replaces every span (1-based, inclusive, clamped to the read) with `N`.
pub fn mask_spans(seq: &[u8], spans: &[(usize, usize)]) -> Vec<u8> {
    let mut masked = seq.to_vec();
    for &(start, end) in spans {
        let from = start.saturating_sub(1).min(masked.len());
        let to = end.min(masked.len());
        if from < to {
            masked[from..to].fill(b'N');
        }
    }
    masked
}

/// Parses the numeric start/end at the head of a span line.
fn parse_span(line: &str) -> Option<(usize, usize)> {
    let mut fields = line.split_whitespace();
    let start = fields.next()?.parse().ok()?;
    let end = fields.next()?.parse().ok()?;
    Some((start, end))
}

/// Stage 1: FASTQ in, FASTA chunks to the finder feed, records to the lookup queue.
fn fastq_to_fasta(
    input: PathBuf,
    fasta_tx: mpsc::Sender<Vec<u8>>,
    record_tx: mpsc::UnboundedSender<ReadRecord>,
) -> Result<u64, PipelineError> {
    let mut reader = fastq_reader(&input)?;
    let mut count = 0u64;
    while let Some(result) = reader.next() {
        let record = result.map_err(|e| {
            PipelineError::validation(input.display().to_string(), count * 4 + 1, e.to_string())
        })?;
        let record = ReadRecord::from(record.to_owned_record());

        let mut fasta = Vec::with_capacity(record.id.len() + record.seq.len() + 3);
        write_fasta_record(&mut fasta, &record.id, &record.seq)?;
        if record_tx.send(record).is_err() {
            // Filter stage already stopped; its error is reported there.
            break;
        }
        if fasta_tx.blocking_send(fasta).is_err() {
            return Err(PipelineError::Other(anyhow!("Repeat finder stopped reading its input")));
        }
        count += 1;
    }
    Ok(count)
}

async fn feed_finder(mut stdin: ChildStdin, fasta_rx: mpsc::Receiver<Vec<u8>>) -> Result<(), PipelineError> {
    let mut chunks = ReceiverStream::new(fasta_rx);
    while let Some(chunk) = chunks.next().await {
        stdin.write_all(&chunk).await?;
    }
    stdin.flush().await?;
    // Dropping stdin closes the pipe: EOF for the finder.
    Ok(())
}

/// Stage 2: finder stdout into header/spans groups. Stdout is read to the end even
/// once the filter stops listening, so the finder can always exit.
async fn parse_finder_output(stdout: ChildStdout, group_tx: mpsc::UnboundedSender<RepeatGroup>) -> Result<u64, PipelineError> {
    let mut lines = BufReader::new(stdout).lines();
    let mut current: Option<RepeatGroup> = None;
    let mut groups = 0u64;
    let mut listening = true;

    while let Some(line) = lines.next_line().await? {
        if let Some(header) = line.strip_prefix('@') {
            if let Some(done) = current.take() {
                groups += 1;
                if listening && group_tx.send(done).is_err() {
                    debug!("Repeat filter stopped; discarding the rest of the finder output");
                    listening = false;
                }
            }
            let header = header.split_whitespace().next().unwrap_or_default().to_string();
            current = Some(RepeatGroup { header, spans: Vec::new() });
        } else if let Some(span) = parse_span(&line) {
            match current.as_mut() {
                Some(group) => group.spans.push(span),
                None => debug!("Ignoring repeat finder line before any header: {}", line),
            }
        }
    }
    if let Some(done) = current.take() {
        groups += 1;
        if listening {
            // Send failure means the filter has finished; nothing left to deliver to.
            let _ = group_tx.send(done);
        }
    }
    Ok(groups)
}

struct RepeatWriters {
    filtered: Option<BufWriter<File>>,
    masked: Option<BufWriter<File>>,
}

fn create(path: &Option<PathBuf>) -> Result<Option<BufWriter<File>>, PipelineError> {
    Ok(match path {
        Some(p) => Some(BufWriter::new(File::create(p)?)),
        None => None,
    })
}

fn emit(writer: &mut BufWriter<File>, input: &Path, index: u64, record: &ReadRecord, seq: &[u8]) -> Result<(), PipelineError> {
    if seq.len() != record.qual.len() {
        return Err(PipelineError::validation(
            input.display().to_string(),
            index * 4 + 1,
            format!(
                "read '{}' has {} bases but {} quality values",
                record.id,
                seq.len(),
                record.qual.len()
            ),
        ));
    }
    write_fastq_record(writer, &record.id, record.desc.as_deref(), seq, &record.qual)?;
    Ok(())
}

/// Runs the three-stage repeat pipeline over one FASTQ.
///
/// Reads without a reported repeat are written unchanged to both outputs. Reads with
/// repeats are left out of `filtered` and written to `masked` with each span as `N`.
///
/// # Arguments
///
/// * `input` - FASTQ to filter.
/// * `finder` - Repeat finder program and arguments.
/// * `outputs` - Filtered and/or masked destinations.
///
/// # Returns
/// RepeatStats
pub async fn remove_repeats(
    input: &Path,
    finder: &RepeatFinder,
    outputs: &RepeatOutputs,
) -> Result<RepeatStats, PipelineError> {
    if outputs.filtered.is_none() && outputs.masked.is_none() {
        return Err(PipelineError::Configuration("Repeat removal needs a filtered or masked output".to_string()));
    }

    let scratch = TempDir::new()
        .map_err(|e| PipelineError::Resource(format!("Cannot create repeat finder scratch directory: {}", e)))?;

    info!("Running {}", finder.command_line());
    let mut child = Command::new(&finder.program)
        .args(&finder.args)
        .current_dir(scratch.path())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| PipelineError::Configuration(format!("Failed to spawn {}: {}", finder.program, e)))?;

    let stdin = child.stdin.take().ok_or_else(|| anyhow!("Repeat finder stdin not piped"))?;
    let stdout = child.stdout.take().ok_or_else(|| anyhow!("Repeat finder stdout not piped"))?;
    let stderr_task = spawn_stderr_collector(&mut child)?;

    let (fasta_tx, fasta_rx) = mpsc::channel(CHANNEL_BUFFER);
    let (record_tx, record_rx) = mpsc::unbounded_channel();
    let (group_tx, group_rx) = mpsc::unbounded_channel();

    let source = input.to_path_buf();
    let convert_task = tokio::task::spawn_blocking(move || fastq_to_fasta(source, fasta_tx, record_tx));
    let feed_task = tokio::spawn(feed_finder(stdin, fasta_rx));
    let parse_task = tokio::spawn(parse_finder_output(stdout, group_tx));

    let mut writers = RepeatWriters {
        filtered: create(&outputs.filtered)?,
        masked: create(&outputs.masked)?,
    };
    let mut records = UnboundedReceiverStream::new(record_rx);
    let mut groups = UnboundedReceiverStream::new(group_rx);
    let mut pending: Option<RepeatGroup> = None;
    let mut groups_open = true;
    let mut stats = RepeatStats::default();

    while let Some(record) = records.next().await {
        if pending.is_none() && groups_open {
            pending = groups.next().await;
            groups_open = pending.is_some();
        }

        match pending.take() {
            Some(group) if group.header == record.id => {
                stats.with_repeats += 1;
                if let Some(w) = writers.masked.as_mut() {
                    emit(w, input, stats.reads, &record, &mask_spans(&record.seq, &group.spans))?;
                    stats.masked_written += 1;
                }
            }
            other => {
                pending = other;
                if let Some(w) = writers.filtered.as_mut() {
                    emit(w, input, stats.reads, &record, &record.seq)?;
                    stats.filtered_written += 1;
                }
                if let Some(w) = writers.masked.as_mut() {
                    emit(w, input, stats.reads, &record, &record.seq)?;
                    stats.masked_written += 1;
                }
            }
        }
        stats.reads += 1;
    }

    for w in [writers.filtered.as_mut(), writers.masked.as_mut()].into_iter().flatten() {
        w.flush()?;
    }

    // Anything still queued was never matched to a read.
    let mut leftover: Vec<RepeatGroup> = pending.into_iter().collect();
    if groups_open {
        while let Some(group) = groups.next().await {
            leftover.push(group);
        }
    }
    drop(groups);

    let converted = join_with_error_handling(convert_task).await;
    let fed = join_with_error_handling(feed_task).await;
    let parsed = join_with_error_handling(parse_task).await;
    let status = child.wait().await?;
    let stderr = stderr_task
        .await
        .map_err(|e| anyhow!("Repeat finder stderr task failed: {}", e))??;

    if !status.success() {
        warn!("{} exited with {}; stderr:\n{}", finder.program, status, stderr.join("\n"));
        return Err(PipelineError::ToolFailure {
            failures: vec![JobFailure {
                name: "repeat finder".to_string(),
                command: finder.command_line(),
                exit_code: status.code(),
                reason: stderr.last().cloned().unwrap_or_else(|| "no output".to_string()),
            }],
        });
    }
    converted?;
    fed?;
    let reported = parsed?;

    if let Some(group) = leftover.first() {
        return Err(PipelineError::validation(
            input.display().to_string(),
            stats.reads * 4,
            format!(
                "repeat finder reported read '{}' out of order or not present in the input ({} group(s) unmatched)",
                group.header,
                leftover.len()
            ),
        ));
    }

    if let Err(e) = scratch.close() {
        warn!("{}", PipelineError::Resource(format!("Failed to remove repeat finder scratch directory: {}", e)));
    }

    info!(
        "Repeat finder flagged {} of {} reads ({} groups reported)",
        stats.with_repeats, stats.reads, reported
    );
    Ok(stats)
}
