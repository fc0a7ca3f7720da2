use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use log::{debug, info, warn};
use tokio::task;
use crate::cli::Tool;
use crate::cli::args::split_options;
use crate::config::defs::{tool_tag, PipelineError, RunConfig, FASTQ_EXT, ID_LIST_EXT};
use crate::utils::command::{check_versions, resolve_databases, CommandBuilder, DatabasePlan, PlannedOutputs};
use crate::utils::fastx::{record_counter, sample_base};
use crate::utils::file::{absolute_path, extension_remover, move_file, partial_path, remove_files};
use crate::utils::merge::{filter_by_id_list, group_by_mate, merge_files, MergeKind, MergeStats};
use crate::utils::repeats::{remove_repeats, RepeatFinder, RepeatOutputs};
use crate::utils::sambam::{reconcile_pairs, ReconcileOutputs};
use crate::utils::scheduler::run_jobs;
use crate::utils::streams::join_with_error_handling;
use crate::utils::system::scratch_dir;

/// Validated input files and the prefix every output is named with.
#[derive(Debug)]
struct RunInputs {
    reads: Vec<PathBuf>,
    orphans: Option<PathBuf>,
    prefix: String,
    /// `<out>/<prefix>_tmp`: per-database tool outputs before merging.
    work_dir: PathBuf,
}

impl RunInputs {
    fn paired(&self) -> bool {
        self.reads.len() == 2
    }
}

/// Final outputs are written under `<name>.partial` and renamed only once the run succeeds.
#[derive(Default)]
struct Staged {
    files: Vec<(PathBuf, PathBuf)>,
}

impl Staged {
    fn stage(&mut self, final_path: PathBuf) -> PathBuf {
        let partial = partial_path(&final_path);
        self.files.push((partial.clone(), final_path));
        partial
    }

    /// Renames every partial into place. If one rename fails, files already
    /// renamed and the remaining partials are removed so no partial set is left.
    fn commit(self) -> Result<Vec<PathBuf>, PipelineError> {
        let mut finals = Vec::with_capacity(self.files.len());
        let mut files = self.files.into_iter();
        while let Some((partial, final_path)) = files.next() {
            if let Err(e) = move_file(&partial, &final_path) {
                let mut leftover: Vec<PathBuf> = std::iter::once(partial).chain(files.map(|(p, _)| p)).collect();
                leftover.append(&mut finals);
                remove_files(&leftover);
                return Err(e.into());
            }
            finals.push(final_path);
        }
        Ok(finals)
    }

    fn abandon(self) {
        let partials: Vec<PathBuf> = self.files.into_iter().map(|(p, _)| p).collect();
        remove_files(&partials);
    }
}

/// Per-stage read counts, written as `<prefix>_summary.tsv`.
#[derive(Debug, Default)]
pub struct RunSummary {
    rows: Vec<(String, String, u64)>,
}

impl RunSummary {
    pub fn add(&mut self, stage: &str, name: &str, reads: u64) {
        info!("{:<24} {:<48} {}", stage, name, reads);
        self.rows.push((stage.to_string(), name.to_string(), reads));
    }

    pub fn write(&self, path: &Path) -> Result<(), PipelineError> {
        let mut writer = BufWriter::new(File::create(path)?);
        writeln!(writer, "stage\tname\treads")?;
        for (stage, name, reads) in &self.rows {
            writeln!(writer, "{}\t{}\t{}", stage, name, reads)?;
        }
        writer.flush()?;
        Ok(())
    }
}

fn existing_file(raw: &str, cwd: &Path, label: &str) -> Result<PathBuf, PipelineError> {
    let path = absolute_path(Path::new(raw), cwd);
    if !path.is_file() {
        return Err(PipelineError::Configuration(format!("Cannot find {}: {}", label, path.display())));
    }
    Ok(path)
}

fn validate_inputs(config: &RunConfig) -> Result<RunInputs, PipelineError> {
    let args = &config.args;
    let mut reads = vec![existing_file(&args.file1, &config.cwd, "file 1 (-i)")?];
    if let Some(file2) = &args.file2 {
        reads.push(existing_file(file2, &config.cwd, "file 2 (-I)")?);
    }

    let orphans = match &args.orphans {
        Some(o) if args.discordant => Some(existing_file(o, &config.cwd, "orphan reads")?),
        Some(_) => {
            warn!("--orphans is only used with --discordant; ignoring it");
            None
        }
        None => None,
    };

    if args.discordant {
        if !args.paired() {
            return Err(PipelineError::Configuration("--discordant requires paired input (-I)".to_string()));
        }
        if args.tool != Tool::Bowtie2 {
            return Err(PipelineError::Configuration("--discordant is only supported with bowtie2".to_string()));
        }
    }
    if args.processes == 0 {
        return Err(PipelineError::Configuration("--processes must be at least 1".to_string()));
    }
    if args.reference_db.is_empty() {
        return Err(PipelineError::Configuration("At least one --reference-db is required".to_string()));
    }

    let prefix = args
        .output_prefix
        .clone()
        .unwrap_or_else(|| sample_base(&reads[0]));
    let work_dir = config.out_dir.join(format!("{}_tmp", prefix));
    Ok(RunInputs { reads, orphans, prefix, work_dir })
}

fn final_path(out_dir: &Path, prefix: &str, role: &str, mate: Option<usize>, ext: &str) -> PathBuf {
    match mate {
        Some(m) => out_dir.join(format!("{}_{}_{}.{}", prefix, role, m, ext)),
        None => out_dir.join(format!("{}_{}.{}", prefix, role, ext)),
    }
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

async fn count_reads(path: PathBuf) -> Result<u64, PipelineError> {
    join_with_error_handling(task::spawn_blocking(move || -> Result<u64, PipelineError> {
        Ok(record_counter(&path)?)
    }))
    .await
}

async fn merge_blocking(kind: MergeKind, inputs: Vec<PathBuf>, output: PathBuf, keep: bool) -> Result<MergeStats, PipelineError> {
    join_with_error_handling(task::spawn_blocking(move || merge_files(kind, &inputs, &output, keep))).await
}

/// Merges concordant/single-end aligner outputs. Returns the staged clean files.
async fn merge_read_outputs(
    config: &RunConfig,
    inputs: &RunInputs,
    plans: &[DatabasePlan],
    staged: &mut Staged,
    summary: &mut RunSummary,
) -> Result<Vec<PathBuf>, PipelineError> {
    let keep = config.args.store_temp_output;
    let mut per_db_clean = Vec::new();
    let mut per_db_contam = Vec::new();
    for plan in plans {
        if let PlannedOutputs::Reads { clean, contam } = &plan.outputs {
            per_db_clean.push(clean.clone());
            per_db_contam.push(contam.clone());
        }
    }

    let mut cleans = Vec::new();
    for (role, kind, per_db) in [
        ("clean", MergeKind::Intersection, per_db_clean),
        ("contam", MergeKind::Union, per_db_contam),
    ] {
        for (idx, group) in group_by_mate(&per_db)?.into_iter().enumerate() {
            let mate = inputs.paired().then_some(idx + 1);
            let labels: Vec<String> = group.iter().map(|p| file_label(p)).collect();
            let target = final_path(&config.out_dir, &inputs.prefix, role, mate, FASTQ_EXT);
            let partial = staged.stage(target.clone());
            let stats = merge_blocking(kind, group, partial.clone(), keep).await?;
            for ((plan, label), n) in plans.iter().zip(&labels).zip(&stats.inputs) {
                summary.add(&format!("{}:{}", plan.database.name, role), label, *n);
            }
            summary.add(&format!("merged:{}", role), &file_label(&target), stats.output);
            if kind == MergeKind::Intersection {
                cleans.push(partial);
            }
        }
    }
    Ok(cleans)
}

/// Unions tagger id lists, then splits each input by the combined list.
async fn merge_id_list_outputs(
    config: &RunConfig,
    inputs: &RunInputs,
    plans: &[DatabasePlan],
    staged: &mut Staged,
    summary: &mut RunSummary,
) -> Result<Vec<PathBuf>, PipelineError> {
    let lists: Vec<Vec<PathBuf>> = plans
        .iter()
        .filter_map(|plan| match &plan.outputs {
            PlannedOutputs::IdList { contam_ids } => Some(vec![contam_ids.clone()]),
            _ => None,
        })
        .collect();

    let ids_final = final_path(&config.out_dir, &inputs.prefix, "contam_ids", None, ID_LIST_EXT);
    let ids_partial = staged.stage(ids_final.clone());
    match group_by_mate(&lists)?.into_iter().next() {
        Some(group) => {
            let stats = merge_blocking(MergeKind::Union, group, ids_partial.clone(), config.args.store_temp_output).await?;
            summary.add("merged:contam_ids", &file_label(&ids_final), stats.output);
        }
        None => {
            warn!("No contaminant id lists were written; treating every read as clean");
            File::create(&ids_partial)?;
            summary.add("merged:contam_ids", &file_label(&ids_final), 0);
        }
    }

    let mut cleans = Vec::new();
    for (idx, input) in inputs.reads.iter().enumerate() {
        let mate = inputs.paired().then_some(idx + 1);
        let clean_final = final_path(&config.out_dir, &inputs.prefix, "clean", mate, FASTQ_EXT);
        let contam_final = final_path(&config.out_dir, &inputs.prefix, "contam", mate, FASTQ_EXT);
        let clean = staged.stage(clean_final.clone());
        let contam = staged.stage(contam_final.clone());

        let (source, ids, c, k) = (input.clone(), ids_partial.clone(), clean.clone(), contam.clone());
        let (n_clean, n_contam) = join_with_error_handling(task::spawn_blocking(move || {
            filter_by_id_list(&source, &ids, &c, &k)
        }))
        .await?;
        summary.add("merged:clean", &file_label(&clean_final), n_clean);
        summary.add("merged:contam", &file_label(&contam_final), n_contam);
        cleans.push(clean);
    }
    Ok(cleans)
}

/// Reconciles per-mate alignments for each database, then merges the eight
/// role files across databases.
async fn reconcile_alignment_outputs(
    config: &RunConfig,
    inputs: &RunInputs,
    plans: &[DatabasePlan],
    staged: &mut Staged,
    summary: &mut RunSummary,
) -> Result<Vec<PathBuf>, PipelineError> {
    let keep = config.args.store_temp_output;
    let mode = config.args.pair_mode;
    let mut per_db = Vec::new();

    for plan in plans {
        let PlannedOutputs::Alignments { mate1, mate2, orphans } = &plan.outputs else {
            continue;
        };
        let outputs = ReconcileOutputs::new(&inputs.work_dir, &format!("{}_{}", inputs.prefix, plan.database.name));
        let (m1, m2, o, out) = (mate1.clone(), mate2.clone(), orphans.clone(), outputs.clone());
        let counts = join_with_error_handling(task::spawn_blocking(move || {
            reconcile_pairs(&m1, &m2, o.as_deref(), mode, &out)
        }))
        .await?;

        let name = &plan.database.name;
        summary.add(&format!("{}:pairs", name), "both_aligned", counts.both_aligned);
        summary.add(&format!("{}:pairs", name), "both_unaligned", counts.both_unaligned);
        summary.add(&format!("{}:pairs", name), "only_mate1_aligned", counts.only_first_aligned);
        summary.add(&format!("{}:pairs", name), "only_mate2_aligned", counts.only_second_aligned);
        if counts.tail_aligned + counts.tail_unaligned > 0 {
            summary.add(&format!("{}:unpaired_tail", name), "aligned", counts.tail_aligned);
            summary.add(&format!("{}:unpaired_tail", name), "unaligned", counts.tail_unaligned);
        }
        if inputs.orphans.is_some() {
            summary.add(&format!("{}:orphans", name), "aligned", counts.orphans_aligned);
            summary.add(&format!("{}:orphans", name), "unaligned", counts.orphans_unaligned);
        }

        if !keep {
            let mut sams = vec![mate1.clone(), mate2.clone()];
            sams.extend(orphans.iter().cloned());
            remove_files(&sams);
        }
        per_db.push(outputs);
    }

    let finals = ReconcileOutputs::new(&config.out_dir, &inputs.prefix);
    let mut cleans = Vec::new();
    for mate in [1, 2] {
        for (idx, target) in finals.mate(mate).all().into_iter().enumerate() {
            // all() order: paired_contam, paired_clean, unmatched_contam, unmatched_clean
            let kind = if idx % 2 == 1 { MergeKind::Intersection } else { MergeKind::Union };
            let group: Vec<PathBuf> = per_db.iter().map(|o| o.mate(mate).all()[idx].clone()).collect();
            let partial = staged.stage(target.clone());
            let stats = merge_blocking(kind, group, partial.clone(), keep).await?;
            summary.add("merged", &file_label(target), stats.output);
            if kind == MergeKind::Intersection {
                cleans.push(partial);
            }
        }
    }
    Ok(cleans)
}

/// Filters (and optionally masks) tandem repeats in each staged clean file.
async fn repeat_filter(
    config: &RunConfig,
    inputs: &RunInputs,
    cleans: &[PathBuf],
    staged: &mut Staged,
    summary: &mut RunSummary,
) -> Result<(), PipelineError> {
    let args = &config.args;
    let finder = RepeatFinder::trf(&args.trf_path, Some(split_options(args.trf_options.as_deref())));
    if inputs.paired() && args.remove_repeats {
        warn!("Repeat removal filters each mate file on its own; mates of removed reads are kept");
    }

    for partial in cleans {
        let target = partial.with_extension("");
        let (stem, _) = extension_remover(&target);
        let filtered = args.remove_repeats.then(|| {
            inputs
                .work_dir
                .join(format!("{}_repeats_removed.{}", file_label(&stem), FASTQ_EXT))
        });
        let masked = args.mask_repeats.then(|| {
            staged.stage(PathBuf::from(format!("{}_repeats_masked.{}", stem.display(), FASTQ_EXT)))
        });

        let outputs = RepeatOutputs { filtered: filtered.clone(), masked };
        let stats = remove_repeats(partial, &finder, &outputs).await?;
        if let Some(f) = filtered {
            move_file(&f, partial)?;
            summary.add("repeats:kept", &file_label(&target), stats.reads - stats.with_repeats);
        }
        if args.mask_repeats {
            summary.add("repeats:masked", &file_label(&target), stats.with_repeats);
        }
    }
    Ok(())
}

async fn process(
    config: &RunConfig,
    inputs: &RunInputs,
    plans: &[DatabasePlan],
    staged: &mut Staged,
    summary: &mut RunSummary,
) -> Result<(), PipelineError> {
    for read_file in inputs.reads.iter().chain(inputs.orphans.iter()) {
        let n = count_reads(read_file.clone()).await?;
        summary.add("input", &file_label(read_file), n);
    }

    let jobs = plans.iter().flat_map(|p| p.jobs.iter().cloned()).collect();
    let report = run_jobs(jobs, config.args.processes).await?;
    info!(
        "{} job(s) finished, at most {} ran at once",
        report.results.len(),
        report.peak_running
    );

    let cleans = match plans.first().map(|p| &p.outputs) {
        Some(PlannedOutputs::Alignments { .. }) => {
            reconcile_alignment_outputs(config, inputs, plans, staged, summary).await?
        }
        Some(PlannedOutputs::IdList { .. }) => merge_id_list_outputs(config, inputs, plans, staged, summary).await?,
        _ => merge_read_outputs(config, inputs, plans, staged, summary).await?,
    };

    if config.args.remove_repeats || config.args.mask_repeats {
        repeat_filter(config, inputs, &cleans, staged, summary).await?;
    }
    Ok(())
}

/// Removes the per-database work directory unless intermediates are kept.
fn clean_work_dir(work_dir: &Path, keep: bool) {
    if !work_dir.exists() {
        return;
    }
    if keep {
        info!("Intermediate files kept in {}", work_dir.display());
        return;
    }
    match fs::remove_dir_all(work_dir) {
        Ok(()) => debug!("Removed {}", work_dir.display()),
        Err(e) => warn!("Unable to remove {}: {}", work_dir.display(), e),
    }
}

/// Runs the planned jobs through to committed outputs and the run summary.
/// On any failure the staged outputs are removed; either way the work directory
/// is cleaned up unless intermediates are kept.
async fn execute(config: &RunConfig, inputs: &RunInputs, plans: &[DatabasePlan]) -> Result<Vec<PathBuf>, PipelineError> {
    fs::create_dir_all(&inputs.work_dir)?;
    let mut staged = Staged::default();
    let mut summary = RunSummary::default();

    let result = match process(config, inputs, plans, &mut staged, &mut summary).await {
        Ok(()) => {
            let summary_path = staged.stage(final_path(&config.out_dir, &inputs.prefix, "summary", None, "tsv"));
            match summary.write(&summary_path) {
                Ok(()) => staged.commit(),
                Err(e) => {
                    staged.abandon();
                    Err(e)
                }
            }
        }
        Err(e) => {
            staged.abandon();
            Err(e)
        }
    };

    clean_work_dir(&inputs.work_dir, config.args.store_temp_output);
    result
}

/// Run function for the decontamination pipeline
///
/// # Arguments
///
/// * `config` - RunConfig struct from main.
///
/// # Returns
/// Result<(), PipelineError>
pub async fn run(config: Arc<RunConfig>) -> Result<(), PipelineError> {
    let args = &config.args;
    let inputs = validate_inputs(&config)?;

    // External tools check
    let tool_flag: &[&str] = match args.tool {
        Tool::Bowtie2 => &["--version"],
        Tool::Bmtagger => &["-h"],
    };
    let mut tools: Vec<(&str, &[&str])> = vec![(tool_tag(args.tool), tool_flag)];
    let trf_flag: &[&str] = &["-v"];
    if args.remove_repeats || args.mask_repeats {
        tools.push((args.trf_path.as_str(), trf_flag));
    }
    check_versions(&tools).await?;

    let db_paths: Vec<PathBuf> = args
        .reference_db
        .iter()
        .map(|db| absolute_path(Path::new(db), &config.cwd))
        .collect();
    let databases = resolve_databases(&db_paths, args.tool)?;

    let scratch = scratch_dir(&config.ram_temp_dir, "readscrub_")?;
    let threads = (config.max_cores / args.processes).clamp(1, args.threads.max(1));
    info!("{} thread(s) per job, {} job(s) at a time", threads, args.processes);

    let builder = CommandBuilder::new(args.tool, &inputs.work_dir, &inputs.prefix, threads, args.tool_options())
        .with_scratch_dir(scratch.path());
    let plans = if args.discordant {
        builder.build_discordant(&inputs.reads[0], &inputs.reads[1], inputs.orphans.as_deref(), &databases)?
    } else {
        builder.build(&inputs.reads, &databases)?
    };

    let committed = execute(&config, &inputs, &plans).await;
    if let Err(e) = scratch.close() {
        warn!("{}", PipelineError::Resource(format!("Failed to remove scratch directory: {}", e)));
    }
    for path in committed? {
        info!("Wrote {}", path.display());
    }
    Ok(())
}
