// Functions and structs for building external tool command lines, one job per database.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use anyhow::anyhow;
use log::{debug, info};
use tokio::process::Command;
use crate::cli::Tool;
use crate::config::defs::{PipelineError, DB_EXTENSIONS, FASTQ_EXT, ID_LIST_EXT, SAM_EXT, tool_label, tool_tag};
use crate::utils::file::file_path_manipulator;
use crate::utils::streams::{read_child_output_to_vec, ChildStream};

/// One scheduled external-tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseJob {
    pub name: String,
    pub database: String,
    /// Full argv, program first.
    pub args: Vec<String>,
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
    pub primary_output: Option<PathBuf>,
}

impl DatabaseJob {
    pub fn program(&self) -> &str {
        self.args.first().map(String::as_str).unwrap_or_default()
    }

    pub fn command_line(&self) -> String {
        self.args.join(" ")
    }
}

/// What a database's jobs leave behind, by role.
#[derive(Debug, Clone, PartialEq)]
pub enum PlannedOutputs {
    /// Reads split by the aligner itself; one entry per mate.
    Reads { clean: Vec<PathBuf>, contam: Vec<PathBuf> },
    /// Contaminant read names only (bmtagger).
    IdList { contam_ids: PathBuf },
    /// Per-mate SAM streams for discordant reconciliation.
    Alignments { mate1: PathBuf, mate2: PathBuf, orphans: Option<PathBuf> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatabasePlan {
    pub database: ResolvedDatabase,
    pub jobs: Vec<DatabaseJob>,
    pub outputs: PlannedOutputs,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedDatabase {
    /// Index basename the companion files hang off.
    pub index: PathBuf,
    /// Unique name used in output file names.
    pub name: String,
}

pub struct CommandBuilder {
    pub tool: Tool,
    pub program: String,
    pub out_dir: PathBuf,
    pub output_prefix: String,
    pub threads: usize,
    pub tool_options: Vec<String>,
    pub scratch_dir: PathBuf,
}

impl CommandBuilder {
    pub fn new(tool: Tool, out_dir: &Path, output_prefix: &str, threads: usize, tool_options: Vec<String>) -> Self {
        CommandBuilder {
            tool,
            program: tool_tag(tool).to_string(),
            out_dir: out_dir.to_path_buf(),
            output_prefix: output_prefix.to_string(),
            threads: threads.max(1),
            tool_options,
            scratch_dir: out_dir.to_path_buf(),
        }
    }

    /// Overrides the executable, e.g. a full path or a stand-in for tests.
    pub fn with_program(mut self, program: &str) -> Self {
        self.program = program.to_string();
        self
    }

    pub fn with_scratch_dir(mut self, dir: &Path) -> Self {
        self.scratch_dir = dir.to_path_buf();
        self
    }

    fn output_path(&self, db: &ResolvedDatabase, role: &str, ext: &str) -> PathBuf {
        let stem = PathBuf::from(format!("{}_{}", db.name, tool_label(self.tool)));
        file_path_manipulator(
            &stem,
            Some(self.out_dir.as_path()),
            Some(self.output_prefix.as_str()),
            Some(format!("{}.{}", role, ext).as_str()),
            "_",
        )
    }

    /// One plan per database for single-end or concordant paired-end input.
    ///
    /// # Arguments
    ///
    /// * `inputs` - One FASTQ (single-end) or two (mate 1, mate 2).
    /// * `databases` - Resolved, uniquely named databases.
    ///
    /// # Returns
    /// Vec<DatabasePlan>, in database order.
    pub fn build(&self, inputs: &[PathBuf], databases: &[ResolvedDatabase]) -> Result<Vec<DatabasePlan>, PipelineError> {
        if inputs.is_empty() || inputs.len() > 2 {
            return Err(PipelineError::Configuration(format!(
                "Expected one or two input files, got {}", inputs.len()
            )));
        }

        databases
            .iter()
            .map(|db| match self.tool {
                Tool::Bowtie2 => Ok(self.bowtie2_plan(inputs, db)),
                Tool::Bmtagger => Ok(self.bmtagger_plan(inputs, db)),
            })
            .collect()
    }

    fn bowtie2_plan(&self, inputs: &[PathBuf], db: &ResolvedDatabase) -> DatabasePlan {
        let mut args = bowtie2::base_args(&self.program, self.threads, &db.index);
        let (clean, contam) = if inputs.len() == 2 {
            let clean_pattern = self.output_path(db, "clean_%", FASTQ_EXT);
            let contam_pattern = self.output_path(db, "contam_%", FASTQ_EXT);
            args.extend(bowtie2::paired_args(&inputs[0], &inputs[1], &clean_pattern, &contam_pattern));
            (
                vec![self.output_path(db, "clean_1", FASTQ_EXT), self.output_path(db, "clean_2", FASTQ_EXT)],
                vec![self.output_path(db, "contam_1", FASTQ_EXT), self.output_path(db, "contam_2", FASTQ_EXT)],
            )
        } else {
            let clean = self.output_path(db, "clean", FASTQ_EXT);
            let contam = self.output_path(db, "contam", FASTQ_EXT);
            args.extend(bowtie2::single_args(&inputs[0], &clean, &contam));
            (vec![clean], vec![contam])
        };
        args.extend(self.tool_options.iter().cloned());

        let job = DatabaseJob {
            name: format!("{} {}", tool_label(self.tool), db.name),
            database: db.name.clone(),
            args,
            inputs: inputs.to_vec(),
            outputs: clean.iter().chain(contam.iter()).cloned().collect(),
            primary_output: clean.first().cloned(),
        };
        debug!("Built job: {}", job.command_line());

        DatabasePlan {
            database: db.clone(),
            jobs: vec![job],
            outputs: PlannedOutputs::Reads { clean, contam },
        }
    }

    fn bmtagger_plan(&self, inputs: &[PathBuf], db: &ResolvedDatabase) -> DatabasePlan {
        let contam_ids = self.output_path(db, "contam", ID_LIST_EXT);
        let mut args = bmtagger::arg_generator(&self.program, &db.index, &self.scratch_dir, inputs, &contam_ids);
        args.extend(self.tool_options.iter().cloned());

        let job = DatabaseJob {
            name: format!("{} {}", tool_label(self.tool), db.name),
            database: db.name.clone(),
            args,
            inputs: inputs.to_vec(),
            outputs: vec![contam_ids.clone()],
            primary_output: Some(contam_ids.clone()),
        };
        debug!("Built job: {}", job.command_line());

        DatabasePlan {
            database: db.clone(),
            jobs: vec![job],
            outputs: PlannedOutputs::IdList { contam_ids },
        }
    }

    /// Plans for aligning each mate (and orphans) as independent single-end runs.
    /// Each database yields two or three jobs writing SAM.
    pub fn build_discordant(
        &self,
        mate1: &Path,
        mate2: &Path,
        orphans: Option<&Path>,
        databases: &[ResolvedDatabase],
    ) -> Result<Vec<DatabasePlan>, PipelineError> {
        if self.tool != Tool::Bowtie2 {
            return Err(PipelineError::Configuration(
                "Discordant pair alignment requires bowtie2".to_string(),
            ));
        }

        let plans = databases
            .iter()
            .map(|db| {
                let mut inputs: Vec<(&str, &Path)> = vec![("1", mate1), ("2", mate2)];
                if let Some(o) = orphans {
                    inputs.push(("orphans", o));
                }

                let mut sams = Vec::new();
                let jobs = inputs
                    .into_iter()
                    .map(|(role, input)| {
                        let sam = self.output_path(db, role, SAM_EXT);
                        let mut args = bowtie2::base_args(&self.program, self.threads, &db.index);
                        args.extend(bowtie2::sam_args(input, &sam));
                        args.extend(self.tool_options.iter().cloned());
                        sams.push(sam.clone());
                        DatabaseJob {
                            name: format!("{} {} mate {}", tool_label(self.tool), db.name, role),
                            database: db.name.clone(),
                            args,
                            inputs: vec![input.to_path_buf()],
                            outputs: vec![sam.clone()],
                            primary_output: Some(sam),
                        }
                    })
                    .collect::<Vec<_>>();

                DatabasePlan {
                    database: db.clone(),
                    jobs,
                    outputs: PlannedOutputs::Alignments {
                        mate1: sams[0].clone(),
                        mate2: sams[1].clone(),
                        orphans: sams.get(2).cloned(),
                    },
                }
            })
            .collect();
        Ok(plans)
    }
}


mod bowtie2 {
    use std::path::Path;

    pub fn base_args(program: &str, threads: usize, index: &Path) -> Vec<String> {
        vec![
            program.to_string(),
            "--threads".to_string(),
            threads.to_string(),
            "-x".to_string(),
            index.to_string_lossy().to_string(),
        ]
    }

    pub fn single_args(input: &Path, clean: &Path, contam: &Path) -> Vec<String> {
        vec![
            "-U".to_string(),
            input.to_string_lossy().to_string(),
            "--un".to_string(),
            clean.to_string_lossy().to_string(),
            "--al".to_string(),
            contam.to_string_lossy().to_string(),
            "-S".to_string(),
            "/dev/null".to_string(),
        ]
    }

    /// `%` in the output patterns is replaced by bowtie2 with the mate number.
    pub fn paired_args(r1: &Path, r2: &Path, clean_pattern: &Path, contam_pattern: &Path) -> Vec<String> {
        vec![
            "-1".to_string(),
            r1.to_string_lossy().to_string(),
            "-2".to_string(),
            r2.to_string_lossy().to_string(),
            "--un-conc".to_string(),
            clean_pattern.to_string_lossy().to_string(),
            "--al-conc".to_string(),
            contam_pattern.to_string_lossy().to_string(),
            "-S".to_string(),
            "/dev/null".to_string(),
        ]
    }

    pub fn sam_args(input: &Path, sam: &Path) -> Vec<String> {
        vec![
            "-U".to_string(),
            input.to_string_lossy().to_string(),
            "-S".to_string(),
            sam.to_string_lossy().to_string(),
        ]
    }
}

mod bmtagger {
    use std::path::{Path, PathBuf};
    use super::with_suffix;

    pub fn arg_generator(program: &str, index: &Path, scratch: &Path, inputs: &[PathBuf], out: &Path) -> Vec<String> {
        let mut args_vec: Vec<String> = vec![
            program.to_string(),
            "-b".to_string(),
            with_suffix(index, ".bitmask").to_string_lossy().to_string(),
            "-x".to_string(),
            with_suffix(index, ".srprism").to_string_lossy().to_string(),
            "-T".to_string(),
            scratch.to_string_lossy().to_string(),
            "-q1".to_string(),
            "-1".to_string(),
            inputs[0].to_string_lossy().to_string(),
        ];
        if let Some(r2) = inputs.get(1) {
            args_vec.push("-2".to_string());
            args_vec.push(r2.to_string_lossy().to_string());
        }
        args_vec.push("-o".to_string());
        args_vec.push(out.to_string_lossy().to_string());
        args_vec
    }
}


fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut s = base.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

/// Strips a companion extension off a path, longest extension first so
/// `x.rev.1.bt2` resolves to `x` rather than `x.rev`.
fn strip_companion(path: &Path, extension_sets: &[Vec<&str>]) -> Option<PathBuf> {
    let s = path.to_str()?;
    let mut exts: Vec<&str> = extension_sets.iter().flatten().copied().collect();
    exts.sort_by_key(|e| std::cmp::Reverse(e.len()));
    exts.into_iter()
        .find(|ext| s.len() > ext.len() && s.ends_with(ext))
        .map(|ext| PathBuf::from(&s[..s.len() - ext.len()]))
}

/// Resolves a database argument (directory, companion file or basename) to an index basename.
///
/// # Arguments
///
/// * `prefix` - Path given on the command line.
/// * `tool` - Tool whose companion files must be present.
///
/// # Returns
/// PathBuf of the index basename, or a Configuration error.
pub fn resolve_database(prefix: &Path, tool: Tool) -> Result<PathBuf, PipelineError> {
    let extension_sets = DB_EXTENSIONS
        .get(&tool)
        .ok_or_else(|| PipelineError::Configuration(format!("No index layout known for {:?}", tool)))?;

    let candidate = if prefix.is_dir() {
        let mut entries: Vec<PathBuf> = fs::read_dir(prefix)
            .map_err(|e| PipelineError::Configuration(format!("Cannot read database directory {}: {}", prefix.display(), e)))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .collect();
        entries.sort();
        entries
            .iter()
            .find_map(|p| strip_companion(p, extension_sets))
            .ok_or_else(|| PipelineError::Configuration(format!(
                "No {} index found in directory {}", tool_label(tool), prefix.display()
            )))?
    } else {
        strip_companion(prefix, extension_sets).unwrap_or_else(|| prefix.to_path_buf())
    };

    let complete = extension_sets
        .iter()
        .any(|set| set.iter().all(|ext| with_suffix(&candidate, ext).is_file()));
    if !complete {
        let missing: Vec<String> = extension_sets[0]
            .iter()
            .filter(|ext| !with_suffix(&candidate, ext).is_file())
            .map(|ext| ext.to_string())
            .collect();
        return Err(PipelineError::Configuration(format!(
            "Database {} is not a valid {} index; missing {}",
            prefix.display(),
            tool_label(tool),
            missing.join(", ")
        )));
    }
    Ok(candidate)
}

/// Names each index by its basename; colliding basenames get `_<rank>` where rank
/// is the position of the full path in sorted order within the collision group.
pub fn disambiguate_names(indexes: &[PathBuf]) -> Vec<String> {
    let basename = |p: &PathBuf| {
        p.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "db".to_string())
    };

    let mut groups: HashMap<String, Vec<&PathBuf>> = HashMap::new();
    for index in indexes {
        groups.entry(basename(index)).or_default().push(index);
    }
    for members in groups.values_mut() {
        members.sort();
    }

    let mut taken: HashMap<String, usize> = HashMap::new();
    indexes
        .iter()
        .map(|index| {
            let base = basename(index);
            let members = &groups[&base];
            if members.len() == 1 {
                return base;
            }
            // Identical paths share a rank; hand out the next free slot among them.
            let first = members.iter().position(|m| *m == index).unwrap_or(0);
            let used = taken.entry(index.to_string_lossy().into_owned()).or_insert(0);
            let rank = first + *used;
            *used += 1;
            format!("{}_{}", base, rank)
        })
        .collect()
}

/// Resolves and uniquely names every database argument.
pub fn resolve_databases(prefixes: &[PathBuf], tool: Tool) -> Result<Vec<ResolvedDatabase>, PipelineError> {
    if prefixes.is_empty() {
        return Err(PipelineError::Configuration("At least one reference database is required".to_string()));
    }
    let indexes = prefixes
        .iter()
        .map(|p| resolve_database(p, tool))
        .collect::<Result<Vec<_>, _>>()?;
    let names = disambiguate_names(&indexes);
    for (index, name) in indexes.iter().zip(&names) {
        info!("Reference database {} -> {}", name, index.display());
    }
    Ok(indexes
        .into_iter()
        .zip(names)
        .map(|(index, name)| ResolvedDatabase { index, name })
        .collect())
}


/// Confirms an external tool can be spawned and returns the first line it prints.
///
/// # Arguments
///
/// * `program` - Executable name or path.
/// * `args` - Version/help flag for the tool.
///
/// # Returns
/// First non-empty line of output, or a Configuration error when the tool is missing.
pub async fn presence_check(program: &str, args: &[&str]) -> Result<String, PipelineError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| PipelineError::Configuration(format!("Failed to spawn {}: {}. Is it installed?", program, e)))?;

    let mut lines = read_child_output_to_vec(&mut child, ChildStream::Stdout).await?;
    if lines.iter().all(|l| l.trim().is_empty()) {
        lines = read_child_output_to_vec(&mut child, ChildStream::Stderr).await?;
    }
    child.wait().await.map_err(|e| anyhow!("Failed waiting on {}: {}", program, e))?;

    Ok(lines
        .into_iter()
        .find(|l| !l.trim().is_empty())
        .unwrap_or_default())
}

/// Checks every tool the run needs before any job is scheduled.
pub async fn check_versions(tools: &[(&str, &[&str])]) -> Result<(), PipelineError> {
    for (program, args) in tools {
        let version = presence_check(program, args).await?;
        info!("Found {}: {}", program, version.trim());
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn touch_index(base: &Path, exts: &[&str]) {
        for ext in exts {
            fs::write(with_suffix(base, ext), b"").unwrap();
        }
    }

    const BT2: &[&str] = &[".1.bt2", ".2.bt2", ".3.bt2", ".4.bt2", ".rev.1.bt2", ".rev.2.bt2"];

    #[test]
    fn test_resolve_basename_file_and_directory() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let base = dir.path().join("hg38");
        touch_index(&base, BT2);

        assert_eq!(resolve_database(&base, Tool::Bowtie2)?, base);
        assert_eq!(resolve_database(&with_suffix(&base, ".rev.1.bt2"), Tool::Bowtie2)?, base);
        assert_eq!(resolve_database(dir.path(), Tool::Bowtie2)?, base);
        Ok(())
    }

    #[test]
    fn test_resolve_missing_companion_is_configuration_error() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let base = dir.path().join("phix");
        touch_index(&base, &BT2[..3]);
        let err = resolve_database(&base, Tool::Bowtie2).unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
        assert!(err.to_string().contains(".4.bt2"));

        let empty = tempdir()?;
        assert!(matches!(resolve_database(empty.path(), Tool::Bmtagger), Err(PipelineError::Configuration(_))));
        Ok(())
    }

    #[test]
    fn test_disambiguation_is_order_independent() {
        let a = PathBuf::from("/refs/b/human");
        let b = PathBuf::from("/refs/a/human");
        let c = PathBuf::from("/refs/phix");

        let forward = disambiguate_names(&[a.clone(), b.clone(), c.clone()]);
        assert_eq!(forward, vec!["human_1", "human_0", "phix"]);

        let reverse = disambiguate_names(&[c, b, a]);
        assert_eq!(reverse, vec!["phix", "human_0", "human_1"]);
    }

    #[test]
    fn test_single_and_paired_bowtie2_jobs() -> anyhow::Result<()> {
        let out = PathBuf::from("/out");
        let db = ResolvedDatabase { index: PathBuf::from("/refs/hg38"), name: "hg38".to_string() };
        let builder = CommandBuilder::new(Tool::Bowtie2, &out, "s1", 8, vec!["--very-sensitive".to_string()]);

        let plans = builder.build(&[PathBuf::from("in.fq")], &[db.clone()])?;
        let job = &plans[0].jobs[0];
        assert_eq!(job.program(), "bowtie2");
        assert_eq!(
            job.command_line(),
            "bowtie2 --threads 8 -x /refs/hg38 -U in.fq --un /out/s1_hg38_bowtie2_clean.fastq \
             --al /out/s1_hg38_bowtie2_contam.fastq -S /dev/null --very-sensitive"
        );
        assert_eq!(job.primary_output, Some(out.join("s1_hg38_bowtie2_clean.fastq")));

        let plans = builder.build(&[PathBuf::from("r1.fq"), PathBuf::from("r2.fq")], &[db])?;
        match &plans[0].outputs {
            PlannedOutputs::Reads { clean, contam } => {
                assert_eq!(clean[1], out.join("s1_hg38_bowtie2_clean_2.fastq"));
                assert_eq!(contam[0], out.join("s1_hg38_bowtie2_contam_1.fastq"));
            }
            other => panic!("unexpected outputs {:?}", other),
        }
        assert!(plans[0].jobs[0].args.contains(&"/out/s1_hg38_bowtie2_clean_%.fastq".to_string()));

        assert!(builder.build(&[], &[]).is_err());
        Ok(())
    }

    #[test]
    fn test_bmtagger_and_discordant_jobs() -> anyhow::Result<()> {
        let out = PathBuf::from("/out");
        let db = ResolvedDatabase { index: PathBuf::from("/refs/hg"), name: "hg".to_string() };

        let tagger = CommandBuilder::new(Tool::Bmtagger, &out, "s", 2, vec![]).with_scratch_dir(Path::new("/tmp/bm"));
        let plans = tagger.build(&[PathBuf::from("a.fq"), PathBuf::from("b.fq")], &[db.clone()])?;
        assert_eq!(
            plans[0].jobs[0].command_line(),
            "bmtagger.sh -b /refs/hg.bitmask -x /refs/hg.srprism -T /tmp/bm -q1 -1 a.fq -2 b.fq -o /out/s_hg_bmtagger_contam.txt"
        );
        assert!(tagger.build_discordant(Path::new("a"), Path::new("b"), None, &[db.clone()]).is_err());

        let aligner = CommandBuilder::new(Tool::Bowtie2, &out, "s", 2, vec![]);
        let plans = aligner.build_discordant(Path::new("a.fq"), Path::new("b.fq"), Some(Path::new("o.fq")), &[db])?;
        assert_eq!(plans[0].jobs.len(), 3);
        assert_eq!(
            plans[0].outputs,
            PlannedOutputs::Alignments {
                mate1: out.join("s_hg_bowtie2_1.sam"),
                mate2: out.join("s_hg_bowtie2_2.sam"),
                orphans: Some(out.join("s_hg_bowtie2_orphans.sam")),
            }
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_presence_check() {
        let line = presence_check("sh", &["-c", "echo 'tool 1.2.3'"]).await.unwrap();
        assert_eq!(line, "tool 1.2.3");
        let missing = presence_check("definitely-not-a-real-tool-xyz", &[]).await;
        assert!(matches!(missing, Err(PipelineError::Configuration(_))));
    }
}
