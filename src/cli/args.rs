use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq, Hash)]
pub enum Tool {
    #[default]
    Bowtie2,
    Bmtagger,
}

/// How a pair is called when its mates were aligned independently.
#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub enum PairMode {
    /// Both mates must align for the pair to count as aligned.
    #[default]
    Strict,
    /// Either mate aligning is enough.
    Lenient,
}

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "readscrub", version, about = "Remove contaminant and tandem-repeat reads using external aligners")]
pub struct Arguments {

    #[arg(short = 'v', long = "verbose", action)]
    pub verbose: bool,

    #[arg(short = 'i', long = "file1", help = "Input FASTQ (mate 1 if paired)")]
    pub file1: String,

    #[arg(short = 'I', long = "file2", help = "Mate 2 FASTQ for paired-end input")]
    pub file2: Option<String>,

    #[arg(long, help = "FASTQ of reads whose mate was discarded upstream (discordant mode only)")]
    pub orphans: Option<String>,

    #[arg(short = 'o', long = "out", help = "Output directory for all generated files. If not specified, a directory named '<sample_base>_YYYYMMDD' will be created in the current working directory.")]
    pub out_dir: Option<String>,

    #[arg(long = "output-prefix", help = "Prefix for output files; defaults to the input sample base name")]
    pub output_prefix: Option<String>,

    #[arg(short = 'r', long = "reference-db", help = "Reference database: index basename, companion file or directory. Repeatable.")]
    pub reference_db: Vec<String>,

    #[arg(long = "tool", default_value = "bowtie2", value_enum)]
    pub tool: Tool,

    #[arg(short = 't', long, default_value_t = 4, help = "Threads handed to each external tool")]
    pub threads: usize,

    #[arg(short = 'p', long, default_value_t = 1, help = "Number of external tool processes run at once")]
    pub processes: usize,

    #[arg(long = "bowtie2-options", allow_hyphen_values = true, help = "Extra options for bowtie2, e.g. \"--very-sensitive\"")]
    pub bowtie2_options: Option<String>,

    #[arg(long = "bmtagger-options", allow_hyphen_values = true)]
    pub bmtagger_options: Option<String>,

    #[arg(long, default_value_t = false, help = "Align mates independently and reconcile pairs afterwards")]
    pub discordant: bool,

    #[arg(long = "pair-mode", default_value = "strict", value_enum)]
    pub pair_mode: PairMode,

    #[arg(long = "remove-repeats", default_value_t = false)]
    pub remove_repeats: bool,

    #[arg(long = "mask-repeats", default_value_t = false, help = "Also write a copy of the reads with tandem repeats masked by N")]
    pub mask_repeats: bool,

    #[arg(long = "trf-path", default_value = "trf")]
    pub trf_path: String,

    #[arg(long = "trf-options", allow_hyphen_values = true)]
    pub trf_options: Option<String>,

    #[arg(long = "store-temp-output", default_value_t = false, help = "Keep per-database intermediate files")]
    pub store_temp_output: bool,
}

impl Arguments {
    pub fn paired(&self) -> bool {
        self.file2.is_some()
    }

    /// User options for the selected tool, split on whitespace.
    pub fn tool_options(&self) -> Vec<String> {
        let raw = match self.tool {
            Tool::Bowtie2 => self.bowtie2_options.as_deref(),
            Tool::Bmtagger => self.bmtagger_options.as_deref(),
        };
        split_options(raw)
    }
}

pub fn split_options(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| s.split_whitespace().map(String::from).collect())
        .unwrap_or_default()
}
