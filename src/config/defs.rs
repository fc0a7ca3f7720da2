use std::path::PathBuf;
use std::collections::HashMap;
use lazy_static::lazy_static;
use thiserror::Error;
use crate::cli::{Arguments, Tool};
use crate::utils::scheduler::JobFailure;

// External software
pub const BOWTIE2_TAG: &str = "bowtie2";
pub const BMTAGGER_TAG: &str = "bmtagger.sh";
pub const TRF_TAG: &str = "trf";

lazy_static! {
    /// Companion files that must sit next to an index basename for each tool.
    pub static ref DB_EXTENSIONS: HashMap<Tool, Vec<Vec<&'static str>>> = {
        let mut m = HashMap::new();
        m.insert(Tool::Bowtie2, vec![
            vec![".1.bt2", ".2.bt2", ".3.bt2", ".4.bt2", ".rev.1.bt2", ".rev.2.bt2"],
            vec![".1.bt2l", ".2.bt2l", ".3.bt2l", ".4.bt2l", ".rev.1.bt2l", ".rev.2.bt2l"],
        ]);
        m.insert(Tool::Bmtagger, vec![
            vec![".bitmask", ".srprism.amp", ".srprism.idx", ".srprism.imp",
                 ".srprism.pmp", ".srprism.rmp", ".srprism.ssa", ".srprism.ssd"],
        ]);
        m
    };
}

pub fn tool_tag(tool: Tool) -> &'static str {
    match tool {
        Tool::Bowtie2 => BOWTIE2_TAG,
        Tool::Bmtagger => BMTAGGER_TAG,
    }
}

/// Short name used inside output file names.
pub fn tool_label(tool: Tool) -> &'static str {
    match tool {
        Tool::Bowtie2 => "bowtie2",
        Tool::Bmtagger => "bmtagger",
    }
}

// Static Parameters
pub const TRF_DEFAULT_OPTIONS: &[&str] = &["2", "7", "7", "80", "10", "50", "500", "-h", "-ngs"];
pub const TRF_STDIN: &str = "/dev/stdin";
pub const FASTQ_EXT: &str = "fastq";
pub const SAM_EXT: &str = "sam";
pub const ID_LIST_EXT: &str = "txt";

pub const CHANNEL_BUFFER: usize = 1024;


#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{} external tool job(s) failed:\n{}", .failures.len(), format_failures(.failures))]
    ToolFailure { failures: Vec<JobFailure> },

    #[error("Validation error in {file} at line {line}: {message}")]
    Validation { file: String, line: u64, message: String },

    #[error("Format mismatch: {0}")]
    FormatMismatch(String),

    #[error("Resource error: {0}")]
    Resource(String),

    #[error("I/O error: {0}")]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn validation(file: impl Into<String>, line: u64, message: impl Into<String>) -> Self {
        PipelineError::Validation { file: file.into(), line, message: message.into() }
    }

    /// Process exit code: the first failing tool's code, 1 for everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::ToolFailure { failures } => failures
                .iter()
                .find_map(|f| f.exit_code.filter(|&c| c != 0))
                .unwrap_or(1),
            _ => 1,
        }
    }
}

fn format_failures(failures: &[JobFailure]) -> String {
    failures
        .iter()
        .map(|f| match f.exit_code {
            Some(code) => format!("  [{}] exit code {}: {}", f.name, code, f.command),
            None => format!("  [{}] {}: {}", f.name, f.reason, f.command),
        })
        .collect::<Vec<_>>()
        .join("\n")
}


pub struct RunConfig {
    pub cwd: PathBuf,
    pub ram_temp_dir: PathBuf,
    pub out_dir: PathBuf,
    pub max_cores: usize,
    pub args: Arguments,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_from_first_failure() {
        let err = PipelineError::ToolFailure {
            failures: vec![
                JobFailure { name: "a".into(), command: "x".into(), exit_code: None, reason: "killed by signal".into() },
                JobFailure { name: "b".into(), command: "bowtie2 -x db".into(), exit_code: Some(3), reason: String::new() },
            ],
        };
        assert_eq!(err.exit_code(), 3);
        let msg = err.to_string();
        assert!(msg.contains("bowtie2 -x db"));
        assert!(msg.contains("exit code 3"));
        assert_eq!(PipelineError::Configuration("x".into()).exit_code(), 1);
    }
}
