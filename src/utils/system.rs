// src/utils/system.rs: System functions

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use sysinfo::{CpuRefreshKind, RefreshKind, System};
use tempfile::TempDir;

use crate::config::defs::PipelineError;


/// Determines number of cores that can be used by external tools.
///
/// # Arguments
///
/// * `requested` - Total threads asked for (threads per job * concurrent jobs).
///
/// # Returns
///
/// usize: the smaller of the request and the logical cores present, at least 1.
pub fn detect_cores(requested: usize) -> usize {
    let refresh_kind = RefreshKind::nothing().with_cpu(CpuRefreshKind::nothing());
    let mut system = System::new_with_specifics(refresh_kind);
    system.refresh_cpu_list(CpuRefreshKind::nothing());
    let logical = system.cpus().len().max(1);
    let physical = System::physical_core_count().unwrap_or(logical);
    debug!("Detected {} logical / {} physical cores", logical, physical);
    requested.clamp(1, logical)
}


/// Searches for a directory for RAM temp files.
/// Prefers /dev/shm (RAM disk) for linux, otherwise returns the standard temp dir.
///
/// # Returns
/// PathBuf: temp dir for RAM files.
pub fn get_ram_temp_dir() -> PathBuf {
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    {
        if let Ok(metadata) = fs::metadata("/dev/shm") {
            if metadata.is_dir() {
                return PathBuf::from("/dev/shm");
            }
        }
        std::env::temp_dir()
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        std::env::temp_dir()
    }
}


/// Creates a scratch directory under `parent`, removed when the returned guard drops.
pub fn scratch_dir(parent: &Path, prefix: &str) -> Result<TempDir, PipelineError> {
    tempfile::Builder::new()
        .prefix(prefix)
        .tempdir_in(parent)
        .map_err(|e| PipelineError::Resource(format!(
            "Cannot create scratch directory in {}: {}", parent.display(), e
        )))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_cores_bounds() {
        assert_eq!(detect_cores(1), 1);
        assert!(detect_cores(0) >= 1);
        assert!(detect_cores(usize::MAX) >= 1);
    }

    #[test]
    fn test_scratch_dir_cleanup() -> anyhow::Result<()> {
        let parent = tempfile::tempdir()?;
        let path = {
            let scratch = scratch_dir(parent.path(), "readscrub_")?;
            assert!(scratch.path().is_dir());
            scratch.path().to_path_buf()
        };
        assert!(!path.exists());
        assert!(matches!(
            scratch_dir(Path::new("/definitely/not/here"), "x"),
            Err(PipelineError::Resource(_))
        ));
        assert!(get_ram_temp_dir().is_dir());
        Ok(())
    }
}
