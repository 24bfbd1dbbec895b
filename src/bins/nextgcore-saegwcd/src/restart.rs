//! Persisted Restart Counter
//!
//! Loaded and bumped once per process start so peers can notice that this
//! node restarted. The file holds the decimal counter value.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{SaegwcError, SaegwcResult};

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970)
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// Read the stored counter, increment it and write it back
///
/// A missing file counts as zero. The new value is written through a
/// temporary file and renamed into place.
pub fn load_and_increment(path: &Path) -> SaegwcResult<u8> {
    let previous = match fs::read_to_string(path) {
        Ok(content) => content.trim().parse::<u8>().map_err(|e| {
            SaegwcError::RestartCounter(format!("{}: {}", path.display(), e))
        })?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
        Err(e) => {
            return Err(SaegwcError::RestartCounter(format!("{}: {}", path.display(), e)));
        }
    };
    let counter = previous.wrapping_add(1);
    store(path, counter)?;
    log::info!("Restart counter {} -> {}", previous, counter);
    Ok(counter)
}

fn store(path: &Path, counter: u8) -> SaegwcResult<()> {
    let io_err = |e: std::io::Error| SaegwcError::RestartCounter(format!("{}: {}", path.display(), e));
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).map_err(io_err)?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp).map_err(io_err)?;
        writeln!(file, "{counter}").map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
    }
    fs::rename(&tmp, path).map_err(io_err)
}

/// PFCP Recovery Time Stamp: seconds since the NTP epoch, truncated to 32 bits
pub fn pfcp_recovery_timestamp(at: SystemTime) -> u32 {
    let unix = at.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    (unix + NTP_UNIX_OFFSET) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_first_start_counts_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("restart");
        assert_eq!(load_and_increment(&path).unwrap(), 1);
        assert_eq!(load_and_increment(&path).unwrap(), 2);
        assert_eq!(fs::read_to_string(&path).unwrap().trim(), "2");
    }

    #[test]
    fn test_counter_wraps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("restart");
        fs::write(&path, "255\n").unwrap();
        assert_eq!(load_and_increment(&path).unwrap(), 0);
    }

    #[test]
    fn test_corrupt_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("restart");
        fs::write(&path, "not a number").unwrap();
        assert!(matches!(load_and_increment(&path), Err(SaegwcError::RestartCounter(_))));
    }

    #[test]
    fn test_recovery_timestamp_epoch() {
        assert_eq!(pfcp_recovery_timestamp(UNIX_EPOCH), NTP_UNIX_OFFSET as u32);
        let later = UNIX_EPOCH + Duration::from_secs(10);
        assert_eq!(pfcp_recovery_timestamp(later), NTP_UNIX_OFFSET as u32 + 10);
    }
}
