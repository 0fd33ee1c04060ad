//! Test utilities for mlxadmin
//!
//! Temporary directories, sample model specs and stand-in server scripts.

use crate::config::ModelSpec;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

/// Create a temporary directory for testing
///
/// # Returns
///
/// Returns a TempDir that will be cleaned up when dropped
pub fn temp_dir() -> TempDir {
    TempDir::new().expect("Failed to create temporary directory")
}

/// A valid spec for `id` on `port`, serving `mlx-community/<id>`
pub fn sample_spec(id: &str, port: u16) -> ModelSpec {
    ModelSpec {
        id: id.to_string(),
        name: format!("Test model {}", id),
        model_ref: format!("mlx-community/{}", id),
        port,
        draft_model_ref: None,
        draft_token_count: None,
    }
}

/// Write an executable `/bin/sh` script into `dir`
///
/// # Panics
///
/// Panics if the file cannot be written or made executable
#[cfg(unix)]
pub fn write_script(dir: &TempDir, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.path().join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}", body)).expect("Failed to write script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("Failed to make script executable");
    path
}

/// Poll `path` until it contains `needle`, returning the contents
///
/// # Panics
///
/// Panics if the text does not appear within five seconds
pub async fn wait_for_log(path: &Path, needle: &str) -> String {
    for _ in 0..100 {
        if let Ok(contents) = tokio::fs::read_to_string(path).await {
            if contents.contains(needle) {
                return contents;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("{:?} never appeared in {}", needle, path.display());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_spec_is_valid() {
        let specs = vec![sample_spec("a", 9000), sample_spec("b", 9001)];
        assert!(crate::config::validate_specs(&specs).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_write_script_is_executable() {
        let dir = temp_dir();
        let path = write_script(&dir, "hello.sh", "echo hello\n");
        let output = std::process::Command::new(&path).output().unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout), "hello\n");
    }
}
