//! # Binary Resolver
//!
//! Picks the server binary for a run from an ordered candidate list. The
//! first path that exists and that the current user may execute wins; the
//! probe is read-only and never touches the settings file.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::cli::ServerVariant;
use crate::config::{EnvOverrides, HarnessConfig};
use crate::error::ResolveError;

/// Resolve the server binary for `variant` using the stored candidates and
/// the environment overrides.
pub fn resolve(
    config: &HarnessConfig,
    overrides: &EnvOverrides,
    variant: ServerVariant,
) -> Result<PathBuf, ResolveError> {
    let candidates = overrides.candidates(config, variant);
    first_executable(variant, &candidates)
}

/// Return the first candidate that exists and is executable.
pub fn first_executable(
    variant: ServerVariant,
    candidates: &[PathBuf],
) -> Result<PathBuf, ResolveError> {
    for candidate in candidates {
        if is_executable(candidate) {
            debug!("Resolved {} server binary: {}", variant, candidate.display());
            return Ok(candidate.clone());
        }
        debug!("Skipping {} candidate {}", variant, candidate.display());
    }

    Err(ResolveError::NotFound {
        variant: variant.to_string(),
        candidates: candidates.to_vec(),
    })
}

/// Register a user-supplied server binary as the first candidate for
/// `variant`.
///
/// The path is made absolute and must already be executable; a rejected
/// path leaves the candidate list untouched. The caller saves the settings.
pub fn register_path(
    config: &mut HarnessConfig,
    variant: ServerVariant,
    path: &Path,
) -> Result<PathBuf, ResolveError> {
    let absolute = std::path::absolute(path).map_err(|_| ResolveError::NotExecutable {
        path: path.to_path_buf(),
    })?;
    if !is_executable(&absolute) {
        return Err(ResolveError::NotExecutable { path: absolute });
    }
    config.add_server_path(variant, absolute.clone());
    Ok(absolute)
}

/// True when `path` is a regular file the current user may execute.
///
/// Uses `access(2)` so the answer reflects the real uid's permissions
/// rather than just the mode bits.
pub fn is_executable(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }

    #[cfg(unix)]
    {
        use nix::unistd::{access, AccessFlags};
        access(path, AccessFlags::X_OK).is_ok()
    }

    #[cfg(not(unix))]
    {
        true
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, mode: u32) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    #[test]
    fn test_first_executable_candidate_wins() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing_server");
        let plain = write_file(&dir, "plain_server", 0o644);
        let first = write_file(&dir, "first_server", 0o755);
        let second = write_file(&dir, "second_server", 0o755);

        let resolved = first_executable(
            ServerVariant::Epoll,
            &[missing, plain, first.clone(), second],
        )
        .unwrap();
        assert_eq!(resolved, first);
    }

    #[test]
    fn test_no_qualifying_candidate_is_not_found() {
        let dir = TempDir::new().unwrap();
        let plain = write_file(&dir, "plain_server", 0o644);
        let directory = dir.path().to_path_buf();

        let err = first_executable(ServerVariant::IoUring, &[plain.clone(), directory])
            .unwrap_err();
        match err {
            ResolveError::NotFound {
                variant,
                candidates,
            } => {
                assert_eq!(variant, "iouring");
                assert_eq!(candidates.len(), 2);
                assert_eq!(candidates[0], plain);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_empty_candidate_list_is_not_found() {
        assert!(first_executable(ServerVariant::Epoll, &[]).is_err());
    }

    #[test]
    fn test_resolve_prefers_environment_override() {
        let dir = TempDir::new().unwrap();
        let stored = write_file(&dir, "stored_server", 0o755);
        let injected = write_file(&dir, "env_server", 0o755);

        let mut config = HarnessConfig::default();
        config.add_server_path(ServerVariant::Epoll, &stored);
        let overrides = EnvOverrides {
            binary_path: Some(injected.clone()),
            variant: None,
        };

        assert_eq!(
            resolve(&config, &overrides, ServerVariant::Epoll).unwrap(),
            injected
        );
        assert_eq!(
            resolve(&config, &EnvOverrides::default(), ServerVariant::Epoll).unwrap(),
            stored
        );
    }

    #[test]
    fn test_register_path_rejects_unrunnable_binaries() {
        let dir = TempDir::new().unwrap();
        let plain = write_file(&dir, "plain_server", 0o644);
        let missing = dir.path().join("missing_server");

        let mut config = HarnessConfig::default();
        let before = config.clone();
        for path in [&missing, &plain] {
            let err = register_path(&mut config, ServerVariant::Epoll, path).unwrap_err();
            assert!(matches!(err, ResolveError::NotExecutable { .. }));
        }
        assert_eq!(config, before);
    }

    #[test]
    fn test_register_path_stores_absolute_path_first() {
        let dir = TempDir::new().unwrap();
        let server = write_file(&dir, "epoll_server", 0o755);

        let mut config = HarnessConfig::default();
        let stored = register_path(&mut config, ServerVariant::Epoll, &server).unwrap();
        assert!(stored.is_absolute());
        assert_eq!(stored, server);
        assert_eq!(
            resolve(&config, &EnvOverrides::default(), ServerVariant::Epoll).unwrap(),
            server
        );
    }
}
