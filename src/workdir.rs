//! Per-spawn work directory management.
//!
//! Every spawn attempt owns one private directory through which all
//! out-of-band data flows between the supervisor and the spawned process:
//! command inputs (`args.json`), response artifacts (`response/`), and
//! environment dumps for diagnostics (`envdump/`).

use crate::journey::JourneyStep;
use crate::types::Result;
use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// A scoped spawn work directory with the fixed layout:
///
/// ```text
/// args.json
/// response/
///   properties.json
///   finish
///   steps/<step>/{state,duration}
///   error/{category,summary,advanced_problem_details,
///          problem_description.html,solution_description.html}
/// envdump/
///   envvars, user_info, ulimits, annotations/*
/// ```
///
/// The directory is removed when the owner drops the handle; callers that
/// need to keep residue for diagnostics extraction call [`WorkDir::detach`].
#[derive(Debug)]
pub struct WorkDir {
    path: PathBuf,
    owned: bool,
}

impl WorkDir {
    /// Create a fresh work directory under the OS temp directory.
    pub fn create() -> Result<WorkDir> {
        Self::create_in(&std::env::temp_dir())
    }

    /// Create a fresh work directory under `base`.
    pub fn create_in(base: &Path) -> Result<WorkDir> {
        let path = base.join(format!("spawnkit-{}", Uuid::new_v4()));
        fs::DirBuilder::new().recursive(true).mode(0o700).create(&path)?;
        make_skeleton(&path)?;
        Ok(WorkDir { path, owned: true })
    }

    /// Wrap an existing work directory without taking ownership of its
    /// lifetime. Used by the child-side environment setupper, which must
    /// never delete the directory it reports into.
    pub fn open(path: &Path) -> WorkDir {
        WorkDir {
            path: path.to_path_buf(),
            owned: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn path_in(&self, subpath: &str) -> PathBuf {
        self.path.join(subpath)
    }

    pub fn args_json_path(&self) -> PathBuf {
        self.path.join("args.json")
    }

    pub fn response_dir(&self) -> PathBuf {
        self.path.join("response")
    }

    pub fn finish_path(&self) -> PathBuf {
        self.path.join("response/finish")
    }

    pub fn properties_path(&self) -> PathBuf {
        self.path.join("response/properties.json")
    }

    pub fn error_dir(&self) -> PathBuf {
        self.path.join("response/error")
    }

    pub fn step_dir(&self, step: JourneyStep) -> PathBuf {
        self.path.join("response/steps").join(step.as_str_lower())
    }

    pub fn envdump_dir(&self) -> PathBuf {
        self.path.join("envdump")
    }

    pub fn annotations_dir(&self) -> PathBuf {
        self.path.join("envdump/annotations")
    }

    /// Re-create any missing skeleton directories. Idempotent.
    pub fn ensure_skeleton(&self) -> Result<()> {
        make_skeleton(&self.path)
    }

    /// Give up ownership: the directory stays on disk and its path is
    /// returned for later inspection or cleanup by the caller.
    pub fn detach(mut self) -> PathBuf {
        self.owned = false;
        self.path.clone()
    }

    /// Remove the directory tree now instead of waiting for drop.
    pub fn remove(&mut self) -> Result<()> {
        self.owned = false;
        fs::remove_dir_all(&self.path)?;
        Ok(())
    }
}

fn make_skeleton(path: &Path) -> Result<()> {
    fs::create_dir_all(path.join("response/steps"))?;
    fs::create_dir_all(path.join("response/error"))?;
    fs::create_dir_all(path.join("envdump/annotations"))?;
    Ok(())
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if self.owned {
            if let Err(e) = fs::remove_dir_all(&self.path) {
                log::warn!(
                    "Failed to remove spawn work directory {}: {}",
                    self.path.display(),
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_builds_skeleton() {
        let work_dir = WorkDir::create().unwrap();
        assert!(work_dir.path().is_dir());
        assert!(work_dir.path_in("response/steps").is_dir());
        assert!(work_dir.path_in("response/error").is_dir());
        assert!(work_dir.path_in("envdump/annotations").is_dir());
    }

    #[test]
    fn create_sets_private_mode() {
        use std::os::unix::fs::MetadataExt;
        let work_dir = WorkDir::create().unwrap();
        let mode = fs::metadata(work_dir.path()).unwrap().mode() & 0o777;
        assert_eq!(mode, 0o700);
    }

    #[test]
    fn drop_removes_directory() {
        let work_dir = WorkDir::create().unwrap();
        let path = work_dir.path().to_path_buf();
        drop(work_dir);
        assert!(!path.exists());
    }

    #[test]
    fn detach_keeps_directory() {
        let work_dir = WorkDir::create().unwrap();
        let path = work_dir.detach();
        assert!(path.exists());
        fs::remove_dir_all(&path).unwrap();
    }

    #[test]
    fn open_does_not_own() {
        let owner = WorkDir::create().unwrap();
        let path = owner.path().to_path_buf();
        {
            let viewer = WorkDir::open(&path);
            assert_eq!(viewer.path(), path.as_path());
        }
        assert!(path.exists());
    }

    #[test]
    fn step_dir_uses_lowercase_names() {
        let work_dir = WorkDir::create().unwrap();
        let dir = work_dir.step_dir(JourneyStep::SubprocessListen);
        assert!(dir.ends_with("response/steps/subprocess_listen"));
    }

    #[test]
    fn ensure_skeleton_is_idempotent() {
        let work_dir = WorkDir::create().unwrap();
        work_dir.ensure_skeleton().unwrap();
        work_dir.ensure_skeleton().unwrap();
        assert!(work_dir.path_in("response/steps").is_dir());
    }
}
