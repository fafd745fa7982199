//! Filesystem-backed context source rooted at the project directory.

use std::fs;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::core::context_pack::ContextSource;

/// Reads candidate files relative to `root`. Paths that would escape the
/// root are treated as missing.
#[derive(Debug, Clone)]
pub struct FsContextSource {
    root: PathBuf,
}

impl FsContextSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Option<PathBuf> {
        let relative = Path::new(path);
        let contained = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir));
        if !contained {
            debug!(path, "rejecting context path outside the project root");
            return None;
        }
        Some(self.root.join(relative))
    }

    pub fn exists(&self, path: &str) -> bool {
        self.resolve(path).is_some_and(|full| full.exists())
    }
}

impl ContextSource for FsContextSource {
    fn read(&self, path: &str) -> Option<String> {
        let full = self.resolve(path)?;
        match fs::read(&full) {
            Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
            Err(err) => {
                debug!(path, err = %err, "context file unreadable");
                None
            }
        }
    }

    fn modified(&self, path: &str) -> Option<DateTime<Utc>> {
        let full = self.resolve(path)?;
        let modified = fs::metadata(full).and_then(|meta| meta.modified()).ok()?;
        Some(DateTime::<Utc>::from(modified))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_files_under_root_only() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("src")).expect("mkdir");
        fs::write(temp.path().join("src/lib.rs"), "pub mod lexer;\n").expect("write");
        let source = FsContextSource::new(temp.path());

        assert_eq!(source.read("src/lib.rs").as_deref(), Some("pub mod lexer;\n"));
        assert!(source.modified("src/lib.rs").is_some());
        assert!(source.exists("./src/lib.rs"));
        assert_eq!(source.read("src/missing.rs"), None);
        assert_eq!(source.read("../outside.rs"), None);
        assert_eq!(source.read("/etc/hostname"), None);
        assert!(!source.exists("src/../../x"));
    }
}
