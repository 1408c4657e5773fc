//! Enumerates regular files under a set of roots and assigns each one its archive name.
//!
//! Roots are visited depth-first in the order the filesystem reports entries. Directories are
//! structural only: they never produce a record. Symlinks are not followed and are not archived.

use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};

/// Errors produced while walking source paths.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to walk {path:?}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
    #[error("failed to read metadata of {path:?}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid archive name for {path:?}: {reason}")]
    InvalidName { path: PathBuf, reason: &'static str },
}

/// A regular file found by the walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRecord {
    /// Absolute location on the local filesystem
    pub path: PathBuf,
    /// Archive-relative name: never empty, never absolute, `/` separated
    pub name: String,
    pub size: u64,
    pub mode: u32,
    pub modified: std::time::SystemTime,
}

/// Lexically normalizes `path`: drops `.` components and folds `name/..` pairs.
///
/// Leading `..` components of a relative path are kept; `/..` collapses to `/`.
fn clean(path: &Path) -> PathBuf {
    let mut out: Vec<Component> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }
    out.iter().collect()
}

/// Absolute, lexically cleaned form of `path`; walked records carry their path in this form.
pub fn absolute(path: &Path) -> Result<PathBuf, Error> {
    std::path::absolute(path)
        .map(|path| clean(&path))
        .map_err(|source| Error::Metadata {
            path: path.to_path_buf(),
            source,
        })
}

/// Computes the archive name of `path`.
///
/// When `base` is a component-wise prefix of `path` it is removed; a partial match on a
/// directory name (`/a/b` against `/a/bc/x`) leaves the path untouched. Any root or volume
/// prefix is then dropped along with leading `..` components, and the rest is joined with `/`.
/// Applying this to a name it produced returns the same name.
pub fn canonical_name(path: &Path, base: Option<&Path>) -> Result<String, Error> {
    let cleaned = clean(path);
    let base = base
        .map(clean)
        .filter(|base| !base.as_os_str().is_empty());
    let relative = match base {
        Some(base) if base.is_absolute() == cleaned.is_absolute() => {
            match cleaned.strip_prefix(&base) {
                Ok(stripped) => stripped.to_path_buf(),
                Err(_) => cleaned,
            }
        }
        Some(base) => {
            let (full, base) = (absolute(&cleaned)?, absolute(&base)?);
            match full.strip_prefix(&base) {
                Ok(stripped) => stripped.to_path_buf(),
                Err(_) => cleaned,
            }
        }
        None => cleaned,
    };
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                tracing::warn!("dropping leading '..' from archive name of {:?}", path);
            }
            Component::Normal(part) => {
                let part = part.to_str().ok_or_else(|| Error::InvalidName {
                    path: path.to_path_buf(),
                    reason: "name is not valid UTF-8",
                })?;
                parts.push(part);
            }
        }
    }
    if parts.is_empty() {
        return Err(Error::InvalidName {
            path: path.to_path_buf(),
            reason: "name is empty after normalization",
        });
    }
    Ok(parts.join("/"))
}

/// Iterator over the regular files below a list of roots.
///
/// Stops after the first error: once an `Err` was yielded the iterator returns `None`.
pub struct PathWalker {
    roots: std::vec::IntoIter<PathBuf>,
    base: Option<PathBuf>,
    current: Option<walkdir::IntoIter>,
    failed: bool,
}

impl PathWalker {
    pub fn new<I, P>(roots: I, base: Option<&Path>) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            roots: roots
                .into_iter()
                .map(Into::into)
                .collect::<Vec<_>>()
                .into_iter(),
            base: base.map(Path::to_path_buf),
            current: None,
            failed: false,
        }
    }

    fn record(&self, entry: &walkdir::DirEntry) -> Result<PathRecord, Error> {
        let metadata = entry.metadata().map_err(|source| Error::Walk {
            path: entry.path().to_path_buf(),
            source,
        })?;
        let modified = metadata.modified().map_err(|source| Error::Metadata {
            path: entry.path().to_path_buf(),
            source,
        })?;
        Ok(PathRecord {
            path: absolute(entry.path())?,
            name: canonical_name(entry.path(), self.base.as_deref())?,
            size: metadata.len(),
            mode: metadata.mode(),
            modified,
        })
    }
}

impl Iterator for PathWalker {
    type Item = Result<PathRecord, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            let Some(entries) = self.current.as_mut() else {
                let root = self.roots.next()?;
                tracing::debug!("walking {:?}", root);
                self.current = Some(walkdir::WalkDir::new(root).follow_links(false).into_iter());
                continue;
            };
            let entry = match entries.next() {
                None => {
                    self.current = None;
                    continue;
                }
                Some(Err(source)) => {
                    self.failed = true;
                    let path = source.path().map(Path::to_path_buf).unwrap_or_default();
                    return Some(Err(Error::Walk { path, source }));
                }
                Some(Ok(entry)) => entry,
            };
            let file_type = entry.file_type();
            if file_type.is_dir() {
                continue;
            }
            if !file_type.is_file() {
                tracing::debug!("skipping {:?}: not a regular file", entry.path());
                continue;
            }
            let record = self.record(&entry);
            self.failed = record.is_err();
            return Some(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn names(roots: &[PathBuf], base: Option<&Path>) -> Vec<String> {
        let mut names = PathWalker::new(roots.to_vec(), base)
            .map(|record| record.unwrap().name)
            .collect::<Vec<_>>();
        names.sort();
        names
    }

    #[test]
    fn strips_base_path() {
        let name = canonical_name(Path::new("/tmp/src/sub/b.txt"), Some(Path::new("/tmp/src")));
        assert_eq!(name.unwrap(), "sub/b.txt");
    }

    #[test]
    fn never_partially_matches_sibling() {
        let name = canonical_name(Path::new("/a/bc/x"), Some(Path::new("/a/b"))).unwrap();
        assert_eq!(name, "a/bc/x");
        let name = canonical_name(Path::new("/a/b/x"), Some(Path::new("/a/b/"))).unwrap();
        assert_eq!(name, "x");
    }

    #[test]
    fn drops_root_and_parent_components() {
        assert_eq!(canonical_name(Path::new("/etc/hosts"), None).unwrap(), "etc/hosts");
        assert_eq!(canonical_name(Path::new("./a//b/./c"), None).unwrap(), "a/b/c");
        assert_eq!(canonical_name(Path::new("../../x/y"), None).unwrap(), "x/y");
        assert_eq!(canonical_name(Path::new("a/../b"), None).unwrap(), "b");
    }

    #[test]
    fn rejects_empty_names() {
        for path in ["/", ".", "a/..", ""] {
            assert!(
                matches!(
                    canonical_name(Path::new(path), None),
                    Err(Error::InvalidName { .. })
                ),
                "{path:?} should be rejected"
            );
        }
        assert!(canonical_name(Path::new("/tmp/src"), Some(Path::new("/tmp/src"))).is_err());
    }

    #[test]
    fn rejects_non_utf8_names() {
        use std::os::unix::ffi::OsStrExt;
        let path = Path::new(std::ffi::OsStr::from_bytes(b"dir/\xff.bin"));
        assert!(matches!(
            canonical_name(path, None),
            Err(Error::InvalidName { .. })
        ));
    }

    #[test]
    fn relative_path_with_absolute_base() {
        let cwd = std::env::current_dir().unwrap();
        let name = canonical_name(Path::new("sub/file"), Some(&cwd)).unwrap();
        assert_eq!(name, "sub/file");
    }

    proptest! {
        #[test]
        fn normalization_is_idempotent(
            parts in prop::collection::vec("[a-zA-Z0-9_][a-zA-Z0-9_.-]{0,8}", 1..6),
            prefix in prop::sample::select(vec!["", "/", "./", "../", "//"]),
        ) {
            let raw = format!("{prefix}{}", parts.join("/"));
            let once = canonical_name(Path::new(&raw), None).unwrap();
            let twice = canonical_name(Path::new(&once), None).unwrap();
            prop_assert_eq!(&once, &twice);
            prop_assert!(!once.starts_with('/'));
            prop_assert!(!once.is_empty());
        }
    }

    #[test]
    fn walks_regular_files_with_base() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        std::fs::create_dir_all(src.join("sub")).unwrap();
        std::fs::create_dir_all(src.join("empty")).unwrap();
        std::fs::write(src.join("a.txt"), "a").unwrap();
        std::fs::write(src.join("sub/b.txt"), "bb").unwrap();
        let roots = vec![src.join("a.txt"), src.join("sub/b.txt")];
        assert_eq!(names(&roots, Some(&src)), vec!["a.txt", "sub/b.txt"]);
        assert_eq!(names(&[src.clone()], Some(tmp.path())), vec!["src/a.txt", "src/sub/b.txt"]);
    }

    #[test]
    fn records_carry_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("data.bin");
        std::fs::write(&file, [7u8; 42]).unwrap();
        let records = PathWalker::new([file.clone()], Some(tmp.path()))
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].size, 42);
        assert_eq!(records[0].path, file);
        assert_eq!(records[0].name, "data.bin");
        assert!(records[0].path.is_absolute());
    }

    #[test]
    fn skips_symlinks() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("real"), "x").unwrap();
        std::os::unix::fs::symlink(tmp.path().join("real"), tmp.path().join("link")).unwrap();
        assert_eq!(names(&[tmp.path().to_path_buf()], Some(tmp.path())), vec!["real"]);
    }

    #[test]
    fn stops_at_first_error() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("ok"), "x").unwrap();
        let mut walker = PathWalker::new(
            [tmp.path().join("missing"), tmp.path().join("ok")],
            Some(tmp.path()),
        );
        assert!(matches!(walker.next(), Some(Err(Error::Walk { .. }))));
        assert!(walker.next().is_none());
    }
}
