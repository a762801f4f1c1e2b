//! A rooted, filesystem-like namespace (§4.3). `Workspace` is the per-instance remote or
//! logdir root; `WorkspaceCollection` mints and tracks a set of named workspaces. Grounded on
//! `bench-harness::tasks::{try_copy, try_copy_dir, HostFolderSink}` for the directory-backed
//! copy semantics and `bench-harness::setup`'s `#[cfg(unix)]` permission-bit handling for mode
//! preservation.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context as _, Result};

/// A rooted namespace of files. Paths passed to its methods are always relative to the
/// workspace root.
pub trait Workspace: Send + Sync {
    fn root(&self) -> &Path;

    fn open_read(&self, path: &str) -> Result<Box<dyn Read>> {
        let full = self.root().join(path);
        Ok(Box::new(File::open(&full).with_context(|| format!("opening {}", full.display()))?))
    }

    fn open_write(&self, path: &str, append: bool) -> Result<Box<dyn Write>> {
        let full = self.root().join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
        }
        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .append(append)
            .truncate(!append)
            .open(&full)
            .with_context(|| format!("opening {} for write", full.display()))?;
        Ok(Box::new(file))
    }

    fn write_all(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let mut f = self.open_write(path, false)?;
        f.write_all(bytes)?;
        Ok(())
    }

    /// Copies `source` (a real filesystem path) into `path`, preserving Unix executable bits.
    fn write_file_from(&self, path: &str, source: &Path) -> Result<()> {
        let full = self.root().join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
        }
        fs::copy(source, &full).with_context(|| format!("copying {} to {}", source.display(), full.display()))?;
        copy_mode(source, &full)?;
        Ok(())
    }

    fn exists(&self, path: &str) -> bool {
        self.root().join(path).exists()
    }

    /// Paths (relative to the workspace root) matching `pattern`, a glob restricted to this
    /// workspace.
    fn glob(&self, pattern: &str) -> Result<Vec<String>> {
        let full_pattern = self.root().join(pattern);
        let full_pattern = full_pattern.to_string_lossy().into_owned();
        let mut out = vec![];
        for entry in glob::glob(&full_pattern).with_context(|| format!("bad glob pattern: {pattern}"))? {
            let path = entry?;
            if let Ok(rel) = path.strip_prefix(self.root()) {
                out.push(rel.to_string_lossy().into_owned());
            }
        }
        out.sort();
        Ok(out)
    }

    /// All regular files under the workspace root, recursively, as root-relative paths.
    fn files(&self) -> Result<Vec<String>> {
        let mut out = vec![];
        if !self.root().exists() {
            return Ok(out);
        }
        for entry in walkdir::WalkDir::new(self.root()).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_file() {
                if let Ok(rel) = entry.path().strip_prefix(self.root()) {
                    out.push(rel.to_string_lossy().into_owned());
                }
            }
        }
        out.sort();
        Ok(out)
    }

    fn mode(&self, path: &str) -> Result<u32> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let full = self.root().join(path);
            Ok(fs::metadata(&full)?.permissions().mode())
        }
        #[cfg(not(unix))]
        {
            let _ = path;
            Ok(0o644)
        }
    }

    fn set_mode(&self, path: &str, mode: u32) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let full = self.root().join(path);
            fs::set_permissions(&full, fs::Permissions::from_mode(mode))?;
        }
        #[cfg(not(unix))]
        {
            let _ = (path, mode);
        }
        Ok(())
    }

    /// A workspace rooted at `<root>/<name>`, created on demand.
    fn subspace(&self, name: &str) -> Result<LocalWorkspace> {
        let root = self.root().join(name);
        fs::create_dir_all(&root).with_context(|| format!("creating subspace {}", root.display()))?;
        Ok(LocalWorkspace { root })
    }

    fn destroy(&self) -> Result<()> {
        if self.root().exists() {
            fs::remove_dir_all(self.root()).with_context(|| format!("removing {}", self.root().display()))?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn copy_mode(source: &Path, dest: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = fs::metadata(source)?.permissions();
    fs::set_permissions(dest, fs::Permissions::from_mode(perms.mode()))?;
    Ok(())
}

#[cfg(not(unix))]
fn copy_mode(_source: &Path, _dest: &Path) -> Result<()> {
    Ok(())
}

/// A directory-backed workspace: the bundled local implementation.
#[derive(Debug, Clone)]
pub struct LocalWorkspace {
    root: PathBuf,
}

impl LocalWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).with_context(|| format!("creating {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Workspace for LocalWorkspace {
    fn root(&self) -> &Path {
        &self.root
    }
}

/// Mints and tracks named workspaces. `open`/`new_workspace`/`destroy`/`names` mirror the
/// spec's `WorkspaceCollection` (`new` is a reserved word in Rust, hence `new_workspace`).
pub trait WorkspaceCollection: Send + Sync {
    fn open(&self, name: &str) -> Result<LocalWorkspace>;
    fn new_workspace(&self, prefix: Option<&str>) -> Result<LocalWorkspace>;
    fn destroy_named(&self, name: &str) -> Result<()>;
    fn names(&self) -> Result<Vec<String>>;
}

/// The bundled directory-backed collection: every workspace is a subdirectory of `root`.
pub struct LocalWorkspaceCollection {
    root: PathBuf,
    counter: AtomicUsize,
}

impl LocalWorkspaceCollection {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root, counter: AtomicUsize::new(0) })
    }
}

impl WorkspaceCollection for LocalWorkspaceCollection {
    fn open(&self, name: &str) -> Result<LocalWorkspace> {
        LocalWorkspace::new(self.root.join(name))
    }

    fn new_workspace(&self, prefix: Option<&str>) -> Result<LocalWorkspace> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let name = match prefix {
            Some(p) => format!("{p}-{n}"),
            None => format!("ws-{n}"),
        };
        self.open(&name)
    }

    fn destroy_named(&self, name: &str) -> Result<()> {
        let path = self.root.join(name);
        if path.exists() {
            fs::remove_dir_all(&path)?;
        }
        Ok(())
    }

    fn names(&self) -> Result<Vec<String>> {
        let mut out = vec![];
        if !self.root.exists() {
            return Ok(out);
        }
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                out.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        out.sort();
        Ok(out)
    }
}

/// An ephemeral remote-workspace collection backed by a single `tempfile::TempDir`; every
/// minted workspace is a subdirectory, and the whole collection (and every workspace it
/// created) is removed when it is dropped or `destroy`d.
pub struct TempWorkspaceCollection {
    dir: tempfile::TempDir,
    counter: AtomicUsize,
}

impl TempWorkspaceCollection {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("creating ephemeral workspace collection")?;
        Ok(Self { dir, counter: AtomicUsize::new(0) })
    }

    pub fn destroy(self) -> Result<()> {
        self.dir.close().context("removing ephemeral workspace collection")
    }
}

impl WorkspaceCollection for TempWorkspaceCollection {
    fn open(&self, name: &str) -> Result<LocalWorkspace> {
        LocalWorkspace::new(self.dir.path().join(name))
    }

    fn new_workspace(&self, prefix: Option<&str>) -> Result<LocalWorkspace> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let name = match prefix {
            Some(p) => format!("{p}-{n}"),
            None => format!("ws-{n}"),
        };
        self.open(&name)
    }

    fn destroy_named(&self, name: &str) -> Result<()> {
        let path = self.dir.path().join(name);
        if path.exists() {
            fs::remove_dir_all(&path)?;
        }
        Ok(())
    }

    fn names(&self) -> Result<Vec<String>> {
        let mut out = vec![];
        for entry in fs::read_dir(self.dir.path())? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                out.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        out.sort();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = LocalWorkspace::new(tmp.path()).unwrap();
        ws.write_all("a/b.txt", b"hello").unwrap();
        assert!(ws.exists("a/b.txt"));
        let mut buf = String::new();
        ws.open_read("a/b.txt").unwrap().read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "hello");
    }

    #[test]
    fn glob_matches_relative_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = LocalWorkspace::new(tmp.path()).unwrap();
        ws.write_all("data/a.csv", b"1").unwrap();
        ws.write_all("data/b.csv", b"2").unwrap();
        ws.write_all("data/c.txt", b"3").unwrap();
        let mut matches = ws.glob("data/*.csv").unwrap();
        matches.sort();
        assert_eq!(matches, vec!["data/a.csv".to_string(), "data/b.csv".to_string()]);
    }

    #[test]
    fn subspace_is_created_on_demand() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = LocalWorkspace::new(tmp.path()).unwrap();
        let sub = ws.subspace("nested").unwrap();
        assert!(sub.root().exists());
        sub.write_all("f.txt", b"x").unwrap();
        assert!(ws.exists("nested/f.txt"));
    }

    #[test]
    fn destroy_removes_the_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = LocalWorkspace::new(tmp.path().join("root")).unwrap();
        ws.write_all("f.txt", b"x").unwrap();
        ws.destroy().unwrap();
        assert!(!ws.root().exists());
    }

    #[cfg(unix)]
    #[test]
    fn executable_bit_is_preserved_on_copy() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("script.sh");
        fs::write(&source, b"#!/bin/sh\necho hi\n").unwrap();
        fs::set_permissions(&source, fs::Permissions::from_mode(0o755)).unwrap();

        let ws = LocalWorkspace::new(tmp.path().join("ws")).unwrap();
        ws.write_file_from("script.sh", &source).unwrap();
        let mode = ws.mode("script.sh").unwrap();
        assert_eq!(mode & 0o111, 0o111);
    }

    #[test]
    fn local_collection_mints_distinct_workspaces() {
        let tmp = tempfile::tempdir().unwrap();
        let collection = LocalWorkspaceCollection::new(tmp.path()).unwrap();
        let a = collection.new_workspace(Some("inst")).unwrap();
        let b = collection.new_workspace(Some("inst")).unwrap();
        assert_ne!(a.root(), b.root());
        assert_eq!(collection.names().unwrap().len(), 2);
    }

    #[test]
    fn temp_collection_cleans_up_on_destroy() {
        let collection = TempWorkspaceCollection::new().unwrap();
        let ws = collection.new_workspace(None).unwrap();
        ws.write_all("f.txt", b"x").unwrap();
        let root = ws.root().to_path_buf();
        collection.destroy().unwrap();
        assert!(!root.exists());
    }
}
