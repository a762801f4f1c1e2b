//! Templated and glob-based file copying between workspaces (§3 FileMap entry; §4.4).
//! Grounded on `examples/original_source/grevling/filemap.py` (`SingleFileMap`, `FileMap`).

use std::path::Path;

use anyhow::{Context as _, Result};
use tracing::warn;

use crate::context::Context as Ctx;
use crate::template;
use crate::workspace::Workspace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMapMode {
    Simple,
    Glob,
}

/// One `(source, target, template, mode)` entry.
#[derive(Debug, Clone)]
pub struct SingleFileMap {
    pub source: String,
    pub target: String,
    pub template: bool,
    pub mode: FileMapMode,
}

impl SingleFileMap {
    pub fn simple(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self { source: source.into(), target: target.into(), template: false, mode: FileMapMode::Simple }
    }

    pub fn templated(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self { source: source.into(), target: target.into(), template: true, mode: FileMapMode::Simple }
    }

    pub fn glob(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self { source: source.into(), target: target.into(), template: false, mode: FileMapMode::Glob }
    }

    /// Applies this one entry, returning `Ok(true)` on success, `Ok(false)` if the source was
    /// missing and `ignore_missing` is set.
    fn apply(&self, ctx: &Ctx, src: &dyn Workspace, dst: &dyn Workspace, ignore_missing: bool) -> Result<bool> {
        match self.mode {
            FileMapMode::Simple => {
                let source_path = template::render(&self.source, ctx).context("rendering file map source")?;
                let target_path = template::render(&self.target, ctx).context("rendering file map target")?;
                if !src.exists(&source_path) {
                    return handle_missing(&source_path, ignore_missing);
                }
                if self.template {
                    let mut buf = vec![];
                    std::io::Read::read_to_end(&mut *src.open_read(&source_path)?, &mut buf)?;
                    let text = String::from_utf8(buf).with_context(|| format!("{source_path} is not valid UTF-8 for templating"))?;
                    let rendered = template::render(&text, ctx)?;
                    dst.write_all(&target_path, rendered.as_bytes())?;
                } else {
                    copy_between(src, dst, &source_path, &target_path)?;
                }
                Ok(true)
            }
            FileMapMode::Glob => {
                let pattern = template::render(&self.source, ctx).context("rendering glob source")?;
                let target_root = template::render(&self.target, ctx).context("rendering glob target")?;
                let matches = src.glob(&pattern)?;
                if matches.is_empty() {
                    return handle_missing(&pattern, ignore_missing);
                }
                for rel in matches {
                    let base = Path::new(&pattern).parent().map(Path::to_path_buf).unwrap_or_default();
                    let stripped = Path::new(&rel).strip_prefix(&base).unwrap_or(Path::new(&rel));
                    let dest = Path::new(&target_root).join(stripped);
                    copy_between(src, dst, &rel, &dest.to_string_lossy())?;
                }
                Ok(true)
            }
        }
    }
}

fn handle_missing(path: &str, ignore_missing: bool) -> Result<bool> {
    if ignore_missing {
        warn!(path, "file map source missing, ignored");
        Ok(false)
    } else {
        anyhow::bail!("file map source missing: {path}")
    }
}

fn copy_between(src: &dyn Workspace, dst: &dyn Workspace, source_path: &str, target_path: &str) -> Result<()> {
    let mut buf = vec![];
    std::io::Read::read_to_end(&mut *src.open_read(source_path)?, &mut buf)?;
    dst.write_all(target_path, &buf)?;
    if let Ok(mode) = src.mode(source_path) {
        let _ = dst.set_mode(target_path, mode);
    }
    Ok(())
}

/// An ordered sequence of [`SingleFileMap`] entries, applied in order.
#[derive(Debug, Clone, Default)]
pub struct FileMap {
    entries: Vec<SingleFileMap>,
}

impl FileMap {
    pub fn new() -> Self {
        Self { entries: vec![] }
    }

    pub fn push(&mut self, entry: SingleFileMap) {
        self.entries.push(entry);
    }

    /// Applies every entry in order. Returns `true` only if every entry succeeded (or was
    /// missing-and-ignored); stops at the first hard failure.
    pub fn apply(&self, ctx: &Ctx, src: &dyn Workspace, dst: &dyn Workspace, ignore_missing: bool) -> Result<bool> {
        for entry in &self.entries {
            if !entry.apply(ctx, src, dst, ignore_missing)? {
                if !ignore_missing {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;
    use crate::workspace::LocalWorkspace;

    fn ctx_with(pairs: &[(&str, Value)]) -> Ctx {
        let mut ctx = Ctx::new();
        for (k, v) in pairs {
            ctx.insert(*k, v.clone());
        }
        ctx
    }

    #[test]
    fn templated_file_is_rendered_on_copy() {
        let tmp = tempfile::tempdir().unwrap();
        let src = LocalWorkspace::new(tmp.path().join("src")).unwrap();
        let dst = LocalWorkspace::new(tmp.path().join("dst")).unwrap();
        src.write_all("in.txt", b"a=${alpha} b=${bravo} c=${charlie}").unwrap();

        let ctx = ctx_with(&[("alpha", Value::Int(2)), ("bravo", Value::Str("b".into())), ("charlie", Value::Int(3))]);
        let mut map = FileMap::new();
        map.push(SingleFileMap::templated("in.txt", "out.txt"));
        assert!(map.apply(&ctx, &src, &dst, false).unwrap());

        let mut buf = String::new();
        std::io::Read::read_to_string(&mut *dst.open_read("out.txt").unwrap(), &mut buf).unwrap();
        assert_eq!(buf, "a=2 b=b c=3");
    }

    #[test]
    fn simple_copy_preserves_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let src = LocalWorkspace::new(tmp.path().join("src")).unwrap();
        let dst = LocalWorkspace::new(tmp.path().join("dst")).unwrap();
        src.write_all("raw.bin", b"\x00\x01\x02").unwrap();

        let ctx = Ctx::new();
        let mut map = FileMap::new();
        map.push(SingleFileMap::simple("raw.bin", "raw.bin"));
        assert!(map.apply(&ctx, &src, &dst, false).unwrap());
        assert!(dst.exists("raw.bin"));
    }

    #[test]
    fn missing_source_errors_without_ignore() {
        let tmp = tempfile::tempdir().unwrap();
        let src = LocalWorkspace::new(tmp.path().join("src")).unwrap();
        let dst = LocalWorkspace::new(tmp.path().join("dst")).unwrap();
        let ctx = Ctx::new();
        let mut map = FileMap::new();
        map.push(SingleFileMap::simple("missing.txt", "out.txt"));
        assert!(map.apply(&ctx, &src, &dst, false).is_err());
    }

    #[test]
    fn missing_source_is_tolerated_with_ignore() {
        let tmp = tempfile::tempdir().unwrap();
        let src = LocalWorkspace::new(tmp.path().join("src")).unwrap();
        let dst = LocalWorkspace::new(tmp.path().join("dst")).unwrap();
        let ctx = Ctx::new();
        let mut map = FileMap::new();
        map.push(SingleFileMap::simple("missing.txt", "out.txt"));
        assert!(map.apply(&ctx, &src, &dst, true).unwrap());
    }

    #[test]
    fn glob_mirrors_relative_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let src = LocalWorkspace::new(tmp.path().join("src")).unwrap();
        let dst = LocalWorkspace::new(tmp.path().join("dst")).unwrap();
        src.write_all("data/a.csv", b"1").unwrap();
        src.write_all("data/b.csv", b"2").unwrap();

        let ctx = Ctx::new();
        let mut map = FileMap::new();
        map.push(SingleFileMap::glob("data/*.csv", "results"));
        assert!(map.apply(&ctx, &src, &dst, false).unwrap());
        assert!(dst.exists("results/a.csv"));
        assert!(dst.exists("results/b.csv"));
    }
}
