//! Page backing store with atomic whole-file writes, plus page discovery for a target tree.

use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context};
use sha2::{Digest, Sha256};
use sitepatch_core::PageTarget;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;
use walkdir::{DirEntry, WalkDir};

pub const CRATE_NAME: &str = "sitepatch-storage";

pub const DEFAULT_EXTENSIONS: &[&str] = &["tsx", "jsx", "ts", "js", "mdx"];
pub const DEFAULT_EXCLUDED_DIRS: &[&str] = &["node_modules", ".next", ".git"];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("reading {}: {}", .path.display(), .source)]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{} is not valid UTF-8", .path.display())]
    NotUtf8 { path: PathBuf },
    #[error("writing {}: {}", .path.display(), .source)]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Whole-file read and write access to page sources.
pub trait PageStore {
    fn read_page(&self, path: &Path) -> Result<String, StoreError>;
    fn write_page(&self, path: &Path, content: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FsPageStore;

impl PageStore for FsPageStore {
    fn read_page(&self, path: &Path) -> Result<String, StoreError> {
        let bytes = fs::read(path).map_err(|source| StoreError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        String::from_utf8(bytes).map_err(|_| StoreError::NotUtf8 {
            path: path.to_path_buf(),
        })
    }

    /// Replace the file through a sibling temp file and an atomic rename, keeping the
    /// original permissions.
    fn write_page(&self, path: &Path, content: &str) -> Result<(), StoreError> {
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), content.len()));
        let permissions = fs::metadata(path).ok().map(|m| m.permissions());

        match write_then_rename(&temp_path, path, content.as_bytes(), permissions) {
            Ok(()) => {
                debug!(path = %path.display(), bytes = content.len(), "page written");
                Ok(())
            }
            Err(source) => {
                let _ = fs::remove_file(&temp_path);
                Err(StoreError::Write {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
    }
}

fn write_then_rename(
    temp_path: &Path,
    dest: &Path,
    bytes: &[u8],
    permissions: Option<fs::Permissions>,
) -> io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(temp_path)?;
    file.write_all(bytes)?;
    file.flush()?;
    file.sync_all()?;
    drop(file);
    if let Some(permissions) = permissions {
        fs::set_permissions(temp_path, permissions)?;
    }
    fs::rename(temp_path, dest)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Recursive discovery of page sources under a target directory.
#[derive(Debug, Clone)]
pub struct PageWalker {
    root: PathBuf,
    extensions: Vec<String>,
    excluded_dirs: Vec<String>,
    page_stems: Vec<String>,
}

impl PageWalker {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extensions: DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
            excluded_dirs: DEFAULT_EXCLUDED_DIRS.iter().map(|s| s.to_string()).collect(),
            page_stems: Vec::new(),
        }
    }

    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.extensions = extensions
            .into_iter()
            .map(|e| e.as_ref().trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        self
    }

    /// Only keep files whose stem is listed (e.g. `page`). Empty keeps every file.
    pub fn with_page_stems<I, S>(mut self, stems: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.page_stems = stems
            .into_iter()
            .map(|s| s.as_ref().trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn is_excluded_dir(&self, entry: &DirEntry) -> bool {
        if entry.depth() == 0 || !entry.file_type().is_dir() {
            return false;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        name.starts_with('.') || self.excluded_dirs.contains(&name)
    }

    fn is_page_file(&self, path: &Path) -> bool {
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if !self.extensions.iter().any(|e| *e == extension) {
            return false;
        }
        if self.page_stems.is_empty() {
            return true;
        }
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.page_stems.iter().any(|s| *s == stem)
    }

    /// Matching files in a stable, sorted order.
    pub fn collect_paths(&self) -> anyhow::Result<Vec<PathBuf>> {
        if !self.root.is_dir() {
            bail!("target directory {} does not exist", self.root.display());
        }
        let mut paths = Vec::new();
        let walker = WalkDir::new(&self.root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !self.is_excluded_dir(e));
        for entry in walker {
            let entry = entry.with_context(|| format!("walking {}", self.root.display()))?;
            if entry.file_type().is_file() && self.is_page_file(entry.path()) {
                paths.push(entry.into_path());
            }
        }
        paths.sort();
        Ok(paths)
    }

    pub fn collect_targets(&self) -> anyhow::Result<Vec<PageTarget>> {
        Ok(self
            .collect_paths()?
            .into_iter()
            .map(|path| PageTarget {
                slug: slug_for_path(&self.root, &path),
                path,
            })
            .collect())
    }
}

/// Route-style slug of a page: relative path without extension, `page`/`index` stems and
/// `(group)` segments dropped. The root page is `index`.
pub fn slug_for_path(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let mut segments = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>();

    if let Some(last) = segments.pop() {
        let stem = Path::new(&last)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or(last);
        if stem != "page" && stem != "index" {
            segments.push(stem);
        }
    }

    let segments = segments
        .into_iter()
        .filter(|s| !(s.starts_with('(') && s.ends_with(')')))
        .collect::<Vec<_>>();
    if segments.is_empty() {
        "index".to_string()
    } else {
        segments.join("/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn touch(root: &Path, rel: &str, content: &str) -> PathBuf {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, content).expect("write");
        path
    }

    #[test]
    fn content_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn atomic_write_replaces_whole_file_and_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let path = touch(dir.path(), "services/page.tsx", "old body that is longer than new");
        let store = FsPageStore;

        store.write_page(&path, "new").expect("write");

        assert_eq!(store.read_page(&path).expect("read"), "new");
        let leftovers = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn write_into_missing_directory_is_a_write_error() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("missing").join("page.tsx");
        let err = FsPageStore.write_page(&path, "x").unwrap_err();
        assert!(matches!(err, StoreError::Write { .. }));
        assert!(err.to_string().contains("page.tsx"));
    }

    #[test]
    fn non_utf8_pages_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("page.tsx");
        fs::write(&path, [0xff, 0xfe, 0x00]).expect("write");
        let err = FsPageStore.read_page(&path).unwrap_err();
        assert!(matches!(err, StoreError::NotUtf8 { .. }));
    }

    #[test]
    fn slugs_follow_route_layout() {
        let root = Path::new("/site/app");
        assert_eq!(slug_for_path(root, &root.join("page.tsx")), "index");
        assert_eq!(
            slug_for_path(root, &root.join("commercial/historic-restoration/page.tsx")),
            "commercial/historic-restoration"
        );
        assert_eq!(
            slug_for_path(root, &root.join("(marketing)/locations/tampa/page.tsx")),
            "locations/tampa"
        );
        assert_eq!(
            slug_for_path(root, &root.join("blog/storm-prep.mdx")),
            "blog/storm-prep"
        );
    }

    #[test]
    fn walker_filters_extensions_stems_and_excluded_dirs() {
        let dir = tempdir().expect("tempdir");
        let root = dir.path();
        touch(root, "page.tsx", "");
        touch(root, "services/roofing/page.tsx", "");
        touch(root, "services/roofing/layout.tsx", "");
        touch(root, "services/roofing/styles.css", "");
        touch(root, "node_modules/pkg/page.tsx", "");
        touch(root, ".next/server/page.tsx", "");

        let all = PageWalker::new(root).collect_paths().expect("walk");
        assert_eq!(all.len(), 3);

        let pages = PageWalker::new(root)
            .with_page_stems(["page"])
            .collect_targets()
            .expect("walk");
        let slugs = pages.iter().map(|t| t.slug.as_str()).collect::<Vec<_>>();
        assert_eq!(slugs, vec!["index", "services/roofing"]);

        let css = PageWalker::new(root)
            .with_extensions([".CSS"])
            .collect_paths()
            .expect("walk");
        assert_eq!(css.len(), 1);
    }

    #[test]
    fn walker_requires_existing_root() {
        let dir = tempdir().expect("tempdir");
        let err = PageWalker::new(dir.path().join("nope"))
            .collect_paths()
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
