//! Corpus scanning and per-format document loading.
//!
//! [`scan_corpus`] walks the configured corpus root and returns the files a
//! loader exists for. Each [`DocumentFormat`] has one [`DocumentLoader`]
//! implementation, chosen by [`loader_for`]:
//!
//! | Format | Loader | Extraction |
//! |--------|--------|------------|
//! | `.pdf` | [`PdfLoader`] | `pdf-extract` |
//! | `.md`, `.markdown` | [`MarkdownLoader`] | rendered to plain text with `pulldown-cmark` |
//! | `.txt` | [`TextLoader`] | read as UTF-8 (invalid bytes replaced) |
//!
//! Load errors are per file: the ingestion run logs and skips them. Entries
//! the walk itself cannot read (broken links, unreadable directories) are
//! skipped too and reported in [`CorpusScan::unreadable`].

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use chrono::Utc;
use globset::{Glob, GlobSet, GlobSetBuilder};
use pulldown_cmark::{Event, Parser, Tag};
use ragtutor_core::models::{Document, DocumentFormat};
use thiserror::Error;
use tracing::warn;
use walkdir::WalkDir;

use crate::config::CorpusConfig;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("PDF extraction failed for {path}: {message}")]
    Pdf { path: PathBuf, message: String },
}

/// Reads one file format into a [`Document`].
pub trait DocumentLoader: Send + Sync {
    fn format(&self) -> DocumentFormat;
    fn load(&self, path: &Path, source_id: &str) -> Result<Document, LoadError>;
}

fn read_bytes(path: &Path) -> Result<Vec<u8>, LoadError> {
    std::fs::read(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn document(source_id: &str, format: DocumentFormat, raw_text: String) -> Document {
    Document {
        source_id: source_id.to_string(),
        format,
        raw_text,
        load_timestamp: Utc::now(),
    }
}

pub struct PdfLoader;

impl DocumentLoader for PdfLoader {
    fn format(&self) -> DocumentFormat {
        DocumentFormat::Pdf
    }

    fn load(&self, path: &Path, source_id: &str) -> Result<Document, LoadError> {
        let bytes = read_bytes(path)?;
        let text = pdf_extract::extract_text_from_mem(&bytes).map_err(|e| LoadError::Pdf {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Ok(document(source_id, DocumentFormat::Pdf, text))
    }
}

pub struct MarkdownLoader;

impl DocumentLoader for MarkdownLoader {
    fn format(&self) -> DocumentFormat {
        DocumentFormat::Markdown
    }

    fn load(&self, path: &Path, source_id: &str) -> Result<Document, LoadError> {
        let bytes = read_bytes(path)?;
        let text = markdown_to_text(&String::from_utf8_lossy(&bytes));
        Ok(document(source_id, DocumentFormat::Markdown, text))
    }
}

pub struct TextLoader;

impl DocumentLoader for TextLoader {
    fn format(&self) -> DocumentFormat {
        DocumentFormat::Text
    }

    fn load(&self, path: &Path, source_id: &str) -> Result<Document, LoadError> {
        let bytes = read_bytes(path)?;
        let text = String::from_utf8_lossy(&bytes).into_owned();
        Ok(document(source_id, DocumentFormat::Text, text))
    }
}

pub fn loader_for(format: DocumentFormat) -> &'static dyn DocumentLoader {
    match format {
        DocumentFormat::Pdf => &PdfLoader,
        DocumentFormat::Markdown => &MarkdownLoader,
        DocumentFormat::Text => &TextLoader,
    }
}

/// Strip Markdown syntax, keeping text and code with paragraph breaks
/// between blocks so the chunker can split on them.
pub fn markdown_to_text(markdown: &str) -> String {
    let mut out = String::with_capacity(markdown.len());
    for event in Parser::new(markdown) {
        match event {
            Event::Text(text) | Event::Code(text) | Event::Html(text) => out.push_str(&text),
            Event::SoftBreak | Event::HardBreak => out.push('\n'),
            Event::End(Tag::Paragraph)
            | Event::End(Tag::Heading(..))
            | Event::End(Tag::CodeBlock(_))
            | Event::End(Tag::BlockQuote)
            | Event::End(Tag::List(_))
            | Event::Rule => out.push_str("\n\n"),
            Event::End(Tag::Item) | Event::End(Tag::TableRow) | Event::End(Tag::TableHead) => {
                out.push('\n')
            }
            Event::End(Tag::TableCell) => out.push('\t'),
            _ => {}
        }
    }
    out.trim().to_string()
}

/// A corpus file with a known loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorpusFile {
    pub path: PathBuf,
    /// Path relative to the corpus root, `/`-separated.
    pub source_id: String,
    pub format: DocumentFormat,
}

impl CorpusFile {
    pub fn load(&self) -> Result<Document, LoadError> {
        loader_for(self.format).load(&self.path, &self.source_id)
    }
}

/// Files found by [`scan_corpus`].
#[derive(Debug, Clone, Default)]
pub struct CorpusScan {
    /// Loadable files, sorted by source id.
    pub files: Vec<CorpusFile>,
    /// Source ids of entries the walk could not read. An unreadable
    /// directory covers every source beneath it; `""` covers the whole corpus.
    pub unreadable: Vec<String>,
}

impl CorpusScan {
    /// Whether `source_id` is at or beneath an unreadable entry.
    pub fn is_unreadable(&self, source_id: &str) -> bool {
        self.unreadable.iter().any(|p| under(source_id, p))
    }
}

/// Walk the corpus root and list loadable files.
///
/// When `only` is non-empty, just the files at or beneath those paths are
/// returned. Paths may be absolute, relative to the working directory, or
/// relative to the corpus root.
pub fn scan_corpus(corpus: &CorpusConfig, only: &[PathBuf]) -> Result<CorpusScan> {
    let root = &corpus.root;
    if !root.exists() {
        bail!("Corpus root does not exist: {}", root.display());
    }

    let include_set = build_globset(&corpus.include_globs)?;

    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    default_excludes.extend(corpus.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let prefixes: Vec<String> = only.iter().map(|p| source_prefix(root, p)).collect();

    let mut files = Vec::new();
    let mut unreadable = Vec::new();
    for entry in WalkDir::new(root).follow_links(corpus.follow_symlinks) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let source_id = e
                    .path()
                    .map(|p| to_source_id(p.strip_prefix(root).unwrap_or(p)))
                    .unwrap_or_default();
                warn!(source = %source_id, error = %e, "skipping unreadable corpus entry");
                unreadable.push(source_id);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let source_id = to_source_id(relative);

        if exclude_set.is_match(&source_id) || !include_set.is_match(&source_id) {
            continue;
        }
        if !prefixes.is_empty() && !prefixes.iter().any(|p| under(&source_id, p)) {
            continue;
        }
        let Some(format) = DocumentFormat::detect(path) else {
            continue;
        };

        files.push(CorpusFile {
            path: path.to_path_buf(),
            source_id,
            format,
        });
    }

    files.sort_by(|a, b| a.source_id.cmp(&b.source_id));
    Ok(CorpusScan { files, unreadable })
}

fn to_source_id(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Source-id prefix for a user-supplied path.
fn source_prefix(root: &Path, path: &Path) -> String {
    let canonical_root = root.canonicalize().ok();
    if let (Some(root), Ok(full)) = (&canonical_root, path.canonicalize()) {
        if let Ok(rel) = full.strip_prefix(root) {
            return to_source_id(rel);
        }
    }
    let rel = path.strip_prefix(root).unwrap_or(path);
    to_source_id(rel).trim_matches('/').to_string()
}

fn under(source_id: &str, prefix: &str) -> bool {
    prefix.is_empty()
        || source_id == prefix
        || source_id
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn corpus(root: &Path) -> CorpusConfig {
        CorpusConfig {
            root: root.to_path_buf(),
            include_globs: vec![
                "**/*.pdf".to_string(),
                "**/*.md".to_string(),
                "**/*.txt".to_string(),
            ],
            exclude_globs: vec![],
            follow_symlinks: false,
        }
    }

    fn write(root: &Path, rel: &str, content: &[u8]) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_scan_filters_and_sorts() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "b.md", b"# B");
        write(dir.path(), "a/notes.txt", b"notes");
        write(dir.path(), "image.png", b"\x89PNG");
        write(dir.path(), ".git/config.txt", b"ignored");

        let files = scan_corpus(&corpus(dir.path()), &[]).unwrap().files;
        let ids: Vec<&str> = files.iter().map(|f| f.source_id.as_str()).collect();
        assert_eq!(ids, vec!["a/notes.txt", "b.md"]);
        assert_eq!(files[1].format, DocumentFormat::Markdown);
    }

    #[test]
    fn test_scan_restricted_to_paths() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "graphs/bfs.md", b"bfs");
        write(dir.path(), "graphs2/other.md", b"x");
        write(dir.path(), "sorting.txt", b"sort");

        let only = vec![PathBuf::from("graphs")];
        let files = scan_corpus(&corpus(dir.path()), &only).unwrap().files;
        let ids: Vec<&str> = files.iter().map(|f| f.source_id.as_str()).collect();
        assert_eq!(ids, vec!["graphs/bfs.md"]);

        let only = vec![dir.path().join("sorting.txt")];
        let files = scan_corpus(&corpus(dir.path()), &only).unwrap().files;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].source_id, "sorting.txt");
    }

    #[test]
    fn test_missing_root() {
        let dir = TempDir::new().unwrap();
        let err = scan_corpus(&corpus(&dir.path().join("nope")), &[]).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_markdown_to_text() {
        let md = "# Heaps\n\nA *heap* is a `tree`.\n\n```rust\nlet h = {};\n```\n\n- one\n- two\n";
        let text = markdown_to_text(md);
        assert!(text.starts_with("Heaps\n\nA heap is a tree."));
        assert!(text.contains("let h = {};"));
        assert!(text.contains("one\n"));
        assert!(!text.contains('#'));
        assert!(!text.contains('*'));
    }

    #[test]
    fn test_text_loader_replaces_invalid_utf8() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "bad.txt", b"ok \xff done");
        let file = &scan_corpus(&corpus(dir.path()), &[]).unwrap().files[0];
        let doc = file.load().unwrap();
        assert_eq!(doc.source_id, "bad.txt");
        assert!(doc.raw_text.starts_with("ok "));
        assert!(doc.raw_text.ends_with(" done"));
    }

    #[test]
    fn test_invalid_pdf_is_load_error() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "broken.pdf", b"not a pdf at all");
        let file = &scan_corpus(&corpus(dir.path()), &[]).unwrap().files[0];
        assert!(matches!(file.load(), Err(LoadError::Pdf { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_scan_skips_broken_symlink() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "heaps.md", b"# Heaps");
        write(dir.path(), "sorting/quick.txt", b"pivot");
        std::os::unix::fs::symlink(dir.path().join("gone.md"), dir.path().join("dangling.md"))
            .unwrap();

        let mut config = corpus(dir.path());
        config.follow_symlinks = true;
        let scan = scan_corpus(&config, &[]).unwrap();

        let ids: Vec<&str> = scan.files.iter().map(|f| f.source_id.as_str()).collect();
        assert_eq!(ids, vec!["heaps.md", "sorting/quick.txt"]);
        assert_eq!(scan.unreadable, vec!["dangling.md"]);
        assert!(scan.is_unreadable("dangling.md"));
        assert!(!scan.is_unreadable("heaps.md"));
    }
}
