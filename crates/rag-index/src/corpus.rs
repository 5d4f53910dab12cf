//! Corpus loading and paragraph chunking.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use rag_core::{RagError, Result};

/// A chunk of a source document.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub document_id: String,
    pub chunk_index: u32,
    pub text: String,
    /// blake3 hash of the chunk text.
    pub content_hash: String,
}

/// An in-memory set of chunks.
#[derive(Debug, Clone, Default)]
pub struct Corpus {
    chunks: Vec<Chunk>,
}

impl Corpus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a corpus from `(document_id, text)` pairs.
    pub fn from_documents<'a>(documents: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut corpus = Self::new();
        for (document_id, text) in documents {
            corpus.add_document(document_id, text);
        }
        corpus
    }

    /// Load every `.md` and `.txt` file under `root`. Document ids are paths
    /// relative to `root` with `/` separators.
    pub fn load_dir(root: &Path, recursive: bool) -> Result<Self> {
        if !root.is_dir() {
            return Err(RagError::invalid_argument(format!(
                "corpus path is not a directory: {}",
                root.display()
            )));
        }

        let mut files = collect_files(root, recursive)?;
        files.sort();

        let mut corpus = Self::new();
        for path in files {
            let text = match fs::read_to_string(&path) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Skipping {}: {}", path.display(), e);
                    continue;
                }
            };
            let document_id = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            corpus.add_document(&document_id, &text);
        }

        debug!(
            "Loaded {} chunk(s) from {}",
            corpus.chunks.len(),
            root.display()
        );
        Ok(corpus)
    }

    /// Split `text` into paragraphs and append them. Repeated paragraphs
    /// within a document are stored once.
    pub fn add_document(&mut self, document_id: &str, text: &str) {
        let mut seen = HashSet::new();
        let mut chunk_index = 0u32;
        for paragraph in split_paragraphs(text) {
            let content_hash = blake3::hash(paragraph.as_bytes()).to_hex().to_string();
            if !seen.insert(content_hash.clone()) {
                continue;
            }
            self.chunks.push(Chunk {
                document_id: document_id.to_string(),
                chunk_index,
                text: paragraph,
                content_hash,
            });
            chunk_index += 1;
        }
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// Split on blank lines. A markdown heading standing alone is joined to the
/// paragraph after it.
pub fn split_paragraphs(text: &str) -> Vec<String> {
    let normalized = text.replace("\r\n", "\n");
    let mut paragraphs = Vec::new();
    let mut heading: Option<String> = None;

    for block in normalized.split("\n\n") {
        let block = block.trim();
        if block.is_empty() {
            continue;
        }
        let is_heading = block.starts_with('#') && !block.contains('\n');
        if is_heading {
            if let Some(previous) = heading.take() {
                paragraphs.push(previous);
            }
            heading = Some(block.to_string());
            continue;
        }
        match heading.take() {
            Some(h) => paragraphs.push(format!("{}\n{}", h, block)),
            None => paragraphs.push(block.to_string()),
        }
    }
    if let Some(h) = heading {
        paragraphs.push(h);
    }
    paragraphs
}

fn collect_files(path: &Path, recursive: bool) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry_path = entry?.path();
        if entry_path.is_file() && is_supported_file(&entry_path) {
            files.push(entry_path);
        } else if entry_path.is_dir() && recursive {
            files.extend(collect_files(&entry_path, recursive)?);
        }
    }
    Ok(files)
}

fn is_supported_file(path: &Path) -> bool {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    matches!(ext, "md" | "markdown" | "txt")
}
