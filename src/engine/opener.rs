// Reverie Engine — Input Opener
// Resolves a filesystem path to a readable conversations byte stream:
// either the raw `conversations.json` file itself, or the first
// `conversations.json` entry inside a vendor export ZIP. Entries are
// located lazily; the decompressed stream borrows the archive so dropping
// the source closes everything and no descriptors leak on partial reads.

use crate::atoms::error::{EngineError, EngineResult};
use log::info;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use zip::ZipArchive;

const CONVERSATIONS_ENTRY: &str = "conversations.json";

/// What kind of source a path resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Json,
    Zip,
}

enum Inner {
    Plain(PathBuf),
    Zip { archive: ZipArchive<File>, entry: String },
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Inner::Plain(path) => f.debug_tuple("Plain").field(path).finish(),
            Inner::Zip { entry, .. } => f.debug_struct("Zip").field("entry", entry).finish(),
        }
    }
}

/// An opened export source. Call `reader()` to get the conversations byte
/// stream; the stream's lifetime is tied to this value.
#[derive(Debug)]
pub struct ExportSource {
    kind: SourceKind,
    inner: Inner,
}

impl ExportSource {
    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    /// The entry name inside the archive, when the source is a ZIP.
    pub fn entry_name(&self) -> Option<&str> {
        match &self.inner {
            Inner::Plain(_) => None,
            Inner::Zip { entry, .. } => Some(entry),
        }
    }

    pub fn reader(&mut self) -> EngineResult<Box<dyn Read + '_>> {
        match &mut self.inner {
            Inner::Plain(path) => {
                let file = File::open(&*path)?;
                Ok(Box::new(BufReader::new(file)))
            }
            Inner::Zip { archive, entry } => {
                let zf = archive.by_name(entry)?;
                Ok(Box::new(zf))
            }
        }
    }
}

/// Open an export path. A `.zip` extension selects archive mode; anything
/// else is treated as a plain JSON file.
pub fn open(path: &Path) -> EngineResult<ExportSource> {
    if !path.is_file() {
        return Err(EngineError::NotAFile(path.to_path_buf()));
    }

    let is_zip = path
        .extension()
        .map(|e| e.eq_ignore_ascii_case("zip"))
        .unwrap_or(false);

    if !is_zip {
        return Ok(ExportSource {
            kind: SourceKind::Json,
            inner: Inner::Plain(path.to_path_buf()),
        });
    }

    let file = File::open(path)?;
    let archive = ZipArchive::new(file)?;
    let entry = find_conversations_entry(&archive)
        .ok_or_else(|| EngineError::ConversationsJsonMissing(path.to_path_buf()))?;
    info!("[opener] Using archive entry '{}' from {}", entry, path.display());

    Ok(ExportSource {
        kind: SourceKind::Zip,
        inner: Inner::Zip { archive, entry },
    })
}

/// First entry whose basename equals `conversations.json`, case-insensitive.
fn find_conversations_entry(archive: &ZipArchive<File>) -> Option<String> {
    archive
        .file_names()
        .filter(|name| {
            let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
            base.eq_ignore_ascii_case(CONVERSATIONS_ENTRY)
        })
        .map(str::to_string)
        .min_by_key(|name| archive.index_for_name(name))
}
