use std::io;
use std::path::{Path, PathBuf};

use talkbook_engine::PositionStore;
use talkbook_types::SavedPosition;

/// Keeps one book's position in `<dir>/<book id>.json`.
#[derive(Clone, Debug)]
pub struct JsonPositionStore {
    path: PathBuf,
}

impl JsonPositionStore {
    pub fn for_book(dir: &Path, book_id: &str) -> Self {
        Self {
            path: dir.join(format!("{}.json", file_stem(book_id))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PositionStore for JsonPositionStore {
    fn load(&self) -> Option<SavedPosition> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = ?self.path, "bookmark read failed: {e}");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(position) => Some(position),
            Err(e) => {
                tracing::warn!(path = ?self.path, "bookmark ignored: {e}");
                None
            }
        }
    }

    fn save(&self, position: &SavedPosition) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(position).map_err(io::Error::other)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)
    }
}

/// Book ids come from a catalog; keep only characters safe in a file name.
fn file_stem(book_id: &str) -> String {
    book_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
