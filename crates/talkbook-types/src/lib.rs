use serde::{Deserialize, Serialize};

/// Descriptor of one fragment of a book, as produced by the catalog.
///
/// `mime_type` is informational only: some sources report it incorrectly, so the
/// payload kind is always derived from the file extension.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resource {
    /// Remote location used for range requests.
    pub remote_uri: String,
    /// Location of the cached copy, relative to the cache directory or absolute.
    pub local_path: String,
    /// Declared size of the payload in bytes.
    pub byte_size: u64,
    /// Declared content type.
    #[serde(default)]
    pub mime_type: String,
}

impl Resource {
    /// Lowercased file extension, taken from the local path or the remote URI.
    pub fn extension(&self) -> Option<String> {
        ext_of(&self.local_path).or_else(|| ext_of(&self.remote_uri))
    }
}

fn ext_of(path: &str) -> Option<String> {
    let tail = path.split(['?', '#']).next().unwrap_or(path);
    let file = tail.rsplit(['/', '\\']).next().unwrap_or(tail);
    let mut parts = file.rsplit('.');
    let ext = parts.next()?;
    if parts.next().is_some() && !ext.is_empty() {
        Some(ext.to_ascii_lowercase())
    } else {
        None
    }
}

/// Position persisted between listening sessions.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SavedPosition {
    /// Index into the book's playlist.
    pub fragment_index: usize,
    /// Offset inside that fragment in milliseconds.
    pub elapsed_ms: u64,
    /// Playback speed multiplier.
    pub speed: f32,
}

impl Default for SavedPosition {
    fn default() -> Self {
        Self {
            fragment_index: 0,
            elapsed_ms: 0,
            speed: 1.0,
        }
    }
}

/// Reason why a fragment stopped producing audio.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FragmentEndReason {
    /// Decoder reached the end of the fragment.
    Eof,
    /// Fetch, decode or output failure; the player skipped ahead.
    Error,
    /// Playback was explicitly stopped.
    Stopped,
}

/// Playback status pushed to the host UI.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PlaybackStatus {
    /// `true` while a listening session is active.
    pub playing: bool,
    /// `true` when the active session is paused.
    pub paused: bool,
    /// Index of the current fragment.
    pub fragment_index: usize,
    /// Number of fragments in the book.
    pub fragment_count: usize,
    /// Elapsed time inside the current fragment in milliseconds.
    pub elapsed_ms: Option<u64>,
    /// Estimated fragment duration in milliseconds.
    pub duration_ms: Option<u64>,
    /// Current speed multiplier.
    pub speed: f32,
    /// Active output device, `None` for the host default.
    pub device: Option<String>,
    /// Why the previous fragment ended, if it did.
    pub end_reason: Option<FragmentEndReason>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_prefers_local_path() {
        let res = Resource {
            remote_uri: "https://example/book/01.lkf?token=1".to_string(),
            local_path: "book/01.MP3".to_string(),
            byte_size: 10,
            mime_type: "audio/mpeg".to_string(),
        };
        assert_eq!(res.extension(), Some("mp3".to_string()));
    }

    #[test]
    fn extension_falls_back_to_remote_uri() {
        let res = Resource {
            remote_uri: "https://example/book/01.lkf?token=1".to_string(),
            ..Resource::default()
        };
        assert_eq!(res.extension(), Some("lkf".to_string()));
    }

    #[test]
    fn extension_missing_returns_none() {
        let res = Resource {
            remote_uri: "https://example/stream".to_string(),
            local_path: "noext".to_string(),
            ..Resource::default()
        };
        assert_eq!(res.extension(), None);
    }

    #[test]
    fn resource_mime_type_is_optional_in_json() {
        let res: Resource = serde_json::from_str(
            r#"{"remote_uri":"http://h/a.mp3","local_path":"a.mp3","byte_size":3}"#,
        )
        .unwrap();
        assert_eq!(res.byte_size, 3);
        assert!(res.mime_type.is_empty());
    }

    #[test]
    fn end_reason_serializes_snake_case() {
        let json = serde_json::to_string(&FragmentEndReason::Eof).unwrap();
        assert_eq!(json, "\"eof\"");
    }
}
