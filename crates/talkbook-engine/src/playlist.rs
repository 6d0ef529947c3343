//! Ordered fragments of one book and how their bytes are reached.

use std::fs::File;
use std::path::{Path, PathBuf};

use symphonia::core::io::MediaSource;
use symphonia::core::probe::Hint;
use talkbook_types::Resource;

use crate::config::PlayerConfig;
use crate::container::{PayloadKind, unwrap_payload};
use crate::context::PlayerContext;
use crate::error::{PlayerError, Result};
use crate::stream::{CachedPrefixTransport, RangeTransport, StreamSource};

/// One playable resource and how its payload is framed.
#[derive(Clone, Debug, PartialEq)]
pub struct PlaylistEntry {
    pub resource: Resource,
    pub kind: PayloadKind,
}

/// Supported resources of a book, in catalog order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PlayList {
    entries: Vec<PlaylistEntry>,
}

impl PlayList {
    /// Keep the resources whose extension names a supported payload kind.
    pub fn from_resources<I>(resources: I, config: &PlayerConfig) -> Self
    where
        I: IntoIterator<Item = Resource>,
    {
        let entries = resources
            .into_iter()
            .filter_map(|resource| match PayloadKind::for_resource(&resource, config) {
                Some(kind) => Some(PlaylistEntry { resource, kind }),
                None => {
                    tracing::debug!(
                        uri = %resource.remote_uri,
                        path = %resource.local_path,
                        mime = %resource.mime_type,
                        "skipping unsupported resource"
                    );
                    None
                }
            })
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&PlaylistEntry> {
        self.entries.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlaylistEntry> {
        self.entries.iter()
    }
}

/// What the local cache holds for one resource.
#[derive(Debug, PartialEq)]
enum CachedCopy {
    Complete(PathBuf),
    /// The first bytes of a payload of known size.
    Prefix(PathBuf),
    Missing,
}

/// Open the entry's bytes and unwrap its container. A complete cached copy is
/// read from disk; a partial one supplies its head while the rest streams.
pub fn open_payload(entry: &PlaylistEntry, ctx: &PlayerContext) -> Result<(Box<dyn MediaSource>, Hint)> {
    let resource = &entry.resource;
    let cached = cached_copy(resource, &ctx.config);
    let source: Box<dyn MediaSource> = match cached {
        CachedCopy::Complete(path) => {
            tracing::debug!(path = %path.display(), "playing from cache");
            let file = File::open(&path).map_err(|e| {
                PlayerError::TransientIo(format!("open {}: {e}", path.display()))
            })?;
            Box::new(file)
        }
        CachedCopy::Prefix(_) | CachedCopy::Missing if resource.remote_uri.is_empty() => {
            return Err(PlayerError::State(format!(
                "no cached copy and no remote location for {}",
                resource.local_path
            )));
        }
        CachedCopy::Prefix(path) => {
            tracing::debug!(path = %path.display(), "playing cached head, streaming the rest");
            let remote = ctx.transports.connect(resource, &ctx.config.stream)?;
            let transport: Box<dyn RangeTransport> =
                Box::new(CachedPrefixTransport::open(&path, resource.byte_size, remote)?);
            Box::new(StreamSource::open(resource, transport, ctx.config.stream.clone())?)
        }
        CachedCopy::Missing => {
            let transport = ctx.transports.connect(resource, &ctx.config.stream)?;
            Box::new(StreamSource::open(resource, transport, ctx.config.stream.clone())?)
        }
    };
    unwrap_payload(source, entry.kind, resource, &ctx.config)
}

fn cached_copy(resource: &Resource, config: &PlayerConfig) -> CachedCopy {
    if resource.local_path.is_empty() {
        return CachedCopy::Missing;
    }
    let local = Path::new(&resource.local_path);
    let path = match &config.cache_dir {
        Some(dir) if local.is_relative() => dir.join(local),
        _ => local.to_path_buf(),
    };
    let Ok(meta) = std::fs::metadata(&path) else {
        return CachedCopy::Missing;
    };
    let len = meta.len();
    if resource.byte_size == 0 {
        return if len > 0 {
            CachedCopy::Complete(path)
        } else {
            CachedCopy::Missing
        };
    }
    if len >= resource.byte_size {
        return CachedCopy::Complete(path);
    }
    tracing::debug!(
        path = %path.display(),
        len,
        expected = resource.byte_size,
        "cached copy incomplete"
    );
    if len > 0 {
        CachedCopy::Prefix(path)
    } else {
        CachedCopy::Missing
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::sync::Arc;

    use super::*;
    use crate::test_support::{MemoryTransports, test_config};

    fn res(local: &str, remote: &str, size: u64) -> Resource {
        Resource {
            remote_uri: remote.to_string(),
            local_path: local.to_string(),
            byte_size: size,
            mime_type: "application/octet-stream".to_string(),
        }
    }

    #[test]
    fn filters_by_extension_not_mime() {
        let config = PlayerConfig::default();
        let resources = vec![
            res("a/01.mp3", "", 1),
            res("a/cover.jpg", "", 1),
            res("", "https://cdn/a/02.LKF", 1),
            res("a/notes.txt", "", 1),
        ];
        let list = PlayList::from_resources(resources, &config);

        assert_eq!(list.len(), 2);
        assert_eq!(list.get(0).unwrap().kind, PayloadKind::Plain);
        assert_eq!(list.get(1).unwrap().kind, PayloadKind::Encrypted);
        assert!(list.get(2).is_none());
    }

    #[test]
    fn complete_cache_copy_is_preferred() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("01.wav"), b"local bytes").unwrap();
        let mut config = test_config();
        config.cache_dir = Some(dir.path().to_path_buf());
        let transports = Arc::new(MemoryTransports::default());
        transports.insert("https://cdn/01.wav", b"remote bytes".to_vec());
        let ctx = PlayerContext::new(config.clone()).with_transports(transports);

        let list = PlayList::from_resources(vec![res("01.wav", "https://cdn/01.wav", 11)], &config);
        let (mut source, _) = open_payload(list.get(0).unwrap(), &ctx).unwrap();
        let mut bytes = Vec::new();
        source.read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes, b"local bytes");
    }

    #[test]
    fn partial_cache_copy_supplies_the_head() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("01.wav"), b"cached").unwrap();
        let mut config = test_config();
        config.cache_dir = Some(dir.path().to_path_buf());
        let transports = Arc::new(MemoryTransports::default());
        transports.insert("https://cdn/01.wav", b"remote bytes".to_vec());
        let ctx = PlayerContext::new(config.clone()).with_transports(transports);

        let list = PlayList::from_resources(vec![res("01.wav", "https://cdn/01.wav", 12)], &config);
        let (mut source, _) = open_payload(list.get(0).unwrap(), &ctx).unwrap();
        let mut bytes = Vec::new();
        source.read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes, b"cached bytes");
    }

    #[test]
    fn partial_cache_copy_without_remote_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("01.wav"), b"cached").unwrap();
        let mut config = test_config();
        config.cache_dir = Some(dir.path().to_path_buf());
        let ctx = PlayerContext::new(config.clone());

        let list = PlayList::from_resources(vec![res("01.wav", "", 12)], &config);
        let err = open_payload(list.get(0).unwrap(), &ctx).err().unwrap();
        assert!(matches!(err, PlayerError::State(_)), "{err:?}");
    }

    #[test]
    fn cache_lookup_classifies_copies() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("full.wav"), b"0123456789").unwrap();
        std::fs::write(dir.path().join("empty.wav"), b"").unwrap();
        let mut config = test_config();
        config.cache_dir = Some(dir.path().to_path_buf());

        let full = dir.path().join("full.wav");
        assert_eq!(cached_copy(&res("full.wav", "", 10), &config), CachedCopy::Complete(full.clone()));
        assert_eq!(cached_copy(&res("full.wav", "", 0), &config), CachedCopy::Complete(full.clone()));
        assert_eq!(cached_copy(&res("full.wav", "", 20), &config), CachedCopy::Prefix(full));
        assert_eq!(cached_copy(&res("empty.wav", "", 20), &config), CachedCopy::Missing);
        assert_eq!(cached_copy(&res("absent.wav", "", 20), &config), CachedCopy::Missing);
        assert_eq!(cached_copy(&res("", "", 20), &config), CachedCopy::Missing);
    }

    #[test]
    fn unreachable_resource_fails() {
        let config = test_config();
        let ctx = PlayerContext::new(config.clone())
            .with_transports(Arc::new(MemoryTransports::default()));
        let list = PlayList::from_resources(vec![res("missing.wav", "https://cdn/x.wav", 10)], &config);

        let err = open_payload(list.get(0).unwrap(), &ctx).err().unwrap();
        assert!(matches!(err, PlayerError::Protocol(_)), "{err:?}");
    }

    #[test]
    fn encrypted_without_key_is_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("01.lkf"), vec![0u8; 1024]).unwrap();
        let mut config = test_config();
        config.cache_dir = Some(dir.path().to_path_buf());
        let ctx = PlayerContext::new(config.clone());

        let list = PlayList::from_resources(vec![res("01.lkf", "", 1024)], &config);
        let err = open_payload(list.get(0).unwrap(), &ctx).err().unwrap();
        assert!(matches!(err, PlayerError::Format(_)), "{err:?}");
    }
}
