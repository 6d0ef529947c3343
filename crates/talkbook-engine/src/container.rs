//! Payload classification and the block-cipher container.
//!
//! Encrypted payloads store every full 512-byte block XXTEA-enciphered as 128
//! little-endian words; a trailing partial block is left in clear.

use std::io::{self, Read, Seek, SeekFrom};

use symphonia::core::io::MediaSource;
use symphonia::core::probe::Hint;
use talkbook_types::Resource;

use crate::config::PlayerConfig;
use crate::error::{PlayerError, Result};

pub const BLOCK_SIZE: usize = 512;
const BLOCK_WORDS: usize = BLOCK_SIZE / 4;
const DELTA: u32 = 0x9e37_79b9;

/// How a fragment's bytes must be interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadKind {
    /// Compressed audio the decoder reads directly.
    Plain,
    /// Compressed audio wrapped in the block cipher.
    Encrypted,
}

impl PayloadKind {
    /// Classify by file extension. Declared MIME types are ignored.
    pub fn for_resource(resource: &Resource, config: &PlayerConfig) -> Option<Self> {
        let ext = resource.extension()?;
        let matches = |list: &[String]| list.iter().any(|e| e.eq_ignore_ascii_case(&ext));
        if matches(&config.plain_extensions) {
            Some(Self::Plain)
        } else if matches(&config.encrypted_extensions) {
            Some(Self::Encrypted)
        } else {
            None
        }
    }
}

/// Wrap raw payload bytes so the decoder sees plain compressed audio.
pub fn unwrap_payload(
    source: Box<dyn MediaSource>,
    kind: PayloadKind,
    resource: &Resource,
    config: &PlayerConfig,
) -> Result<(Box<dyn MediaSource>, Hint)> {
    let mut hint = Hint::new();
    match kind {
        PayloadKind::Plain => {
            if let Some(ext) = resource.extension() {
                hint.with_extension(&ext);
            }
            Ok((source, hint))
        }
        PayloadKind::Encrypted => {
            let key = config.container_key.ok_or_else(|| {
                PlayerError::Format("encrypted payload but no container key configured".to_string())
            })?;
            hint.with_extension("mp3");
            let reader = CipherReader::new(source, key)?;
            Ok((Box::new(reader), hint))
        }
    }
}

/// Seekable reader that deciphers one block at a time.
pub struct CipherReader<R> {
    inner: R,
    key: [u32; 4],
    len: u64,
    pos: u64,
    block: Vec<u8>,
    block_index: Option<u64>,
}

impl<R: Read + Seek> CipherReader<R> {
    pub fn new(mut inner: R, key: [u32; 4]) -> Result<Self> {
        let len = inner
            .seek(SeekFrom::End(0))
            .and_then(|len| inner.seek(SeekFrom::Start(0)).map(|_| len))
            .map_err(|e| PlayerError::from_io(&e))?;
        Ok(Self {
            inner,
            key,
            len,
            pos: 0,
            block: Vec::with_capacity(BLOCK_SIZE),
            block_index: None,
        })
    }

    fn load_block(&mut self, index: u64) -> io::Result<()> {
        if self.block_index == Some(index) {
            return Ok(());
        }
        self.block_index = None;
        self.block.clear();
        self.inner.seek(SeekFrom::Start(index * BLOCK_SIZE as u64))?;
        (&mut self.inner)
            .take(BLOCK_SIZE as u64)
            .read_to_end(&mut self.block)?;
        if self.block.len() == BLOCK_SIZE {
            let mut words = [0u32; BLOCK_WORDS];
            for (word, bytes) in words.iter_mut().zip(self.block.chunks_exact(4)) {
                *word = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            }
            xxtea_decrypt(&mut words, &self.key);
            for (bytes, word) in self.block.chunks_exact_mut(4).zip(words) {
                bytes.copy_from_slice(&word.to_le_bytes());
            }
        }
        self.block_index = Some(index);
        Ok(())
    }
}

impl<R: Read + Seek> Read for CipherReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() || self.pos >= self.len {
            return Ok(0);
        }
        let index = self.pos / BLOCK_SIZE as u64;
        self.load_block(index)?;
        let offset = (self.pos % BLOCK_SIZE as u64) as usize;
        if offset >= self.block.len() {
            return Ok(0);
        }
        let n = (self.block.len() - offset).min(out.len());
        out[..n].copy_from_slice(&self.block[offset..offset + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek> Seek for CipherReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(x) => x as i128,
            SeekFrom::Current(d) => self.pos as i128 + d as i128,
            SeekFrom::End(d) => self.len as i128 + d as i128,
        };
        if target < 0 {
            return Err(PlayerError::State(format!("seek to negative offset {target}")).into());
        }
        self.pos = u64::try_from(target).unwrap_or(u64::MAX).min(self.len);
        Ok(self.pos)
    }
}

impl<R: Read + Seek + Send + Sync> MediaSource for CipherReader<R> {
    fn is_seekable(&self) -> bool {
        true
    }

    fn byte_len(&self) -> Option<u64> {
        Some(self.len)
    }
}

fn mx(sum: u32, y: u32, z: u32, p: usize, e: usize, key: &[u32; 4]) -> u32 {
    (((z >> 5) ^ (y << 2)).wrapping_add((y >> 3) ^ (z << 4)))
        ^ ((sum ^ y).wrapping_add(key[(p & 3) ^ e] ^ z))
}

fn xxtea_decrypt(v: &mut [u32], key: &[u32; 4]) {
    let n = v.len();
    if n < 2 {
        return;
    }
    let rounds = 6 + 52 / n as u32;
    let mut sum = rounds.wrapping_mul(DELTA);
    let mut y = v[0];
    for _ in 0..rounds {
        let e = ((sum >> 2) & 3) as usize;
        for p in (1..n).rev() {
            let z = v[p - 1];
            v[p] = v[p].wrapping_sub(mx(sum, y, z, p, e, key));
            y = v[p];
        }
        let z = v[n - 1];
        v[0] = v[0].wrapping_sub(mx(sum, y, z, 0, e, key));
        y = v[0];
        sum = sum.wrapping_sub(DELTA);
    }
}

#[cfg(test)]
fn xxtea_encrypt(v: &mut [u32], key: &[u32; 4]) {
    let n = v.len();
    if n < 2 {
        return;
    }
    let rounds = 6 + 52 / n as u32;
    let mut sum = 0u32;
    let mut z = v[n - 1];
    for _ in 0..rounds {
        sum = sum.wrapping_add(DELTA);
        let e = ((sum >> 2) & 3) as usize;
        for p in 0..n - 1 {
            let y = v[p + 1];
            v[p] = v[p].wrapping_add(mx(sum, y, z, p, e, key));
            z = v[p];
        }
        let y = v[0];
        v[n - 1] = v[n - 1].wrapping_add(mx(sum, y, z, n - 1, e, key));
        z = v[n - 1];
    }
}

/// Build an encrypted payload from plain bytes.
#[cfg(test)]
pub(crate) fn encrypt_payload(plain: &[u8], key: &[u32; 4]) -> Vec<u8> {
    let mut out = Vec::with_capacity(plain.len());
    for block in plain.chunks(BLOCK_SIZE) {
        if block.len() < BLOCK_SIZE {
            out.extend_from_slice(block);
            continue;
        }
        let mut words = [0u32; BLOCK_WORDS];
        for (word, bytes) in words.iter_mut().zip(block.chunks_exact(4)) {
            *word = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        }
        xxtea_encrypt(&mut words, key);
        for word in words {
            out.extend_from_slice(&word.to_le_bytes());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const KEY: [u32; 4] = [0x0123_4567, 0x89ab_cdef, 0xfedc_ba98, 0x7654_3210];

    fn plain(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i * 7 % 256) as u8).collect()
    }

    #[test]
    fn full_blocks_are_enciphered_and_tail_is_clear() {
        let data = plain(BLOCK_SIZE * 2 + 100);
        let enc = encrypt_payload(&data, &KEY);
        assert_eq!(enc.len(), data.len());
        assert_ne!(&enc[..BLOCK_SIZE], &data[..BLOCK_SIZE]);
        assert_eq!(&enc[BLOCK_SIZE * 2..], &data[BLOCK_SIZE * 2..]);
    }

    #[test]
    fn reader_recovers_plain_bytes() {
        let data = plain(BLOCK_SIZE * 3 + 17);
        let enc = encrypt_payload(&data, &KEY);
        let mut reader = CipherReader::new(Cursor::new(enc), KEY).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn reader_seeks_across_blocks() {
        let data = plain(BLOCK_SIZE * 4);
        let enc = encrypt_payload(&data, &KEY);
        let mut reader = CipherReader::new(Cursor::new(enc), KEY).unwrap();

        reader.seek(SeekFrom::Start(1500)).unwrap();
        let mut buf = [0u8; 100];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[..], &data[1500..1600]);

        reader.seek(SeekFrom::Current(-1000)).unwrap();
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[..], &data[600..700]);
        assert!(reader.seek(SeekFrom::Current(-10_000)).is_err());
    }

    #[test]
    fn classifies_by_extension_not_mime() {
        let cfg = PlayerConfig::default();
        let res = |path: &str, mime: &str| Resource {
            remote_uri: format!("https://cdn.example/{path}?sig=1"),
            mime_type: mime.to_string(),
            ..Resource::default()
        };
        assert_eq!(
            PayloadKind::for_resource(&res("a/01.MP3", "application/octet-stream"), &cfg),
            Some(PayloadKind::Plain)
        );
        assert_eq!(
            PayloadKind::for_resource(&res("a/01.lkf", "audio/mpeg"), &cfg),
            Some(PayloadKind::Encrypted)
        );
        assert_eq!(PayloadKind::for_resource(&res("a/cover.jpg", "audio/mpeg"), &cfg), None);
    }

    #[test]
    fn encrypted_payload_without_key_is_format_error() {
        let cfg = PlayerConfig::default();
        let source: Box<dyn MediaSource> = Box::new(Cursor::new(vec![0u8; 16]));
        let err = unwrap_payload(source, PayloadKind::Encrypted, &Resource::default(), &cfg)
            .err()
            .unwrap();
        assert!(matches!(err, PlayerError::Format(_)));
    }
}
