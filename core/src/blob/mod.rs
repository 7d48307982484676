//! Pluggable blob storage.
//!
//! Blobs are opaque byte streams addressed by a 24-hex-char name that is
//! deliberately not the content hash, so several entities can share one
//! byte stream without agreeing on a hash algorithm. The GridFS backend
//! de-duplicates by content hash behind a proof-of-content challenge;
//! object-store backends always store.

pub mod fallback;
pub mod gridfs;
pub mod localfs;
pub mod memory;
pub mod s3;
pub mod swift;

use std::io::SeekFrom;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWriteExt, ReadBuf};

use crate::error::StoreError;
use crate::hash::HashSink;

/// Smallest byte range a content challenge may cover.
pub const MIN_CHALLENGE_LEN: u64 = 32;

/// Default lifetime of a pending content challenge.
pub const DEFAULT_CHALLENGE_TTL: std::time::Duration = std::time::Duration::from_secs(15 * 60);

/// A proof-of-content challenge issued when a put names bytes the
/// backend already holds. The client must respond with the hash of the
/// indicated range before the backend records the new reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentChallenge {
    pub request_id: String,
    pub range_start: u64,
    pub range_length: u64,
}

/// A client's answer to a [`ContentChallenge`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeResponse {
    pub request_id: String,
    pub range_hash: String,
}

impl ChallengeResponse {
    /// Computes the proof for `challenge` from a local copy of the
    /// content. This is the client half of the dedup protocol.
    pub async fn compute<R>(reader: &mut R, challenge: &ContentChallenge) -> Result<Self, StoreError>
    where
        R: AsyncRead + AsyncSeek + Unpin + ?Sized,
    {
        reader
            .seek(SeekFrom::Start(challenge.range_start))
            .await?;
        let mut remaining = challenge.range_length;
        let mut sink = HashSink::new();
        let mut buf = vec![0u8; 64 * 1024];
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = reader.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(StoreError::bad_request(
                    "content shorter than challenged range",
                ));
            }
            std::io::Write::write_all(&mut sink, &buf[..n])?;
            remaining -= n as u64;
        }
        Ok(Self {
            request_id: challenge.request_id.clone(),
            range_hash: sink.hex_digest(),
        })
    }
}

/// Picks a random challenge range for a blob of `size` bytes: the range
/// stays inside the blob and is at least [`MIN_CHALLENGE_LEN`] long
/// whenever the blob allows it.
pub(crate) fn random_challenge_range(size: u64) -> (u64, u64) {
    if size <= MIN_CHALLENGE_LEN {
        return (0, size);
    }
    let mut rng = rand::thread_rng();
    let start = rng.gen_range(0..=size - MIN_CHALLENGE_LEN);
    let length = rng.gen_range(MIN_CHALLENGE_LEN..=size - start);
    (start, length)
}

/// Size entry returned by [`BlobBackend::stat_all`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobStat {
    pub name: String,
    pub size: u64,
}

/// Generates a fresh blob name: the hex form of 12 random bytes.
pub fn new_blob_name() -> String {
    let mut bytes = [0u8; 12];
    rand::thread_rng().fill(&mut bytes[..]);
    hex::encode(bytes)
}

/// A seekable handle onto blob bytes.
///
/// Backends that stream from a remote provider spool the response into
/// an anonymous temp file; the file is removed when the reader drops.
#[derive(Debug)]
pub struct BlobReader {
    inner: ReaderInner,
}

#[derive(Debug)]
enum ReaderInner {
    File {
        file: tokio::fs::File,
        _temp: Option<NamedTempFile>,
    },
    Memory(std::io::Cursor<Vec<u8>>),
}

impl BlobReader {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            inner: ReaderInner::Memory(std::io::Cursor::new(bytes)),
        }
    }

    pub fn from_file(file: tokio::fs::File) -> Self {
        Self {
            inner: ReaderInner::File { file, _temp: None },
        }
    }

    pub(crate) fn from_temp(file: tokio::fs::File, temp: NamedTempFile) -> Self {
        Self {
            inner: ReaderInner::File {
                file,
                _temp: Some(temp),
            },
        }
    }

    /// Reads the remaining bytes to the end of the handle.
    pub async fn read_to_end_vec(&mut self) -> std::io::Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.read_to_end(&mut bytes).await?;
        Ok(bytes)
    }
}

impl AsyncRead for BlobReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut self.get_mut().inner {
            ReaderInner::File { file, .. } => Pin::new(file).poll_read(cx, buf),
            ReaderInner::Memory(cursor) => Pin::new(cursor).poll_read(cx, buf),
        }
    }
}

impl AsyncSeek for BlobReader {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> std::io::Result<()> {
        match &mut self.get_mut().inner {
            ReaderInner::File { file, .. } => Pin::new(file).start_seek(position),
            ReaderInner::Memory(cursor) => Pin::new(cursor).start_seek(position),
        }
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<u64>> {
        match &mut self.get_mut().inner {
            ReaderInner::File { file, .. } => Pin::new(file).poll_complete(cx),
            ReaderInner::Memory(cursor) => Pin::new(cursor).poll_complete(cx),
        }
    }
}

/// An upload spooled to a temp file with its hash and size computed.
#[derive(Debug)]
pub(crate) struct Spool {
    temp: NamedTempFile,
    pub(crate) size: u64,
    pub(crate) hash: String,
}

impl Spool {
    /// Path of the backing temp file, for providers that upload from disk.
    pub(crate) fn path(&self) -> &std::path::Path {
        self.temp.path()
    }

    /// Independent read handle positioned at the start of the content.
    pub(crate) fn reopen(&self) -> std::io::Result<tokio::fs::File> {
        Ok(tokio::fs::File::from_std(self.temp.reopen()?))
    }

    /// Full content; only for backends whose transport wants a buffer.
    pub(crate) async fn read_all(&self) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(self.temp.path()).await
    }

    pub(crate) fn into_reader(self) -> std::io::Result<(BlobReader, u64)> {
        let file = self.reopen()?;
        let size = self.size;
        Ok((BlobReader::from_temp(file, self.temp), size))
    }
}

/// Streams `reader` into a temp file, teeing it through a [`HashSink`].
pub(crate) async fn spool_reader(
    reader: &mut (dyn AsyncRead + Send + Unpin),
) -> std::io::Result<Spool> {
    let temp = NamedTempFile::new()?;
    let mut file = tokio::fs::File::from_std(temp.reopen()?);
    let mut sink = HashSink::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        std::io::Write::write_all(&mut sink, &buf[..n])?;
        file.write_all(&buf[..n]).await?;
    }
    file.flush().await?;
    Ok(Spool {
        temp,
        size: sink.size(),
        hash: sink.hex_digest(),
    })
}

/// Spools `reader` and fails with `HashMismatch` unless the content
/// hashes to `expected`.
pub(crate) async fn spool_verified(
    reader: &mut (dyn AsyncRead + Send + Unpin),
    expected: &str,
) -> Result<Spool, StoreError> {
    let spool = spool_reader(reader).await?;
    if spool.hash != expected {
        return Err(StoreError::HashMismatch {
            expected: expected.to_owned(),
            actual: spool.hash,
        });
    }
    Ok(spool)
}

/// A single blob storage backend.
///
/// Implementations must be safe for concurrent use; every handle
/// returned by `open` owns whatever temp state backs it.
#[async_trait]
pub trait BlobBackend: Send + Sync {
    /// Streams `reader` into storage under `name`. The content must
    /// hash to `hash` or the put fails with `HashMismatch`. A backend
    /// that already holds bytes with this hash may instead return a
    /// challenge without consuming the reader; passing the matching
    /// `proof` on a second call records the reference without
    /// re-uploading.
    async fn put(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        name: &str,
        size: u64,
        hash: &str,
        proof: Option<&ChallengeResponse>,
    ) -> Result<Option<ContentChallenge>, StoreError>;

    /// Like `put` but never issues a challenge. Used by the ingest
    /// path, which has hashed the bytes itself.
    async fn put_unchallenged(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        name: &str,
        size: u64,
        hash: &str,
    ) -> Result<(), StoreError>;

    /// Opens the named blob, returning a seekable handle and its length.
    async fn open(&self, name: &str) -> Result<(BlobReader, u64), StoreError>;

    /// Removes the named blob reference. `NotFound` when absent.
    async fn remove(&self, name: &str) -> Result<(), StoreError>;

    /// Complete listing of stored blobs, for audit and GC scans.
    async fn stat_all(&self) -> Result<Vec<BlobStat>, StoreError>;
}

/// Façade over the configured backend.
#[derive(Clone)]
pub struct BlobStore {
    backend: Arc<dyn BlobBackend>,
}

impl BlobStore {
    pub fn new(backend: Arc<dyn BlobBackend>) -> Self {
        Self { backend }
    }

    pub async fn put(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        name: &str,
        size: u64,
        hash: &str,
        proof: Option<&ChallengeResponse>,
    ) -> Result<Option<ContentChallenge>, StoreError> {
        self.backend.put(reader, name, size, hash, proof).await
    }

    pub async fn put_unchallenged(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        name: &str,
        size: u64,
        hash: &str,
    ) -> Result<(), StoreError> {
        self.backend.put_unchallenged(reader, name, size, hash).await
    }

    pub async fn open(&self, name: &str) -> Result<(BlobReader, u64), StoreError> {
        self.backend.open(name).await
    }

    pub async fn remove(&self, name: &str) -> Result<(), StoreError> {
        self.backend.remove(name).await
    }

    pub async fn stat_all(&self) -> Result<Vec<BlobStat>, StoreError> {
        self.backend.stat_all().await
    }
}
