use sha2::{Digest, Sha256, Sha384};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Streaming SHA-384 sink.
///
/// All canonical blob hashes in the store are SHA-384, exchanged as
/// lowercase hexadecimal. The sink is used to hash uploads while they are
/// spooled to disk and to hash byte ranges when answering proof-of-content
/// challenges.
pub struct HashSink {
    hasher: Sha384,
    size: u64,
}

impl HashSink {
    pub fn new() -> Self {
        Self {
            hasher: Sha384::new(),
            size: 0,
        }
    }

    /// Number of bytes written so far.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Consumes the sink, returning the lowercase hex digest.
    pub fn hex_digest(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl Default for HashSink {
    fn default() -> Self {
        Self::new()
    }
}

impl std::io::Write for HashSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.hasher.update(buf);
        self.size += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Hex SHA-384 of a byte slice.
pub fn sha384_hex(bytes: &[u8]) -> String {
    hex::encode(Sha384::digest(bytes))
}

/// Hex SHA-256 of a byte slice, used for the lazily filled legacy digest.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Hashes an async reader to completion, returning the hex SHA-256 digest.
pub async fn sha256_hex_of_reader<R>(reader: &mut R) -> std::io::Result<String>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
