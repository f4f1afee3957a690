//! Track decryption for the legacy Spotify download scheme.
//!
//! Encrypted streams are OGG/Vorbis files run through AES-128 in counter
//! mode:
//! * a per-track 16-byte key, delivered hex-encoded on the track
//! * a fixed IV that seeds a big-endian 128-bit counter
//! * no padding, so ciphertext and plaintext have equal length
//!
//! Counter mode is its own inverse, so the same operation encrypts and
//! decrypts.
//!
//! # Memory Management
//!
//! Files are processed in 8 KiB chunks. All chunks go through a single
//! cipher state in file order; the keystream position advances with every
//! byte, so chunks must never be reordered or processed concurrently.
//!
//! # Examples
//!
//! ```rust
//! use tgmusic::decrypt::{Decrypt, Key};
//!
//! let key: Key = track.key.as_deref().unwrap_or_default().parse()?;
//! Decrypt::decrypt_file(&key, "abc.encrypted.ogg", "abc.decrypted.ogg").await?;
//! ```

use std::{ops::Deref, path::Path, str::FromStr};

use aes::{
    cipher::{KeyIvInit, StreamCipher},
    Aes128,
};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncWriteExt, BufWriter},
};
use veil::Redact;

use crate::error::{Error, Result};

/// AES-128 keystream generator with a big-endian 128-bit counter.
type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// Length of decryption keys in bytes.
pub const KEY_LENGTH: usize = 16;

/// Raw key bytes.
pub type RawKey = [u8; KEY_LENGTH];

/// Validated decryption key.
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash, Redact)]
#[redact(all)]
pub struct Key(RawKey);

impl FromStr for Key {
    type Err = Error;

    /// Parses a hex-encoded key.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` if the string is not hexadecimal,
    /// and `Error::OutOfRange` if it does not decode to exactly 16 bytes.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use tgmusic::decrypt::Key;
    ///
    /// let key: Key = "000102030405060708090a0b0c0d0e0f".parse()?;
    ///
    /// // Too short
    /// assert!("0001".parse::<Key>().is_err());
    /// ```
    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())?;

        let key = RawKey::try_from(bytes.as_slice()).map_err(|_| {
            Error::out_of_range(format!(
                "key length is {} but should be {KEY_LENGTH}",
                bytes.len()
            ))
        })?;

        Ok(Self(key))
    }
}

impl Deref for Key {
    type Target = RawKey;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Streaming AES-CTR decryptor.
///
/// Holds the counter state for one stream. Feed it the stream's bytes in
/// order; chunk boundaries do not matter.
pub struct Decrypt {
    cipher: Aes128Ctr,
}

impl Decrypt {
    /// Fixed IV of the legacy scheme, `72e067fbddcbcf77ebe8bc643f630d93`.
    const IV: [u8; 16] = [
        0x72, 0xe0, 0x67, 0xfb, 0xdd, 0xcb, 0xcf, 0x77, 0xeb, 0xe8, 0xbc, 0x64, 0x3f, 0x63, 0x0d,
        0x93,
    ];

    /// Size of each chunk read from disk (8 KiB).
    pub const CHUNK_SIZE: usize = 8 * 1024;

    /// Creates a decryptor positioned at the start of the stream.
    #[must_use]
    pub fn new(key: &Key) -> Self {
        Self {
            cipher: Aes128Ctr::new(&(**key).into(), &Self::IV.into()),
        }
    }

    /// Decrypts `chunk` in place and advances the counter past it.
    pub fn apply(&mut self, chunk: &mut [u8]) {
        self.cipher.apply_keystream(chunk);
    }

    /// Decrypts `source` into `destination`, 8 KiB at a time.
    ///
    /// `destination` is created or truncated.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if `source` does not exist, and propagates
    /// any other I/O error. A partially written `destination` is left for
    /// the caller to clean up.
    pub async fn decrypt_file(
        key: &Key,
        source: impl AsRef<Path>,
        destination: impl AsRef<Path>,
    ) -> Result<()> {
        let source = source.as_ref();
        let destination = destination.as_ref();

        let mut input = match File::open(source).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                error!("{} not found", source.display());
                return Err(Error::not_found(format!(
                    "encrypted file {} not found",
                    source.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        let mut output = BufWriter::new(File::create(destination).await?);

        let mut decryptor = Self::new(key);
        let mut buffer = vec![0; Self::CHUNK_SIZE];
        let mut total = 0;

        loop {
            let length = input.read(&mut buffer).await?;
            if length == 0 {
                break;
            }

            let chunk = &mut buffer[..length];
            decryptor.apply(chunk);
            output.write_all(chunk).await?;
            total += length;
        }

        output.flush().await?;
        trace!(
            "decrypted {total} bytes from {} into {}",
            source.display(),
            destination.display()
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "000102030405060708090a0b0c0d0e0f";

    fn plaintext(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn iv_matches_scheme() {
        assert_eq!(
            Decrypt::IV.to_vec(),
            hex::decode("72e067fbddcbcf77ebe8bc643f630d93").unwrap()
        );
    }

    #[test]
    fn key_parsing() {
        let key: Key = KEY.parse().unwrap();
        assert_eq!(key[15], 0x0f);

        assert_eq!(
            "0001".parse::<Key>().unwrap_err().kind,
            crate::error::ErrorKind::OutOfRange
        );
        assert_eq!(
            "not hex at all, not hex at all!!".parse::<Key>().unwrap_err().kind,
            crate::error::ErrorKind::InvalidArgument
        );
        assert!(!format!("{key:?}").contains("14, 15"));
    }

    #[test]
    fn chunking_does_not_change_output() {
        let key: Key = KEY.parse().unwrap();
        let original = plaintext(3 * Decrypt::CHUNK_SIZE + 17);

        let mut whole = original.clone();
        Decrypt::new(&key).apply(&mut whole);

        let mut chunked = original.clone();
        let mut decryptor = Decrypt::new(&key);
        for chunk in chunked.chunks_mut(1000) {
            decryptor.apply(chunk);
        }

        assert_eq!(whole, chunked);
        assert_ne!(whole, original);
    }

    #[tokio::test]
    async fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let key: Key = KEY.parse().unwrap();

        for len in [0, 1, 8191, 8192, 8193, 1_000_000] {
            let original = plaintext(len);

            let mut encrypted = original.clone();
            Decrypt::new(&key).apply(&mut encrypted);

            let source = dir.path().join(format!("{len}.encrypted.ogg"));
            let destination = dir.path().join(format!("{len}.decrypted.ogg"));
            tokio::fs::write(&source, &encrypted).await.unwrap();

            Decrypt::decrypt_file(&key, &source, &destination).await.unwrap();

            let decrypted = tokio::fs::read(&destination).await.unwrap();
            assert_eq!(decrypted, original, "round trip failed for length {len}");
        }
    }

    #[tokio::test]
    async fn missing_source_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let key: Key = KEY.parse().unwrap();

        let err = Decrypt::decrypt_file(
            &key,
            dir.path().join("missing.encrypted.ogg"),
            dir.path().join("missing.decrypted.ogg"),
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind, crate::error::ErrorKind::NotFound);
        assert!(!dir.path().join("missing.decrypted.ogg").exists());
    }
}
