//! Header repair for decrypted legacy Spotify streams.
//!
//! The upstream packaging scheme corrupts the first two OGG page headers
//! and the Vorbis identification header of every file in the same way.
//! Writing a fixed set of bytes at fixed offsets restores a stream that
//! demuxers accept. Nothing here is derived from file content, so this is
//! not a general OGG repair tool.
//!
//! # Patched Layout
//!
//! ```text
//! offset  bytes                       meaning
//!      0  "OggS"                      first page capture pattern
//!      6  00 x 10                     granule position, serial number (part)
//!     26  01 1e 01 "vorbis"           one segment of 30 bytes, identification header
//!     39  02                          stereo
//!     40  44 ac 00 00                 44100 Hz
//!     48  00 e2 04 00                 320000 bps nominal bitrate
//!     56  b8 01                       block sizes, framing flag
//!     58  "OggS"                      second page capture pattern
//!     62  00 x 10                     second page header fields
//! ```

use std::{io::SeekFrom, path::Path};

use tokio::{
    fs::OpenOptions,
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};

use crate::error::Result;

/// Page capture pattern.
const CAPTURE_PATTERN: &[u8] = b"OggS";

const ZEROES: &[u8] = &[0; 10];

/// Segment count, segment length and Vorbis identification packet magic.
const VORBIS_IDENTIFICATION: &[u8] = b"\x01\x1e\x01vorbis";

const CHANNELS: &[u8] = &[2];

const SAMPLE_RATE: [u8; 4] = 44_100_u32.to_le_bytes();

const NOMINAL_BITRATE: [u8; 4] = 320_000_u32.to_le_bytes();

const BLOCK_SIZES: &[u8] = b"\xb8\x01";

/// Offset and contents of every write, in the order they are applied.
pub const PATCHES: [(usize, &[u8]); 9] = [
    (0, CAPTURE_PATTERN),
    (6, ZEROES),
    (26, VORBIS_IDENTIFICATION),
    (39, CHANNELS),
    (40, &SAMPLE_RATE),
    (48, &NOMINAL_BITRATE),
    (56, BLOCK_SIZES),
    (58, CAPTURE_PATTERN),
    (62, ZEROES),
];

/// Number of leading bytes covered by [`PATCHES`].
pub const HEADER_LEN: usize = 72;

/// Applies [`PATCHES`] to the first [`HEADER_LEN`] bytes of a file.
pub fn repair_header(header: &mut [u8; HEADER_LEN]) {
    for (offset, bytes) in PATCHES {
        header[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

/// Repairs the headers of the file at `path` in place.
///
/// Files shorter than [`HEADER_LEN`] are extended with zeroes up to the last
/// patched byte. A missing file is logged and otherwise ignored, as are I/O
/// errors while patching: the transcoder validates the result.
pub async fn repair_file(path: impl AsRef<Path>) {
    let path = path.as_ref();

    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        error!("{} not found", path.display());
        return;
    }

    if let Err(e) = patch_in_place(path).await {
        error!("error rebuilding ogg file {}: {e}", path.display());
    }
}

async fn patch_in_place(path: &Path) -> Result<()> {
    let mut file = OpenOptions::new().read(true).write(true).open(path).await?;

    let mut header = [0; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let length = file.read(&mut header[filled..]).await?;
        if length == 0 {
            break;
        }
        filled += length;
    }

    repair_header(&mut header);

    file.seek(SeekFrom::Start(0)).await?;
    file.write_all(&header).await?;
    file.flush().await?;

    trace!("patched ogg headers of {}", path.display());
    Ok(())
}
