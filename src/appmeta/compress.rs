use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{Read, Write};

/// Leading bytes of every gzip stream
pub const GZIP_MAGIC: [u8; 3] = [0x1f, 0x8b, 0x08];

#[must_use]
pub fn is_gzip(data: &[u8]) -> bool {
    data.starts_with(&GZIP_MAGIC)
}

/// Gzip `input`. The output is deterministic for a given input.
///
/// # Errors
///
/// Will return `Err` if the encoder fails to write
pub fn compress(input: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(input)?;
    encoder.finish()
}

/// Inflate `input` when it carries the gzip magic header, otherwise return it as is.
///
/// # Errors
///
/// Will return `Err` if the data looks like gzip but is corrupt
pub fn decompress_if_gzip(input: &[u8]) -> std::io::Result<Vec<u8>> {
    if !is_gzip(input) {
        return Ok(input.to_vec());
    }
    let mut out = Vec::new();
    GzDecoder::new(input).read_to_end(&mut out)?;
    Ok(out)
}
