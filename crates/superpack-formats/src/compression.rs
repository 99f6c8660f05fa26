//! Compression codecs used inside a superpack
//!
//! Files, the names block and the metadata block are stored with one of four
//! codecs. LZ4 and LZ4HC both produce raw LZ4 *block* data (no frame, no size
//! prefix); LZ4HC only differs in how hard the encoder searches, so a single
//! block decoder reads both. Deflate is raw deflate without a zlib header.
//!
//! Decompression follows a strict contract: the caller allocates the output
//! buffer at the declared original size and the decoder must fill it exactly.
//! Decoders never grow their output, which bounds memory use by the value
//! recorded in the file table.

use crate::error::{FormatError, FormatResult};
use binrw::{BinRead, BinResult, BinWrite, Endian};
use flate2::Compression;
use flate2::read::{DeflateDecoder, DeflateEncoder};
use std::io::{Read, Seek, Write};

/// Codec identifier stored as a `u32` in file table entries and dvpl trailers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum CompressionType {
    /// Stored as is
    #[default]
    None = 0,
    /// LZ4 block, fast encoder
    Lz4 = 1,
    /// LZ4 block, high compression encoder
    Lz4Hc = 2,
    /// Raw deflate stream
    Deflate = 3,
}

impl CompressionType {
    /// Wire value of this codec
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    /// Human readable codec name
    pub const fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Lz4 => "lz4",
            Self::Lz4Hc => "lz4hc",
            Self::Deflate => "deflate",
        }
    }
}

impl TryFrom<u32> for CompressionType {
    type Error = FormatError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Lz4),
            2 => Ok(Self::Lz4Hc),
            3 => Ok(Self::Deflate),
            other => Err(FormatError::UnsupportedCompression(other)),
        }
    }
}

impl std::fmt::Display for CompressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for CompressionType {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "lz4" => Ok(Self::Lz4),
            "lz4hc" => Ok(Self::Lz4Hc),
            "deflate" => Ok(Self::Deflate),
            other => Err(FormatError::Compression(format!(
                "unknown compression name '{other}'"
            ))),
        }
    }
}

impl BinRead for CompressionType {
    type Args<'a> = ();

    fn read_options<R: Read + Seek>(
        reader: &mut R,
        endian: Endian,
        _args: Self::Args<'_>,
    ) -> BinResult<Self> {
        let pos = reader.stream_position()?;
        let raw = u32::read_options(reader, endian, ())?;
        Self::try_from(raw).map_err(|err| binrw::Error::Custom {
            pos,
            err: Box::new(err),
        })
    }
}

impl BinWrite for CompressionType {
    type Args<'a> = ();

    fn write_options<W: Write + Seek>(
        &self,
        writer: &mut W,
        endian: Endian,
        _args: Self::Args<'_>,
    ) -> BinResult<()> {
        self.as_u32().write_options(writer, endian, ())
    }
}

/// Compress a buffer with the given codec
pub fn compress(compression: CompressionType, input: &[u8]) -> FormatResult<Vec<u8>> {
    match compression {
        CompressionType::None => Ok(input.to_vec()),
        // lz4_flex has a single block encoder; its output is a valid LZ4 block
        // for either flavour and decodes with the same block decoder.
        CompressionType::Lz4 | CompressionType::Lz4Hc => Ok(lz4_flex::block::compress(input)),
        CompressionType::Deflate => {
            let mut encoder = DeflateEncoder::new(input, Compression::best());
            let mut compressed = Vec::new();
            encoder.read_to_end(&mut compressed).map_err(|e| {
                FormatError::Compression(format!("deflate compression failed: {e}"))
            })?;
            Ok(compressed)
        }
    }
}

/// Decompress `input` into the pre-sized `output` buffer
///
/// `output.len()` must equal the original size recorded for the data. The
/// call fails if the stream decodes to fewer or more bytes.
pub fn decompress(
    compression: CompressionType,
    input: &[u8],
    output: &mut [u8],
) -> FormatResult<()> {
    match compression {
        CompressionType::None => {
            if input.len() != output.len() {
                return Err(FormatError::Compression(format!(
                    "stored data is {} bytes, expected {}",
                    input.len(),
                    output.len()
                )));
            }
            output.copy_from_slice(input);
            Ok(())
        }
        CompressionType::Lz4 | CompressionType::Lz4Hc => {
            if output.is_empty() {
                if input.is_empty() {
                    return Ok(());
                }
                let decoded = lz4_flex::block::decompress(input, 0).map_err(|e| {
                    FormatError::Compression(format!("lz4 decompression failed: {e}"))
                })?;
                return if decoded.is_empty() {
                    Ok(())
                } else {
                    Err(FormatError::Compression(format!(
                        "lz4 produced {} bytes, expected 0",
                        decoded.len()
                    )))
                };
            }
            let written = lz4_flex::block::decompress_into(input, output)
                .map_err(|e| FormatError::Compression(format!("lz4 decompression failed: {e}")))?;
            if written != output.len() {
                return Err(FormatError::Compression(format!(
                    "lz4 produced {written} bytes, expected {}",
                    output.len()
                )));
            }
            Ok(())
        }
        CompressionType::Deflate => {
            let mut decoder = DeflateDecoder::new(input);
            decoder.read_exact(output).map_err(|e| {
                FormatError::Compression(format!("deflate decompression failed: {e}"))
            })?;
            let mut probe = [0u8; 1];
            let extra = decoder.read(&mut probe).map_err(|e| {
                FormatError::Compression(format!("deflate decompression failed: {e}"))
            })?;
            if extra != 0 {
                return Err(FormatError::Compression(format!(
                    "deflate stream longer than expected {} bytes",
                    output.len()
                )));
            }
            Ok(())
        }
    }
}

/// Decompress into a freshly allocated buffer of `original_size` bytes
pub fn decompress_to_vec(
    compression: CompressionType,
    input: &[u8],
    original_size: usize,
) -> FormatResult<Vec<u8>> {
    let mut output = vec![0u8; original_size];
    decompress(compression, input, &mut output)?;
    Ok(output)
}
