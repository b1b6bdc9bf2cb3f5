//! Decompression of data node payloads.
//!
//! Each codec is optional (Cargo features `lzo`, `zlib` and `zstd`); a data node using a codec
//! that is not compiled in can still be decoded, only its contents cannot be read.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Lzo,
    /// Raw deflate, without zlib framing
    Zlib,
    Zstd,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("{0} support is not compiled in")]
    Disabled(Compression),

    #[error("{codec} stream is corrupt: {detail}")]
    Corrupt { codec: Compression, detail: String },

    #[error("decompressed {actual} bytes, expected {expected}")]
    Length { expected: usize, actual: usize },
}

impl Compression {
    pub fn from_tag(tag: u16) -> Option<Self> {
        Some(match tag {
            0 => Self::None,
            1 => Self::Lzo,
            2 => Self::Zlib,
            3 => Self::Zstd,
            _ => return None,
        })
    }

    pub fn tag(self) -> u16 {
        self as u16
    }

    pub fn is_enabled(self) -> bool {
        match self {
            Self::None => true,
            Self::Lzo => cfg!(feature = "lzo"),
            Self::Zlib => cfg!(feature = "zlib"),
            Self::Zstd => cfg!(feature = "zstd"),
        }
    }

    /// Decompress `input`, which must expand to exactly `expected` bytes.
    pub fn decompress(self, input: &[u8], expected: usize) -> Result<Vec<u8>, CodecError> {
        let out = match self {
            Self::None => input.to_vec(),
            Self::Lzo => lzo(input, expected)?,
            Self::Zlib => zlib(input, expected)?,
            Self::Zstd => zstd(input, expected)?,
        };

        if out.len() != expected {
            return Err(CodecError::Length {
                expected,
                actual: out.len(),
            });
        }
        Ok(out)
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Lzo => "lzo",
            Self::Zlib => "zlib",
            Self::Zstd => "zstd",
        })
    }
}

#[cfg(feature = "lzo")]
fn lzo(input: &[u8], expected: usize) -> Result<Vec<u8>, CodecError> {
    use rust_lzo::{LZOContext, LZOError};

    let mut out = vec![0u8; expected];
    let (written, err) = LZOContext::decompress_to_slice(input, &mut out);
    let written = written.len();
    if !matches!(err, LZOError::OK) {
        return Err(CodecError::Corrupt {
            codec: Compression::Lzo,
            detail: lzo_error_text(&err).to_string(),
        });
    }
    out.truncate(written);
    Ok(out)
}

/// `LZOError` implements neither `Debug` nor `Display`
#[cfg(feature = "lzo")]
fn lzo_error_text(err: &rust_lzo::LZOError) -> &'static str {
    use rust_lzo::LZOError;

    match err {
        LZOError::OK => "no error",
        LZOError::ERROR => "generic error",
        LZOError::OUT_OF_MEMORY => "out of memory",
        LZOError::NOT_COMPRESSIBLE => "not compressible",
        LZOError::INPUT_OVERRUN => "input overrun",
        LZOError::OUTPUT_OVERRUN => "output overrun",
        LZOError::LOOKBEHIND_OVERRUN => "lookbehind overrun",
        LZOError::EOF_NOT_FOUND => "end of stream not found",
        LZOError::INPUT_NOT_CONSUMED => "input not consumed",
        LZOError::NOT_YET_IMPLEMENTED => "not implemented",
        LZOError::INVALID_ARGUMENT => "invalid argument",
    }
}

#[cfg(not(feature = "lzo"))]
fn lzo(_: &[u8], _: usize) -> Result<Vec<u8>, CodecError> {
    Err(CodecError::Disabled(Compression::Lzo))
}

#[cfg(feature = "zlib")]
fn zlib(input: &[u8], expected: usize) -> Result<Vec<u8>, CodecError> {
    use std::io::Read;

    let mut out = Vec::with_capacity(expected);
    // One byte past the expected length is enough to notice an over-long stream
    flate2::read::DeflateDecoder::new(input)
        .take(expected as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| CodecError::Corrupt {
            codec: Compression::Zlib,
            detail: e.to_string(),
        })?;
    Ok(out)
}

#[cfg(not(feature = "zlib"))]
fn zlib(_: &[u8], _: usize) -> Result<Vec<u8>, CodecError> {
    Err(CodecError::Disabled(Compression::Zlib))
}

#[cfg(feature = "zstd")]
fn zstd(input: &[u8], expected: usize) -> Result<Vec<u8>, CodecError> {
    zstd::bulk::decompress(input, expected).map_err(|e| CodecError::Corrupt {
        codec: Compression::Zstd,
        detail: e.to_string(),
    })
}

#[cfg(not(feature = "zstd"))]
fn zstd(_: &[u8], _: usize) -> Result<Vec<u8>, CodecError> {
    Err(CodecError::Disabled(Compression::Zstd))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fixture::compress;

    fn sample() -> Vec<u8> {
        (0..3000u32).map(|x| (x % 251) as u8 ^ (x / 7) as u8).collect()
    }

    #[test]
    fn test_none() -> anyhow::Result<()> {
        let data = sample();
        assert_eq!(Compression::None.decompress(&data, data.len())?, data);
        assert!(matches!(
            Compression::None.decompress(&data, data.len() + 1),
            Err(CodecError::Length { .. })
        ));
        Ok(())
    }

    #[cfg(feature = "lzo")]
    #[test]
    fn test_lzo() -> anyhow::Result<()> {
        for data in [sample(), b"short".to_vec(), vec![0x42; 4096]] {
            let packed = compress(Compression::Lzo, &data);
            assert_eq!(Compression::Lzo.decompress(&packed, data.len())?, data);
        }

        // Runs compress to back-references, not just literals
        let packed = compress(Compression::Lzo, &[0x42; 4096]);
        assert!(packed.len() < 512);

        let packed = compress(Compression::Lzo, &sample());
        match Compression::Lzo.decompress(&packed, 100) {
            Err(CodecError::Corrupt { codec, detail }) => {
                assert_eq!(codec, Compression::Lzo);
                assert_eq!(detail, "output overrun");
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert!(Compression::Lzo
            .decompress(&packed[..packed.len() / 2], 3000)
            .is_err());
        Ok(())
    }

    #[cfg(feature = "zlib")]
    #[test]
    fn test_zlib() -> anyhow::Result<()> {
        let data = sample();
        let packed = compress(Compression::Zlib, &data);
        assert!(packed.len() < data.len());
        assert_eq!(Compression::Zlib.decompress(&packed, data.len())?, data);
        assert!(matches!(
            Compression::Zlib.decompress(&packed, 10),
            Err(CodecError::Length { .. })
        ));
        assert!(Compression::Zlib.decompress(&[0xFF; 16], 10).is_err());
        Ok(())
    }

    #[cfg(feature = "zstd")]
    #[test]
    fn test_zstd() -> anyhow::Result<()> {
        let data = sample();
        let packed = compress(Compression::Zstd, &data);
        assert_eq!(Compression::Zstd.decompress(&packed, data.len())?, data);
        assert!(Compression::Zstd.decompress(&packed, 10).is_err());
        Ok(())
    }

    #[test]
    fn test_tags() {
        assert_eq!(Compression::from_tag(2), Some(Compression::Zlib));
        assert_eq!(Compression::from_tag(4), None);
        assert_eq!(Compression::Zstd.tag(), 3);
    }
}
