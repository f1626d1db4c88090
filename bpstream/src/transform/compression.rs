use std::fmt;
use std::io::Cursor;

#[cfg(feature = "deflate")]
use comde::deflate::{DeflateCompressor, DeflateDecompressor};
#[cfg(feature = "zstd")]
use comde::zstd::{ZstdCompressor, ZstdDecompressor};
use comde::{
    stored::{StoredCompressor, StoredDecompressor},
    Compressor, Decompressor,
};

use super::Transform;
use crate::{Error, Params, Result};

#[derive(Clone, Copy, Eq, PartialEq)]
pub enum Compression {
    Stored,
    Deflate,
    Zstd,
}

impl Default for Compression {
    fn default() -> Self {
        Self::Stored
    }
}

impl Compression {
    /// Variants compiled into this build.
    pub const fn available() -> &'static [Compression] {
        &[
            Compression::Stored,
            #[cfg(feature = "deflate")]
            Compression::Deflate,
            #[cfg(feature = "zstd")]
            Compression::Zstd,
        ]
    }

    pub const fn name(self) -> &'static str {
        match self {
            Compression::Stored => "stored",
            Compression::Deflate => "deflate",
            Compression::Zstd => "zstd",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Compression::Stored => "stored",
            Compression::Deflate => "DEFLATE",
            Compression::Zstd => "Zstandard",
        };

        write!(f, "{}", s)
    }
}

impl fmt::Debug for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

fn compression_error(compression: Compression, source: std::io::Error) -> Error {
    Error::io(format!("in {} transform", compression), source)
}

impl Transform for Compression {
    fn name(&self) -> &str {
        Compression::name(*self)
    }

    fn encode(&self, input: &[u8], _params: &Params) -> Result<Vec<u8>> {
        let mut writer = Cursor::new(Vec::with_capacity(input.len()));
        let mut reader = input;

        let result = match self {
            Compression::Stored => StoredCompressor.compress(&mut writer, &mut reader),
            #[cfg(feature = "deflate")]
            Compression::Deflate => DeflateCompressor.compress(&mut writer, &mut reader),
            #[cfg(feature = "zstd")]
            Compression::Zstd => ZstdCompressor.compress(&mut writer, &mut reader),
            #[allow(unreachable_patterns)]
            missing => {
                return Err(Error::InvalidArgument(format!(
                    "compiled without support for {:?}",
                    missing
                )))
            }
        };

        result.map_err(|e| compression_error(*self, e))?;
        Ok(writer.into_inner())
    }

    fn decode(&self, input: &[u8], _params: &Params, decoded_size: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(decoded_size);

        let result = match self {
            Compression::Stored => StoredDecompressor.copy(input, &mut out),
            #[cfg(feature = "deflate")]
            Compression::Deflate => DeflateDecompressor.copy(input, &mut out),
            #[cfg(feature = "zstd")]
            Compression::Zstd => ZstdDecompressor.copy(input, &mut out),
            #[allow(unreachable_patterns)]
            missing => {
                return Err(Error::InvalidArgument(format!(
                    "compiled without support for {:?}",
                    missing
                )))
            }
        };

        result.map_err(|e| compression_error(*self, e))?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compressible() -> Vec<u8> {
        "This, this, this, this, this is a compressable string string string string string.\n"
            .repeat(20)
            .into_bytes()
    }

    #[test]
    fn builtins_round_trip() {
        for compression in Compression::available() {
            let data = compressible();
            let encoded = compression.encode(&data, &Params::new()).unwrap();
            let decoded = compression
                .decode(&encoded, &Params::new(), data.len())
                .unwrap();
            assert_eq!(decoded, data, "{}", compression);
        }
    }

    #[cfg(feature = "zstd")]
    #[test]
    fn zstd_shrinks_repetitive_data() {
        let data = compressible();
        let encoded = Compression::Zstd.encode(&data, &Params::new()).unwrap();
        assert!(encoded.len() < data.len());
    }
}
