#[cfg(any(
    feature = "zstd-compression",
    feature = "zlib-compression",
    feature = "snappy-compression"
))]
#[cfg(test)]
mod test;

#[cfg(feature = "zlib-compression")]
use flate2::{
    write::{ZlibDecoder, ZlibEncoder},
    Compression,
};
#[cfg(any(
    feature = "zstd-compression",
    feature = "zlib-compression",
    feature = "snappy-compression"
))]
use std::io::Write;

use crate::error::{Error, ErrorKind, Result};

/// The wire identifiers assigned to each compression algorithm.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum CompressorId {
    Noop = 0,
    Snappy = 1,
    Zlib = 2,
    Zstd = 3,
}

impl CompressorId {
    pub(crate) fn from_u8(id: u8) -> Result<Self> {
        match id {
            0 => Ok(CompressorId::Noop),
            1 => Ok(CompressorId::Snappy),
            2 => Ok(CompressorId::Zlib),
            3 => Ok(CompressorId::Zstd),
            other => Err(ErrorKind::InvalidResponse {
                message: format!("Invalid compressor id: {}", other),
            }
            .into()),
        }
    }
}

/// Enum representing supported compressor algorithms.
///
/// Used for compressing and decompressing messages sent to and read from the server. For
/// compressors that take a `level`, use `None` to indicate the default level; a higher `level`
/// indicates more (and slower) compression.
///
/// The `zstd-compression`, `zlib-compression`, and `snappy-compression` feature flags enable the
/// respective variants.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum Compressor {
    /// Zstd compressor.
    #[cfg(any(feature = "zstd-compression", docsrs))]
    Zstd {
        /// Zstd compression level.
        level: Option<i32>,
    },

    /// Zlib compressor.
    #[cfg(any(feature = "zlib-compression", docsrs))]
    Zlib {
        /// Zlib compression level.
        level: Option<i32>,
    },

    /// Snappy compressor.
    #[cfg(any(feature = "snappy-compression", docsrs))]
    Snappy,
}

impl Compressor {
    /// Parse a compressor name from the connection string, wiring in the negotiated zlib level
    /// when applicable. Names of algorithms whose feature is not enabled are rejected here so
    /// that misconfiguration surfaces at parse time rather than on the first command.
    #[allow(unused_variables)]
    pub(crate) fn parse_str(name: &str, zlib_compression_level: Option<i32>) -> Result<Self> {
        match name {
            #[cfg(feature = "zstd-compression")]
            "zstd" => Ok(Compressor::Zstd { level: None }),
            #[cfg(not(feature = "zstd-compression"))]
            "zstd" => Err(Error::from(ErrorKind::InvalidArgument {
                message: "zstd compression requires the zstd-compression feature".to_string(),
            })),
            #[cfg(feature = "zlib-compression")]
            "zlib" => Ok(Compressor::Zlib {
                level: zlib_compression_level,
            }),
            #[cfg(not(feature = "zlib-compression"))]
            "zlib" => Err(Error::from(ErrorKind::InvalidArgument {
                message: "zlib compression requires the zlib-compression feature".to_string(),
            })),
            #[cfg(feature = "snappy-compression")]
            "snappy" => Ok(Compressor::Snappy),
            #[cfg(not(feature = "snappy-compression"))]
            "snappy" => Err(Error::from(ErrorKind::InvalidArgument {
                message: "snappy compression requires the snappy-compression feature".to_string(),
            })),
            other => Err(Error::from(ErrorKind::InvalidArgument {
                message: format!("unsupported compressor: {}", other),
            })),
        }
    }

    /// The name of the compressor as sent in the handshake.
    pub(crate) fn name(&self) -> &'static str {
        match *self {
            #[cfg(feature = "zstd-compression")]
            Compressor::Zstd { .. } => "zstd",
            #[cfg(feature = "zlib-compression")]
            Compressor::Zlib { .. } => "zlib",
            #[cfg(feature = "snappy-compression")]
            Compressor::Snappy => "snappy",
            #[cfg(not(any(
                feature = "zstd-compression",
                feature = "zlib-compression",
                feature = "snappy-compression"
            )))]
            _ => unreachable!(),
        }
    }

    pub(crate) fn id(&self) -> CompressorId {
        match *self {
            #[cfg(feature = "zstd-compression")]
            Compressor::Zstd { .. } => CompressorId::Zstd,
            #[cfg(feature = "zlib-compression")]
            Compressor::Zlib { .. } => CompressorId::Zlib,
            #[cfg(feature = "snappy-compression")]
            Compressor::Snappy => CompressorId::Snappy,
            #[cfg(not(any(
                feature = "zstd-compression",
                feature = "zlib-compression",
                feature = "snappy-compression"
            )))]
            _ => unreachable!(),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        #[allow(unreachable_patterns)]
        match *self {
            #[cfg(feature = "zstd-compression")]
            Compressor::Zstd { level: Some(level) }
                if level < zstd::zstd_safe::min_c_level()
                    || level > zstd::zstd_safe::max_c_level() =>
            {
                Err(Error::from(ErrorKind::InvalidArgument {
                    message: format!("invalid zstd compression level: {}", level),
                }))
            }
            #[cfg(feature = "zlib-compression")]
            Compressor::Zlib { level: Some(level) } if !(-1..=9).contains(&level) => {
                Err(Error::from(ErrorKind::InvalidArgument {
                    message: format!("invalid zlib compression level: {}", level),
                }))
            }
            _ => Ok(()),
        }
    }

    /// Compress `data`, returning the compressed bytes.
    #[allow(unused)]
    pub(crate) fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match *self {
            #[cfg(feature = "zstd-compression")]
            Compressor::Zstd { level } => {
                let level = level.unwrap_or(zstd::DEFAULT_COMPRESSION_LEVEL);
                zstd::encode_all(data, level).map_err(|e| {
                    Error::from(ErrorKind::Internal {
                        message: format!("an error occurred while compressing: {}", e),
                    })
                })
            }
            #[cfg(feature = "zlib-compression")]
            Compressor::Zlib { level } => {
                let level = match level {
                    Some(level) if level >= 0 => Compression::new(level as u32),
                    _ => Compression::default(),
                };
                let mut encoder = ZlibEncoder::new(Vec::new(), level);
                encoder.write_all(data)?;
                encoder.finish().map_err(|e| {
                    Error::from(ErrorKind::Internal {
                        message: format!("an error occurred while compressing: {}", e),
                    })
                })
            }
            #[cfg(feature = "snappy-compression")]
            Compressor::Snappy => {
                let mut encoder = snap::raw::Encoder::new();
                encoder.compress_vec(data).map_err(|e| {
                    Error::from(ErrorKind::Internal {
                        message: format!("an error occurred while compressing: {}", e),
                    })
                })
            }
            #[cfg(not(any(
                feature = "zstd-compression",
                feature = "zlib-compression",
                feature = "snappy-compression"
            )))]
            _ => unreachable!(),
        }
    }
}

/// Decompress `data` that was compressed with the algorithm identified by `id`.
#[allow(unused_variables)]
pub(crate) fn decompress(id: CompressorId, data: &[u8]) -> Result<Vec<u8>> {
    match id {
        CompressorId::Noop => Ok(data.to_vec()),
        #[cfg(feature = "zstd-compression")]
        CompressorId::Zstd => zstd::decode_all(data).map_err(|e| {
            Error::from(ErrorKind::Internal {
                message: format!("an error occurred while decompressing: {}", e),
            })
        }),
        #[cfg(feature = "zlib-compression")]
        CompressorId::Zlib => {
            let mut decoder = ZlibDecoder::new(Vec::new());
            decoder.write_all(data)?;
            decoder.finish().map_err(|e| {
                Error::from(ErrorKind::Internal {
                    message: format!("an error occurred while decompressing: {}", e),
                })
            })
        }
        #[cfg(feature = "snappy-compression")]
        CompressorId::Snappy => {
            let mut decoder = snap::raw::Decoder::new();
            decoder.decompress_vec(data).map_err(|e| {
                Error::from(ErrorKind::Internal {
                    message: format!("an error occurred while decompressing: {}", e),
                })
            })
        }
        other => Err(ErrorKind::InvalidResponse {
            message: format!(
                "the server sent a reply compressed with {:?}, but support for it is not enabled",
                other
            ),
        }
        .into()),
    }
}
