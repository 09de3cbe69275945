use super::{decompress, Compressor, CompressorId};

#[cfg(feature = "zlib-compression")]
#[test]
fn zlib_round_trip() {
    let compressor = Compressor::Zlib { level: Some(6) };
    let data = b"{ \"hello\": 1, \"payload\": \"aaaaaaaaaaaaaaaaaaaaaaaaaaaa\" }";
    let compressed = compressor.compress(data).unwrap();
    let decompressed = decompress(CompressorId::Zlib, &compressed).unwrap();
    assert_eq!(decompressed.as_slice(), data.as_slice());
}

#[cfg(feature = "snappy-compression")]
#[test]
fn snappy_round_trip() {
    let compressor = Compressor::Snappy;
    let data = b"{ \"hello\": 1, \"payload\": \"aaaaaaaaaaaaaaaaaaaaaaaaaaaa\" }";
    let compressed = compressor.compress(data).unwrap();
    let decompressed = decompress(CompressorId::Snappy, &compressed).unwrap();
    assert_eq!(decompressed.as_slice(), data.as_slice());
}

#[cfg(feature = "zstd-compression")]
#[test]
fn zstd_round_trip() {
    let compressor = Compressor::Zstd { level: None };
    let data = b"{ \"hello\": 1, \"payload\": \"aaaaaaaaaaaaaaaaaaaaaaaaaaaa\" }";
    let compressed = compressor.compress(data).unwrap();
    let decompressed = decompress(CompressorId::Zstd, &compressed).unwrap();
    assert_eq!(decompressed.as_slice(), data.as_slice());
}

#[cfg(feature = "zlib-compression")]
#[test]
fn compression_levels_are_validated() {
    assert!(Compressor::Zlib { level: Some(10) }.validate().is_err());
    assert!(Compressor::Zlib { level: Some(-1) }.validate().is_ok());
}
