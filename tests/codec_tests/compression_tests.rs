//! Tests for payload compression

use stashkv::compression::{deflate, inflate, Compressor};

#[test]
fn test_below_threshold_is_not_compressed() {
    let compressor = Compressor::new(true, 1024);
    let small = vec![b'a'; 1024];

    assert!(compressor.compress(&small).unwrap().is_none());
}

#[test]
fn test_above_threshold_is_compressed() {
    let compressor = Compressor::new(true, 1024);
    let large = "budget ".repeat(400).into_bytes();

    let packed = compressor.compress(&large).unwrap().unwrap();

    assert_eq!(packed.original_size, large.len() as u64);
    assert_eq!(packed.compressed_size, packed.data.len() as u64);
    assert!(packed.compressed_size < packed.original_size);
    assert_eq!(compressor.decompress(&packed.data).unwrap(), large);
}

#[test]
fn test_disabled_compressor_passes_through() {
    let compressor = Compressor::new(false, 16);
    let large = vec![b'z'; 4096];

    assert!(!compressor.is_enabled());
    assert!(compressor.compress(&large).unwrap().is_none());
}

/// Pseudo-random bytes (xorshift), which DEFLATE cannot shrink
fn noise(len: usize) -> Vec<u8> {
    let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 56) as u8
        })
        .collect()
}

#[test]
fn test_incompressible_payload_stays_raw() {
    let compressor = Compressor::new(true, 16);

    assert!(compressor.compress(&noise(8192)).unwrap().is_none());
}

#[test]
fn test_deflate_inflate() {
    let text = b"income income income expense expense".repeat(20);
    assert_eq!(inflate(&deflate(&text).unwrap()).unwrap(), text);
}

#[test]
fn test_inflate_rejects_garbage() {
    assert!(inflate(&[0xFF, 0xFF, 0xFF, 0xFF]).is_err());
}
