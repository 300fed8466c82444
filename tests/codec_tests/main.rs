//! Codec test suite: crypto, compression and the entry format

mod compression_tests;
