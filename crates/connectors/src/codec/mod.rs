pub mod compression;

pub use compression::{CompressingWriter, Decompressor, compress, decompress};
