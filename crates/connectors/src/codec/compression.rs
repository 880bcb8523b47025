use flate2::{
    Compression as GzLevel,
    read::MultiGzDecoder,
    write::{GzEncoder, MultiGzDecoder as GzStreamDecoder},
};
use model::dump::task::Compression;
use std::io::{self, Read, Write};

const ZSTD_LEVEL: i32 = 1;

enum Encoder {
    Plain(Vec<u8>),
    Gzip(GzEncoder<Vec<u8>>),
    Zstd(zstd::stream::write::Encoder<'static, Vec<u8>>),
}

/// Incremental compressor. Input is pushed with [`write`](Self::write) and
/// compressed output is drained with [`take_output`](Self::take_output) so
/// large files never sit fully in memory.
pub struct CompressingWriter {
    encoder: Encoder,
    consumed: u64,
}

impl CompressingWriter {
    pub fn new(compression: Compression) -> io::Result<Self> {
        let encoder = match compression {
            Compression::None => Encoder::Plain(Vec::new()),
            Compression::Gzip => Encoder::Gzip(GzEncoder::new(Vec::new(), GzLevel::fast())),
            Compression::Zstd => {
                Encoder::Zstd(zstd::stream::write::Encoder::new(Vec::new(), ZSTD_LEVEL)?)
            }
        };
        Ok(CompressingWriter {
            encoder,
            consumed: 0,
        })
    }

    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.consumed += data.len() as u64;
        match &mut self.encoder {
            Encoder::Plain(buf) => {
                buf.extend_from_slice(data);
                Ok(())
            }
            Encoder::Gzip(enc) => enc.write_all(data),
            Encoder::Zstd(enc) => enc.write_all(data),
        }
    }

    /// Uncompressed bytes accepted so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Compressed bytes produced since the last call.
    pub fn take_output(&mut self) -> Vec<u8> {
        match &mut self.encoder {
            Encoder::Plain(buf) => std::mem::take(buf),
            Encoder::Gzip(enc) => std::mem::take(enc.get_mut()),
            Encoder::Zstd(enc) => std::mem::take(enc.get_mut()),
        }
    }

    /// Flushes the stream trailer and returns the remaining output.
    pub fn finish(self) -> io::Result<Vec<u8>> {
        match self.encoder {
            Encoder::Plain(buf) => Ok(buf),
            Encoder::Gzip(enc) => enc.finish(),
            Encoder::Zstd(enc) => enc.finish(),
        }
    }
}

enum Decoder {
    Plain(Vec<u8>),
    Gzip(GzStreamDecoder<Vec<u8>>),
    Zstd(zstd::stream::write::Decoder<'static, Vec<u8>>),
}

/// Incremental decompressor, the reading counterpart of
/// [`CompressingWriter`]. Compressed pieces go in with
/// [`write`](Self::write) and plain bytes come out of
/// [`take_output`](Self::take_output).
pub struct Decompressor {
    decoder: Decoder,
}

impl Decompressor {
    pub fn new(compression: Compression) -> io::Result<Self> {
        let decoder = match compression {
            Compression::None => Decoder::Plain(Vec::new()),
            Compression::Gzip => Decoder::Gzip(GzStreamDecoder::new(Vec::new())),
            Compression::Zstd => Decoder::Zstd(zstd::stream::write::Decoder::new(Vec::new())?),
        };
        Ok(Decompressor { decoder })
    }

    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        match &mut self.decoder {
            Decoder::Plain(buf) => {
                buf.extend_from_slice(data);
                Ok(())
            }
            Decoder::Gzip(dec) => dec.write_all(data),
            Decoder::Zstd(dec) => dec.write_all(data),
        }
    }

    /// Plain bytes produced since the last call.
    pub fn take_output(&mut self) -> Vec<u8> {
        match &mut self.decoder {
            Decoder::Plain(buf) => std::mem::take(buf),
            Decoder::Gzip(dec) => std::mem::take(dec.get_mut()),
            Decoder::Zstd(dec) => std::mem::take(dec.get_mut()),
        }
    }

    /// Returns whatever the decoder still held back.
    pub fn finish(self) -> io::Result<Vec<u8>> {
        match self.decoder {
            Decoder::Plain(buf) => Ok(buf),
            Decoder::Gzip(dec) => dec.finish(),
            Decoder::Zstd(mut dec) => {
                dec.flush()?;
                Ok(dec.into_inner())
            }
        }
    }
}

pub fn compress(compression: Compression, data: &[u8]) -> io::Result<Vec<u8>> {
    let mut writer = CompressingWriter::new(compression)?;
    writer.write(data)?;
    let mut out = writer.take_output();
    out.extend(writer.finish()?);
    Ok(out)
}

pub fn decompress(compression: Compression, data: &[u8]) -> io::Result<Vec<u8>> {
    match compression {
        Compression::None => Ok(data.to_vec()),
        Compression::Gzip => {
            let mut out = Vec::new();
            MultiGzDecoder::new(data).read_to_end(&mut out)?;
            Ok(out)
        }
        Compression::Zstd => zstd::stream::decode_all(data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> Vec<u8> {
        (0..20_000u32)
            .flat_map(|i| format!("{i}\trow {i}\n").into_bytes())
            .collect()
    }

    #[test]
    fn streamed_output_decodes() {
        for compression in [Compression::None, Compression::Gzip, Compression::Zstd] {
            let data = payload();
            let mut writer = CompressingWriter::new(compression).unwrap();
            let mut out = Vec::new();
            for piece in data.chunks(4096) {
                writer.write(piece).unwrap();
                out.extend(writer.take_output());
            }
            assert_eq!(writer.consumed(), data.len() as u64);
            out.extend(writer.finish().unwrap());

            assert_eq!(decompress(compression, &out).unwrap(), data, "{compression}");
        }
    }

    #[test]
    fn decompresses_in_pieces() {
        for compression in [Compression::None, Compression::Gzip, Compression::Zstd] {
            let data = payload();
            let packed = compress(compression, &data).unwrap();
            let mut decoder = Decompressor::new(compression).unwrap();
            let mut out = Vec::new();
            let mut largest = 0;
            for piece in packed.chunks(1000) {
                decoder.write(piece).unwrap();
                let produced = decoder.take_output();
                largest = largest.max(produced.len());
                out.extend(produced);
            }
            out.extend(decoder.finish().unwrap());

            assert_eq!(out, data, "{compression}");
            assert!(largest < data.len(), "{compression} decoded everything at once");
        }
    }

    #[test]
    fn compressed_output_is_smaller() {
        let data = payload();
        assert!(compress(Compression::Zstd, &data).unwrap().len() < data.len() / 2);
        assert!(compress(Compression::Gzip, &data).unwrap().len() < data.len() / 2);
    }

    #[test]
    fn corrupt_input_fails() {
        assert!(decompress(Compression::Zstd, b"not zstd").is_err());
    }
}
