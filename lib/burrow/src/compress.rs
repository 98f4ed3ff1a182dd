use crate::error::{Error, Result};
use crate::message::Compression;

/// Selective payload compression. Compression is an attempt: the compressed
/// form is used only when it is strictly smaller than the input, otherwise
/// the caller keeps the raw bytes and clears the wire flag.
pub struct Compressor {
    max_payload: usize,
}

impl Compressor {
    pub fn new(max_payload: usize) -> Compressor {
        Compressor { max_payload }
    }

    /// Tries to compress `data` with the requested method. Returns `None`
    /// when no size reduction was achieved or the method is unavailable.
    pub fn compress(&self, method: Compression, level: u8, data: &[u8]) -> Option<Vec<u8>> {
        let out = match method {
            Compression::None => return None,
            Compression::Lz4 => lz4_flex::compress_prepend_size(data),
            // LZO is part of the wire format for interoperability but has no
            // maintained implementation here; config validation rejects it.
            Compression::Lzo => return None,
            Compression::Zstd => zstd::bulk::compress(data, i32::from(level)).ok()?,
        };

        if out.len() < data.len() {
            Some(out)
        } else {
            None
        }
    }

    pub fn decompress(&self, method: Compression, data: &[u8]) -> Result<Vec<u8>> {
        match method {
            Compression::None => Ok(data.to_vec()),
            Compression::Lz4 => {
                // The size prefix is peer-controlled; reject oversized
                // claims before any allocation happens.
                let (size, _) =
                    lz4_flex::block::uncompressed_size(data).map_err(|_| Error::WrongPayload)?;
                if size > self.max_payload {
                    return Err(Error::WrongPayload);
                }
                lz4_flex::decompress_size_prepended(data).map_err(|_| Error::WrongPayload)
            }
            Compression::Lzo => Err(Error::UnsupportedCompression),
            Compression::Zstd => zstd::bulk::decompress(data, self.max_payload + 1)
                .map_err(|_| Error::WrongPayload),
        }
    }
}
