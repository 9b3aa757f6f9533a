use anyhow::{anyhow, Context, Result};
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Cursor, Read};
use std::path::Path;

const GZIP_MAGIC: [u8; 3] = [0x1F, 0x8B, 0x08];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Zstd,
    Plain,
}

/// Classify a stream by its first bytes
pub fn detect(head: &[u8]) -> Compression {
    if head.starts_with(&GZIP_MAGIC) {
        Compression::Gzip
    } else if head.starts_with(&ZSTD_MAGIC) {
        Compression::Zstd
    } else {
        Compression::Plain
    }
}

/// Wrap any reader in the decoder its magic bytes call for
pub fn maybe_decompress<R: Read + Send + 'static>(mut reader: R) -> io::Result<Box<dyn Read + Send>> {
    let mut head = [0u8; 4];
    let mut n = 0;
    // Pipes may hand out fewer than four bytes per read
    while n < head.len() {
        let read = reader.read(&mut head[n..])?;
        if read == 0 {
            break;
        }
        n += read;
    }

    // Put the sniffed bytes back in front
    let chained = Cursor::new(head[..n].to_vec()).chain(reader);

    match detect(&head[..n]) {
        Compression::Gzip => Ok(Box::new(MultiGzDecoder::new(chained))),
        Compression::Zstd => Ok(Box::new(zstd::Decoder::new(chained)?)),
        Compression::Plain => Ok(Box::new(chained)),
    }
}

/// Open a log source for line reading; `-` is stdin
pub fn open_input(source: &str) -> Result<Box<dyn BufRead + Send>> {
    if source == "-" {
        let reader = maybe_decompress(io::stdin()).context("Failed to read stdin")?;
        return Ok(Box::new(BufReader::new(reader)));
    }

    let path = Path::new(source);
    if let Some(extension) = path.extension().and_then(|ext| ext.to_str()) {
        if extension.eq_ignore_ascii_case("zip") {
            return Err(anyhow!(
                "ZIP archives are not supported, only gzip and zstd. Extract it first: unzip {}",
                path.display()
            ));
        }
    }

    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let reader = maybe_decompress(file)
        .with_context(|| format!("Failed to detect compression of {}", path.display()))?;
    Ok(Box::new(BufReader::new(reader)))
}
