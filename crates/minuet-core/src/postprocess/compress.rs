//! Accept-Encoding negotiation and body compression.

use std::io::Write;

use flate2::Compression;
use flate2::write::GzEncoder;
use tracing::debug;

/// A body must exceed this size to be compressed.
pub const MIN_COMPRESS_SIZE: usize = 4096;

const GZIP_LEVEL: u32 = 5;
const BROTLI_QUALITY: u32 = 5;
const BROTLI_WINDOW: u32 = 22;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coding {
    Brotli,
    Gzip,
}

impl Coding {
    pub fn header_value(self) -> &'static str {
        match self {
            Coding::Brotli => "br",
            Coding::Gzip => "gzip",
        }
    }
}

fn quality_of(token: &str) -> f64 {
    for param in token.split(';').skip(1) {
        let param = param.trim();
        if let Some(q) = param.strip_prefix("q=").or_else(|| param.strip_prefix("Q=")) {
            return q.trim().parse::<f64>().unwrap_or(0.0);
        }
    }
    1.0
}

/// Pick a coding from an `Accept-Encoding` value. A `q=0` token
/// disqualifies that coding, the highest q wins and ties prefer Brotli.
pub fn pick_coding(accept_encoding: &str) -> Option<Coding> {
    let mut q_br = -1.0f64;
    let mut q_gz = -1.0f64;

    for token in accept_encoding.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let name = token.split(';').next().unwrap_or("").trim();
        if name.eq_ignore_ascii_case("br") {
            q_br = quality_of(token);
        } else if name.eq_ignore_ascii_case("gzip") {
            q_gz = quality_of(token);
        }
        // identity and unknown codings are ignored
    }

    if q_br <= 0.0 && q_gz <= 0.0 {
        return None;
    }
    if q_br > q_gz {
        return Some(Coding::Brotli);
    }
    if q_gz > q_br {
        return Some(Coding::Gzip);
    }
    Some(Coding::Brotli)
}

pub fn gzip(input: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(
        Vec::with_capacity(input.len() / 2),
        Compression::new(GZIP_LEVEL),
    );
    encoder.write_all(input)?;
    encoder.finish()
}

pub fn brotli_compress(input: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len() / 2);
    {
        let mut writer = brotli::CompressorWriter::new(
            &mut out,
            4096,
            BROTLI_QUALITY,
            BROTLI_WINDOW,
        );
        writer.write_all(input)?;
        writer.flush()?;
    }
    Ok(out)
}

/// Compress `input` with the chosen coding; `None` when the result is not
/// strictly smaller or the encoder failed.
pub fn compress(coding: Coding, input: &[u8]) -> Option<Vec<u8>> {
    let result = match coding {
        Coding::Brotli => brotli_compress(input),
        Coding::Gzip => gzip(input),
    };
    match result {
        Ok(compressed) if !compressed.is_empty() && compressed.len() < input.len() => {
            Some(compressed)
        }
        Ok(_) => None,
        Err(e) => {
            debug!(target: "compress", "compression failed: {e}");
            None
        }
    }
}
