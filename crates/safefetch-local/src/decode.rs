//! Incremental `Content-Encoding` decoding.
//!
//! Bodies arrive chunk by chunk, so each coding is a push-style decoder: compressed bytes go in,
//! whatever plaintext is ready comes out. Stacked codings are undone in reverse of the order
//! the header lists them (the last coding listed was applied last).

use safefetch_core::{Error, Result};
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

/// Codings we can undo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coding {
    Identity,
    Gzip,
    Deflate,
    Brotli,
}

impl Coding {
    pub fn from_token(token: &str) -> Result<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "" | "identity" => Ok(Self::Identity),
            "gzip" | "x-gzip" => Ok(Self::Gzip),
            "deflate" => Ok(Self::Deflate),
            "br" => Ok(Self::Brotli),
            other => Err(Error::UnsupportedContent(format!(
                "unsupported content-encoding '{other}'"
            ))),
        }
    }
}

/// Parse a `Content-Encoding` header into the decode order.
pub fn decode_order(header: Option<&str>) -> Result<Vec<Coding>> {
    let Some(h) = header else {
        return Ok(Vec::new());
    };
    let mut listed = Vec::new();
    for token in h.split(',') {
        match Coding::from_token(token)? {
            Coding::Identity => {}
            c => listed.push(c),
        }
    }
    listed.reverse();
    Ok(listed)
}

/// Extra room given to the inner stages of a stacked chain, whose output is still encoded.
const INNER_STAGE_SLACK: usize = 64 * 1024;

/// Shared output buffer the write-side decoders spill into.
///
/// Each drain accepts at most `cap` bytes. A write past that keeps what fits, marks the spill
/// full and fails, which stops the decoder in the middle of its input.
#[derive(Clone, Default)]
struct Spill(Arc<Mutex<SpillState>>);

#[derive(Default)]
struct SpillState {
    data: Vec<u8>,
    cap: usize,
    full: bool,
}

impl Spill {
    fn lock(&self) -> std::sync::MutexGuard<'_, SpillState> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn arm(&self, cap: usize) {
        self.lock().cap = cap;
    }

    fn take(&self) -> (Vec<u8>, bool) {
        let mut g = self.lock();
        (std::mem::take(&mut g.data), g.full)
    }
}

impl Write for Spill {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut g = self.lock();
        let room = g.cap.saturating_sub(g.data.len());
        if buf.len() <= room {
            g.data.extend_from_slice(buf);
            return Ok(buf.len());
        }
        g.data.extend_from_slice(&buf[..room]);
        g.full = true;
        Err(io::Error::other("decoded output budget reached"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum Stage {
    Gzip(flate2::write::GzDecoder<Spill>, Spill),
    Deflate(flate2::write::ZlibDecoder<Spill>, Spill),
    Brotli(Box<brotli::DecompressorWriter<Spill>>, Spill),
}

/// Output of one stage step and whether it hit its budget.
type Step = (Vec<u8>, bool);

impl Stage {
    fn new(c: Coding) -> Option<Self> {
        let out = Spill::default();
        match c {
            Coding::Identity => None,
            Coding::Gzip => Some(Self::Gzip(
                flate2::write::GzDecoder::new(out.clone()),
                out,
            )),
            Coding::Deflate => Some(Self::Deflate(
                flate2::write::ZlibDecoder::new(out.clone()),
                out,
            )),
            Coding::Brotli => Some(Self::Brotli(
                Box::new(brotli::DecompressorWriter::new(out.clone(), 8 * 1024)),
                out,
            )),
        }
    }

    fn spill(&self) -> &Spill {
        match self {
            Self::Gzip(_, out) | Self::Deflate(_, out) | Self::Brotli(_, out) => out,
        }
    }

    fn collect(&self, r: io::Result<()>) -> io::Result<Step> {
        let (data, full) = self.spill().take();
        match r {
            Ok(()) => Ok((data, false)),
            Err(_) if full => Ok((data, true)),
            Err(e) => Err(e),
        }
    }

    fn push(&mut self, input: &[u8], cap: usize) -> io::Result<Step> {
        self.spill().arm(cap);
        let r = match self {
            Self::Gzip(d, _) => d.write_all(input),
            Self::Deflate(d, _) => d.write_all(input),
            Self::Brotli(d, _) => d.write_all(input),
        };
        self.collect(r)
    }

    fn finish(&mut self, cap: usize) -> io::Result<Step> {
        self.spill().arm(cap);
        let r = match self {
            Self::Gzip(d, _) => d.try_finish(),
            Self::Deflate(d, _) => d.try_finish(),
            // `close` fails on a stream that ends before its last meta-block.
            Self::Brotli(d, _) => d.close(),
        };
        self.collect(r)
    }
}

/// A chain of decoders applied in sequence.
///
/// Every call takes an output budget. Decoding stops once a stage would produce more than its
/// budget, so memory tracks the budget rather than the compression ratio.
pub struct BodyDecoder {
    stages: Vec<Stage>,
    capped: bool,
}

impl BodyDecoder {
    pub fn new(order: &[Coding]) -> Self {
        Self {
            stages: order.iter().filter_map(|c| Stage::new(*c)).collect(),
            capped: false,
        }
    }

    pub fn from_header(header: Option<&str>) -> Result<Self> {
        Ok(Self::new(&decode_order(header)?))
    }

    pub fn is_identity(&self) -> bool {
        self.stages.is_empty()
    }

    /// Whether a stage ran out of budget. The decoder produces nothing after that.
    pub fn capped(&self) -> bool {
        self.capped
    }

    fn stage_cap(&self, i: usize, limit: usize) -> usize {
        if i + 1 == self.stages.len() {
            limit
        } else {
            limit.saturating_add(INNER_STAGE_SLACK)
        }
    }

    /// Feed raw bytes; returns at most `limit` bytes of plaintext.
    pub fn push(&mut self, chunk: &[u8], limit: usize) -> Result<Vec<u8>> {
        if self.capped {
            return Ok(Vec::new());
        }
        if self.stages.is_empty() {
            let take = chunk.len().min(limit);
            self.capped = take < chunk.len();
            return Ok(chunk[..take].to_vec());
        }
        let mut data = chunk.to_vec();
        for i in 0..self.stages.len() {
            if data.is_empty() {
                break;
            }
            let cap = self.stage_cap(i, limit);
            let (out, full) = self.stages[i].push(&data, cap).map_err(corrupt)?;
            self.capped |= full;
            data = out;
        }
        Ok(data)
    }

    /// Signal end of input; returns at most `limit` bytes of trailing plaintext.
    pub fn finish(&mut self, limit: usize) -> Result<Vec<u8>> {
        if self.capped {
            return Ok(Vec::new());
        }
        let mut carry: Vec<u8> = Vec::new();
        for i in 0..self.stages.len() {
            let cap = self.stage_cap(i, limit);
            let mut produced = Vec::new();
            if !carry.is_empty() {
                let (out, full) = self.stages[i].push(&carry, cap).map_err(corrupt)?;
                self.capped |= full;
                produced = out;
            }
            // A capped chain is cut short, so later stages must not treat its end as complete.
            if !self.capped {
                let room = cap.saturating_sub(produced.len());
                let (out, full) = self.stages[i].finish(room).map_err(corrupt)?;
                self.capped |= full;
                produced.extend(out);
            }
            carry = produced;
        }
        Ok(carry)
    }
}

fn corrupt(e: io::Error) -> Error {
    Error::fetch(format!("corrupt encoded body: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::{GzEncoder, ZlibEncoder};
    use flate2::Compression;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut e = GzEncoder::new(Vec::new(), Compression::default());
        e.write_all(data).unwrap();
        e.finish().unwrap()
    }

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut e = ZlibEncoder::new(Vec::new(), Compression::default());
        e.write_all(data).unwrap();
        e.finish().unwrap()
    }

    fn br(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut w = brotli::CompressorWriter::new(&mut out, 4096, 5, 22);
            w.write_all(data).unwrap();
        }
        out
    }

    fn drain(dec: &mut BodyDecoder, body: &[u8], chunk: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for c in body.chunks(chunk) {
            out.extend(dec.push(c, usize::MAX).unwrap());
        }
        out.extend(dec.finish(usize::MAX).unwrap());
        out
    }

    #[test]
    fn order_is_reverse_of_header_and_skips_identity() {
        assert_eq!(
            decode_order(Some("gzip, identity, br")).unwrap(),
            vec![Coding::Brotli, Coding::Gzip]
        );
        assert!(decode_order(None).unwrap().is_empty());
        assert!(matches!(
            decode_order(Some("compress")),
            Err(Error::UnsupportedContent(_))
        ));
    }

    #[test]
    fn gzip_and_deflate_decode_across_small_chunks() {
        let text = "hello world ".repeat(500);
        let mut d = BodyDecoder::from_header(Some("gzip")).unwrap();
        assert_eq!(drain(&mut d, &gzip(text.as_bytes()), 7), text.as_bytes());
        let mut d = BodyDecoder::from_header(Some("deflate")).unwrap();
        assert_eq!(drain(&mut d, &zlib(text.as_bytes()), 13), text.as_bytes());
    }

    #[test]
    fn brotli_decodes() {
        let text = "brotli body ".repeat(300);
        let mut d = BodyDecoder::from_header(Some("br")).unwrap();
        assert_eq!(drain(&mut d, &br(text.as_bytes()), 64), text.as_bytes());
    }

    #[test]
    fn stacked_codings_are_undone_last_first() {
        let text = b"stacked payload";
        // Header "gzip, br": gzip applied first, then brotli.
        let body = br(&gzip(text));
        let mut d = BodyDecoder::from_header(Some("gzip, br")).unwrap();
        assert_eq!(drain(&mut d, &body, 5), text);
    }

    #[test]
    fn identity_passes_bytes_through() {
        let mut d = BodyDecoder::from_header(Some("identity")).unwrap();
        assert!(d.is_identity());
        assert_eq!(d.push(b"abc", 8).unwrap(), b"abc");
        assert!(d.finish(8).unwrap().is_empty());
        assert_eq!(d.push(b"defghijk", 2).unwrap(), b"de");
        assert!(d.capped());
    }

    #[test]
    fn corrupt_gzip_is_a_fetch_error() {
        let mut d = BodyDecoder::from_header(Some("gzip")).unwrap();
        let r = d.push(b"\x1f\x8b\x08\x00garbage-garbage-garbage", usize::MAX).and_then(|_| d.finish(usize::MAX));
        assert!(matches!(r, Err(Error::Fetch { .. })));
    }

    #[test]
    fn truncated_brotli_is_a_fetch_error() {
        let body = br("a brotli body that gets cut short ".repeat(200).as_bytes());
        let mut d = BodyDecoder::from_header(Some("br")).unwrap();
        let r = d
            .push(&body[..body.len() / 2], usize::MAX)
            .and_then(|_| d.finish(usize::MAX));
        assert!(matches!(r, Err(Error::Fetch { .. })), "{r:?}");
    }

    fn repeated(byte: u8, total: usize, mut sink: impl Write) {
        let block = vec![byte; 64 * 1024];
        for _ in 0..total / block.len() {
            sink.write_all(&block).unwrap();
        }
    }

    #[test]
    fn highly_compressed_bodies_stop_at_the_limit() {
        let mut gz = GzEncoder::new(Vec::new(), Compression::best());
        repeated(b'a', 16 << 20, &mut gz);
        let gz = gz.finish().unwrap();

        let mut d = BodyDecoder::from_header(Some("gzip")).unwrap();
        let out = d.push(&gz, 1024).unwrap();
        assert_eq!(out.len(), 1024);
        assert!(d.capped());
        assert!(d.push(&gz, 1024).unwrap().is_empty());
        assert!(d.finish(1024).unwrap().is_empty());

        let mut brotli_body = Vec::new();
        {
            let mut w = brotli::CompressorWriter::new(&mut brotli_body, 4096, 5, 20);
            repeated(b'a', 16 << 20, &mut w);
        }
        let mut d = BodyDecoder::from_header(Some("br")).unwrap();
        let out = d.push(&brotli_body, 1024).unwrap();
        assert_eq!(out.len(), 1024);
        assert!(d.capped());
    }

    #[test]
    fn stacked_chain_respects_the_limit() {
        let text = "stacked ".repeat(10_000);
        let body = br(&gzip(text.as_bytes()));
        let mut d = BodyDecoder::from_header(Some("gzip, br")).unwrap();
        let mut out = Vec::new();
        for c in body.chunks(512) {
            let room = 100 - out.len();
            out.extend(d.push(c, room).unwrap());
            if d.capped() {
                break;
            }
        }
        assert_eq!(out, text.as_bytes()[..100].to_vec());
        assert!(d.capped());
    }
}
