//! Byte-level sniffing: binary signatures and character-set detection.

use encoding_rs::{Encoding, UTF_8};

#[derive(Debug, Clone, Copy)]
pub struct Signature {
    pub name: &'static str,
    pub offset: usize,
    pub magic: &'static [u8],
}

const fn sig(name: &'static str, offset: usize, magic: &'static [u8]) -> Signature {
    Signature {
        name,
        offset,
        magic,
    }
}

/// Known binary formats, matched against the start of the decoded stream.
pub const BINARY_SIGNATURES: &[Signature] = &[
    // images
    sig("png", 0, b"\x89PNG\r\n\x1a\n"),
    sig("jpeg", 0, b"\xff\xd8\xff"),
    sig("gif", 0, b"GIF87a"),
    sig("gif", 0, b"GIF89a"),
    sig("webp", 8, b"WEBP"),
    sig("riff", 0, b"RIFF"),
    sig("tiff", 0, b"II*\x00"),
    sig("tiff", 0, b"MM\x00*"),
    sig("ico", 0, b"\x00\x00\x01\x00"),
    // documents / archives
    sig("pdf", 0, b"%PDF-"),
    sig("zip", 0, b"PK\x03\x04"),
    sig("zip", 0, b"PK\x05\x06"),
    sig("gzip", 0, b"\x1f\x8b\x08"),
    sig("7z", 0, b"7z\xbc\xaf\x27\x1c"),
    sig("rar", 0, b"Rar!\x1a\x07"),
    sig("xz", 0, b"\xfd7zXZ\x00"),
    sig("zstd", 0, b"\x28\xb5\x2f\xfd"),
    sig("bzip2", 0, b"BZh9"),
    // executables
    sig("elf", 0, b"\x7fELF"),
    sig("pe", 0, b"MZ\x90\x00"),
    sig("mach-o", 0, b"\xcf\xfa\xed\xfe"),
    sig("mach-o", 0, b"\xfe\xed\xfa\xcf"),
    sig("java-class", 0, b"\xca\xfe\xba\xbe"),
    sig("wasm", 0, b"\x00asm"),
    // fonts
    sig("woff", 0, b"wOFF"),
    sig("woff2", 0, b"wOF2"),
    sig("ttf", 0, b"\x00\x01\x00\x00\x00"),
    sig("otf", 0, b"OTTO"),
    // databases
    sig("sqlite", 0, b"SQLite format 3\x00"),
    // media
    sig("mp4", 4, b"ftyp"),
    sig("ogg", 0, b"OggS"),
    sig("flac", 0, b"fLaC"),
    sig("mp3", 0, b"ID3\x03"),
    sig("mp3", 0, b"ID3\x04"),
];

/// Name of the binary format `bytes` starts with, if any.
pub fn detect_binary(bytes: &[u8]) -> Option<&'static str> {
    BINARY_SIGNATURES
        .iter()
        .find(|s| {
            bytes.len() >= s.offset + s.magic.len()
                && &bytes[s.offset..s.offset + s.magic.len()] == s.magic
        })
        .map(|s| s.name)
}

/// Longest stream prefix any signature needs.
pub const SIGNATURE_WINDOW: usize = 32;

/// Binary check for one decoded chunk, given the stream bytes that came before it.
///
/// Signatures only count at the start of the stream, since later chunk boundaries are
/// arbitrary. NUL bytes count anywhere unless the stream is UTF-16.
pub fn sniff_chunk(prior: &[u8], chunk: &[u8], utf16: bool) -> Option<&'static str> {
    if prior.len() < SIGNATURE_WINDOW {
        let mut head = prior.to_vec();
        head.extend_from_slice(&chunk[..chunk.len().min(SIGNATURE_WINDOW)]);
        if let Some(name) = detect_binary(&head) {
            return Some(name);
        }
    }
    if !utf16 && chunk.contains(&0) {
        return Some("nul-bytes");
    }
    None
}

pub fn is_utf16_label(label: &str) -> bool {
    label.to_ascii_lowercase().starts_with("utf-16")
}

/// Whether a declared media type is one we convert to text.
pub fn is_textual_media_type(media_type: &str) -> bool {
    let mt = media_type.trim().to_ascii_lowercase();
    mt.starts_with("text/")
        || mt.ends_with("+xml")
        || mt.ends_with("+json")
        || matches!(
            mt.as_str(),
            "application/xhtml+xml"
                | "application/xml"
                | "application/json"
                | "application/javascript"
                | "application/x-javascript"
                | "application/ecmascript"
                | "application/rss+xml"
                | "application/atom+xml"
        )
}

/// Split a Content-Type header into (media type, charset parameter).
pub fn parse_content_type(header: &str) -> (String, Option<String>) {
    let mut parts = header.split(';');
    let media_type = parts.next().unwrap_or("").trim().to_ascii_lowercase();
    let mut charset = None;
    for part in parts {
        if let Some((k, v)) = part.trim().split_once('=') {
            if k.trim().eq_ignore_ascii_case("charset") {
                let v = v.trim().trim_matches('"').trim_matches('\'');
                if !v.is_empty() {
                    charset = Some(v.to_ascii_lowercase());
                }
            }
        }
    }
    (media_type, charset)
}

pub fn bom_label(bytes: &[u8]) -> Option<&'static str> {
    Encoding::for_bom(bytes).map(|(enc, _)| canonical(enc))
}

/// Find `<meta charset=...>` or an http-equiv `content="...; charset=..."` in the first KiB.
pub fn sniff_meta_charset(bytes: &[u8]) -> Option<String> {
    let head = &bytes[..bytes.len().min(1024)];
    let lower = String::from_utf8_lossy(head).to_ascii_lowercase();
    let mut from = 0;
    while let Some(rel) = lower[from..].find("<meta") {
        let start = from + rel;
        let end = lower[start..].find('>').map_or(lower.len(), |e| start + e);
        let tag = &lower[start..end];
        if let Some(idx) = tag.find("charset=") {
            let value: String = tag[idx + 8..]
                .trim_start_matches(['"', '\''])
                .chars()
                .take_while(|c| !c.is_whitespace() && !matches!(c, '"' | '\'' | ';' | '/' | '>'))
                .collect();
            if !value.is_empty() {
                return Some(value);
            }
        }
        from = end;
    }
    None
}

fn canonical(enc: &'static Encoding) -> &'static str {
    match enc.name() {
        "UTF-8" => "utf-8",
        "UTF-16LE" => "utf-16le",
        "UTF-16BE" => "utf-16be",
        _ => "",
    }
}

/// Resolve the label used to decode a body: transport header, then BOM, then HTML meta,
/// then UTF-8. Unknown labels fall through to the next source.
pub fn resolve_encoding_label(header_charset: Option<&str>, body: &[u8]) -> String {
    if let Some(enc) = header_charset.and_then(|c| Encoding::for_label(c.as_bytes())) {
        return enc.name().to_ascii_lowercase();
    }
    if let Some(l) = bom_label(body) {
        return l.to_string();
    }
    if let Some(enc) = sniff_meta_charset(body).and_then(|c| Encoding::for_label(c.as_bytes())) {
        return enc.name().to_ascii_lowercase();
    }
    "utf-8".to_string()
}

/// Decode with replacement characters for malformed input; never fails.
pub fn decode_text(bytes: &[u8], label: &str) -> String {
    let enc = Encoding::for_label(label.as_bytes()).unwrap_or(UTF_8);
    let (text, _had_errors) = enc.decode_with_bom_removal(bytes);
    text.into_owned()
}
