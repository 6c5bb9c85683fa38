//! Magic-number detection and header-only image dimension parsing.
//!
//! Both functions work on a prefix of the file. 64 KiB is enough for every
//! format handled here, including JPEG files with large EXIF blocks in most
//! cases.

use crate::{Format, Resolution, by_extension};

/// Number of leading bytes callers should read before sniffing.
pub const SNIFF_LEN: usize = 64 * 1024;

fn fmt(ext: &str) -> Option<&'static Format> {
    by_extension(ext)
}

fn starts(header: &[u8], at: usize, magic: &[u8]) -> bool {
    header.get(at..at + magic.len()) == Some(magic)
}

/// Detect a format from the leading bytes of a file.
///
/// Container formats that cannot be told apart from their bytes alone
/// (zip-based office files, OLE compound documents) resolve to the generic
/// container; callers may refine the result with the declared extension.
pub fn sniff(header: &[u8]) -> Option<&'static Format> {
    if header.len() < 4 {
        return None;
    }

    // EBML: Matroska and WebM share the header and differ in DocType.
    if starts(header, 0, &[0x1A, 0x45, 0xDF, 0xA3]) {
        let probe = &header[..header.len().min(64)];
        if probe.windows(4).any(|w| w == b"webm") {
            return fmt("webm");
        }
        return fmt("mkv");
    }

    // ISO base media: size box followed by `ftyp` and a major brand.
    if starts(header, 4, b"ftyp") {
        let brand = header.get(8..12).unwrap_or_default();
        return match brand {
            b"qt  " => fmt("mov"),
            b"M4A " | b"M4B " => fmt("m4a"),
            b"M4V " | b"M4VH" | b"M4VP" => fmt("m4v"),
            b if b.starts_with(b"3g") => fmt("3gp"),
            _ => fmt("mp4"),
        };
    }

    if starts(header, 0, b"RIFF") {
        return match header.get(8..12) {
            Some(b"AVI ") => fmt("avi"),
            Some(b"WAVE") => fmt("wav"),
            Some(b"WEBP") => fmt("webp"),
            _ => None,
        };
    }

    if starts(header, 0, b"FLV\x01") {
        return fmt("flv");
    }
    if starts(header, 0, &[0x30, 0x26, 0xB2, 0x75, 0x8E, 0x66, 0xCF, 0x11]) {
        return fmt("wmv");
    }
    if header[0] == 0x47 && header.get(188) == Some(&0x47) {
        return fmt("ts");
    }
    if starts(header, 0, &[0x00, 0x00, 0x01, 0xBA]) {
        return fmt("mpg");
    }

    if starts(header, 0, b"fLaC") {
        return fmt("flac");
    }
    if starts(header, 0, b"OggS") {
        let probe = &header[..header.len().min(64)];
        if probe.windows(8).any(|w| w == b"OpusHead") {
            return fmt("opus");
        }
        return fmt("ogg");
    }
    if starts(header, 0, b"ID3") {
        return fmt("mp3");
    }
    if header[0] == 0xFF && header[1] & 0xE0 == 0xE0 {
        // ADTS has layer bits 00, MPEG audio frames never do.
        if header[1] & 0x06 == 0 {
            return fmt("aac");
        }
        if header[1] & 0xFE != 0xFE {
            return fmt("mp3");
        }
    }

    if starts(header, 0, &[0xFF, 0xD8, 0xFF]) {
        return fmt("jpg");
    }
    if starts(header, 0, &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        return fmt("png");
    }
    if starts(header, 0, b"GIF87a") || starts(header, 0, b"GIF89a") {
        return fmt("gif");
    }
    if starts(header, 0, b"BM") && header.len() >= 26 {
        return fmt("bmp");
    }
    if starts(header, 0, b"II*\0") || starts(header, 0, b"MM\0*") {
        return fmt("tiff");
    }

    if starts(header, 0, b"%PDF-") {
        return fmt("pdf");
    }
    if starts(header, 0, b"{\\rtf") {
        return fmt("rtf");
    }
    if starts(header, 0, b"PK\x03\x04") {
        return fmt("zip");
    }
    if starts(header, 0, b"Rar!\x1A\x07") {
        return fmt("rar");
    }
    if starts(header, 0, &[b'7', b'z', 0xBC, 0xAF, 0x27, 0x1C]) {
        return fmt("7z");
    }
    if starts(header, 0, &[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1]) {
        return fmt("doc");
    }

    None
}

/// True for generic containers whose concrete type is better taken from a
/// declared extension of the same kind (e.g. `docx` over `zip`).
pub fn is_generic_container(format: &Format) -> bool {
    matches!(format.ext, "zip" | "doc")
}

fn be16(b: &[u8], at: usize) -> Option<u32> {
    let s = b.get(at..at + 2)?;
    Some(u32::from(u16::from_be_bytes([s[0], s[1]])))
}

fn le16(b: &[u8], at: usize) -> Option<u32> {
    let s = b.get(at..at + 2)?;
    Some(u32::from(u16::from_le_bytes([s[0], s[1]])))
}

fn be32(b: &[u8], at: usize) -> Option<u32> {
    let s = b.get(at..at + 4)?;
    Some(u32::from_be_bytes([s[0], s[1], s[2], s[3]]))
}

fn le24(b: &[u8], at: usize) -> Option<u32> {
    let s = b.get(at..at + 3)?;
    Some(u32::from(s[0]) | u32::from(s[1]) << 8 | u32::from(s[2]) << 16)
}

fn le_i32(b: &[u8], at: usize) -> Option<i32> {
    let s = b.get(at..at + 4)?;
    Some(i32::from_le_bytes([s[0], s[1], s[2], s[3]]))
}

/// Read image dimensions from the header bytes of a PNG, GIF, BMP, WebP or
/// JPEG file.
pub fn image_dimensions(header: &[u8]) -> Option<Resolution> {
    if starts(header, 0, &[0x89, b'P', b'N', b'G']) && starts(header, 12, b"IHDR") {
        return Resolution::non_zero(be32(header, 16)?, be32(header, 20)?);
    }
    if starts(header, 0, b"GIF8") {
        return Resolution::non_zero(le16(header, 6)?, le16(header, 8)?);
    }
    if starts(header, 0, b"BM") {
        let w = le_i32(header, 18)?;
        let h = le_i32(header, 22)?;
        return Resolution::non_zero(w.unsigned_abs(), h.unsigned_abs());
    }
    if starts(header, 0, b"RIFF") && starts(header, 8, b"WEBP") {
        return webp_dimensions(header);
    }
    if starts(header, 0, &[0xFF, 0xD8]) {
        return jpeg_dimensions(header);
    }
    None
}

fn webp_dimensions(header: &[u8]) -> Option<Resolution> {
    match header.get(12..16)? {
        b"VP8X" => Resolution::non_zero(le24(header, 24)? + 1, le24(header, 27)? + 1),
        b"VP8 " => Resolution::non_zero(le16(header, 26)? & 0x3FFF, le16(header, 28)? & 0x3FFF),
        b"VP8L" => {
            let b = header.get(21..25)?;
            let bits = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
            Resolution::non_zero((bits & 0x3FFF) + 1, ((bits >> 14) & 0x3FFF) + 1)
        }
        _ => None,
    }
}

fn jpeg_dimensions(header: &[u8]) -> Option<Resolution> {
    let mut pos = 2;
    while pos + 4 <= header.len() {
        if header[pos] != 0xFF {
            return None;
        }
        let marker = header[pos + 1];
        // Fill bytes and standalone markers carry no length.
        if marker == 0xFF {
            pos += 1;
            continue;
        }
        if marker == 0x01 || (0xD0..=0xD7).contains(&marker) {
            pos += 2;
            continue;
        }
        let len = be16(header, pos + 2)? as usize;
        let is_sof = (0xC0..=0xCF).contains(&marker) && !matches!(marker, 0xC4 | 0xC8 | 0xCC);
        if is_sof {
            let height = be16(header, pos + 5)?;
            let width = be16(header, pos + 7)?;
            return Resolution::non_zero(width, height);
        }
        if len < 2 {
            return None;
        }
        pos += 2 + len;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MediaKind;

    fn png_header(w: u32, h: u32) -> Vec<u8> {
        let mut v = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        v.extend_from_slice(&13u32.to_be_bytes());
        v.extend_from_slice(b"IHDR");
        v.extend_from_slice(&w.to_be_bytes());
        v.extend_from_slice(&h.to_be_bytes());
        v.extend_from_slice(&[8, 6, 0, 0, 0]);
        v
    }

    #[test]
    fn test_sniff_matroska_and_webm() {
        let mut mkv = vec![0x1A, 0x45, 0xDF, 0xA3, 0x9F, 0x42, 0x82, 0x88];
        mkv.extend_from_slice(b"matroska");
        assert_eq!(sniff(&mkv).map(|f| f.ext), Some("mkv"));

        let mut webm = vec![0x1A, 0x45, 0xDF, 0xA3, 0x9F, 0x42, 0x82, 0x84];
        webm.extend_from_slice(b"webm");
        assert_eq!(sniff(&webm).map(|f| f.ext), Some("webm"));
    }

    #[test]
    fn test_sniff_iso_brands() {
        let mut mp4 = vec![0, 0, 0, 0x20];
        mp4.extend_from_slice(b"ftypisom");
        assert_eq!(sniff(&mp4).map(|f| f.ext), Some("mp4"));

        let mut m4a = vec![0, 0, 0, 0x20];
        m4a.extend_from_slice(b"ftypM4A ");
        let format = sniff(&m4a).unwrap();
        assert_eq!(format.ext, "m4a");
        assert_eq!(format.kind, MediaKind::Audio);
    }

    #[test]
    fn test_sniff_audio_and_documents() {
        assert_eq!(sniff(b"ID3\x04\x00\x00\x00").map(|f| f.ext), Some("mp3"));
        assert_eq!(sniff(&[0xFF, 0xFB, 0x90, 0x64]).map(|f| f.ext), Some("mp3"));
        assert_eq!(sniff(&[0xFF, 0xF1, 0x50, 0x80]).map(|f| f.ext), Some("aac"));
        assert_eq!(sniff(b"fLaC\0\0\0\x22").map(|f| f.ext), Some("flac"));
        assert_eq!(sniff(b"%PDF-1.7\n").map(|f| f.ext), Some("pdf"));
        assert_eq!(sniff(b"plain text content").map(|f| f.ext), None);
    }

    #[test]
    fn test_sniff_rejects_short_input() {
        assert!(sniff(b"ID").is_none());
        assert!(sniff(&[]).is_none());
    }

    #[test]
    fn test_sniff_jpeg_not_mistaken_for_mp3() {
        assert_eq!(sniff(&[0xFF, 0xD8, 0xFF, 0xE0, 0, 0x10]).map(|f| f.ext), Some("jpg"));
    }

    #[test]
    fn test_png_dimensions() {
        assert_eq!(
            image_dimensions(&png_header(640, 480)),
            Some(Resolution::new(640, 480))
        );
    }

    #[test]
    fn test_gif_dimensions() {
        let mut gif = b"GIF89a".to_vec();
        gif.extend_from_slice(&320u16.to_le_bytes());
        gif.extend_from_slice(&200u16.to_le_bytes());
        assert_eq!(image_dimensions(&gif), Some(Resolution::new(320, 200)));
    }

    #[test]
    fn test_jpeg_dimensions_skip_app_segments() {
        let mut jpg = vec![0xFF, 0xD8];
        // APP0 with a 16 byte payload
        jpg.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x10]);
        jpg.extend_from_slice(&[0u8; 14]);
        // SOF0: length, precision, height, width
        jpg.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x11, 0x08]);
        jpg.extend_from_slice(&720u16.to_be_bytes());
        jpg.extend_from_slice(&1280u16.to_be_bytes());
        jpg.extend_from_slice(&[0u8; 10]);
        assert_eq!(image_dimensions(&jpg), Some(Resolution::new(1280, 720)));
    }

    #[test]
    fn test_truncated_headers_yield_none() {
        assert_eq!(image_dimensions(&png_header(10, 10)[..18]), None);
        assert_eq!(image_dimensions(&[0xFF, 0xD8, 0xFF]), None);
    }
}
