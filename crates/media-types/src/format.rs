use crate::MediaKind;

/// A known container or file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Format {
    /// Canonical extension, lowercase, without the dot.
    pub ext: &'static str,
    pub mime: &'static str,
    pub kind: MediaKind,
}

const fn f(ext: &'static str, mime: &'static str, kind: MediaKind) -> Format {
    Format { ext, mime, kind }
}

/// Known formats. The first entry for a MIME type is its canonical extension.
pub const FORMATS: &[Format] = &[
    // video
    f("mp4", "video/mp4", MediaKind::Video),
    f("mkv", "video/x-matroska", MediaKind::Video),
    f("webm", "video/webm", MediaKind::Video),
    f("avi", "video/x-msvideo", MediaKind::Video),
    f("mov", "video/quicktime", MediaKind::Video),
    f("flv", "video/x-flv", MediaKind::Video),
    f("wmv", "video/x-ms-wmv", MediaKind::Video),
    f("m4v", "video/x-m4v", MediaKind::Video),
    f("3gp", "video/3gpp", MediaKind::Video),
    f("ts", "video/mp2t", MediaKind::Video),
    f("mpg", "video/mpeg", MediaKind::Video),
    // audio
    f("mp3", "audio/mpeg", MediaKind::Audio),
    f("flac", "audio/flac", MediaKind::Audio),
    f("wav", "audio/wav", MediaKind::Audio),
    f("ogg", "audio/ogg", MediaKind::Audio),
    f("opus", "audio/opus", MediaKind::Audio),
    f("m4a", "audio/mp4", MediaKind::Audio),
    f("aac", "audio/aac", MediaKind::Audio),
    f("wma", "audio/x-ms-wma", MediaKind::Audio),
    // image
    f("jpg", "image/jpeg", MediaKind::Image),
    f("jpeg", "image/jpeg", MediaKind::Image),
    f("png", "image/png", MediaKind::Image),
    f("gif", "image/gif", MediaKind::Image),
    f("webp", "image/webp", MediaKind::Image),
    f("bmp", "image/bmp", MediaKind::Image),
    f("tiff", "image/tiff", MediaKind::Image),
    f("tif", "image/tiff", MediaKind::Image),
    f("svg", "image/svg+xml", MediaKind::Image),
    // documents and archives
    f("pdf", "application/pdf", MediaKind::Document),
    f("doc", "application/msword", MediaKind::Document),
    f(
        "docx",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        MediaKind::Document,
    ),
    f("xls", "application/vnd.ms-excel", MediaKind::Document),
    f(
        "xlsx",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        MediaKind::Document,
    ),
    f("ppt", "application/vnd.ms-powerpoint", MediaKind::Document),
    f(
        "pptx",
        "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        MediaKind::Document,
    ),
    f("odt", "application/vnd.oasis.opendocument.text", MediaKind::Document),
    f("epub", "application/epub+zip", MediaKind::Document),
    f("rtf", "application/rtf", MediaKind::Document),
    f("txt", "text/plain", MediaKind::Document),
    f("csv", "text/csv", MediaKind::Document),
    f("json", "application/json", MediaKind::Document),
    f("zip", "application/zip", MediaKind::Document),
    f("rar", "application/vnd.rar", MediaKind::Document),
    f("7z", "application/x-7z-compressed", MediaKind::Document),
];

/// Look a format up by extension. Case-insensitive, a leading dot is ignored.
pub fn by_extension(ext: &str) -> Option<&'static Format> {
    let ext = ext.trim_start_matches('.');
    FORMATS.iter().find(|f| f.ext.eq_ignore_ascii_case(ext))
}

/// Look a format up by MIME type, ignoring parameters such as `; charset=`.
pub fn by_mime(mime: &str) -> Option<&'static Format> {
    let essence = mime.split(';').next().unwrap_or_default().trim();
    FORMATS.iter().find(|f| f.mime.eq_ignore_ascii_case(essence))
}

pub fn is_known_extension(ext: &str) -> bool {
    by_extension(ext).is_some()
}

/// Extension of a file name, without the dot. Dotfiles have no extension.
pub fn extension_of(name: &str) -> Option<&str> {
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || ext.contains(['/', '\\']) {
        return None;
    }
    Some(ext)
}
