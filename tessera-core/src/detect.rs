//! Input kind detection: content sniff first, extension second.

use std::{
    fmt,
    fs::File,
    io::{self, Read},
    path::Path,
};

use serde::{Deserialize, Serialize};

/// Discriminator the registry resolves components by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    Pdf,
    Image,
    Docx,
    Pptx,
    Xlsx,
    Epub,
    Html,
    Markdown,
    Text,
    /// Provider-neutral intermediate form serialized as JSON.
    LayoutJson,
    /// Anything else, carrying the lowercased extension.
    Unknown(String),
}

impl fmt::Display for InputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputKind::Pdf => f.write_str("pdf"),
            InputKind::Image => f.write_str("image"),
            InputKind::Docx => f.write_str("docx"),
            InputKind::Pptx => f.write_str("pptx"),
            InputKind::Xlsx => f.write_str("xlsx"),
            InputKind::Epub => f.write_str("epub"),
            InputKind::Html => f.write_str("html"),
            InputKind::Markdown => f.write_str("markdown"),
            InputKind::Text => f.write_str("text"),
            InputKind::LayoutJson => f.write_str("layout_json"),
            InputKind::Unknown(ext) if ext.is_empty() => f.write_str("unknown"),
            InputKind::Unknown(ext) => write!(f, "unknown (.{ext})"),
        }
    }
}

const PDF_MAGIC: &[u8] = b"%PDF-";
const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";
const JPEG_MAGIC: &[u8] = b"\xff\xd8\xff";
const GIF_MAGIC: &[u8] = b"GIF8";
const TIFF_LE_MAGIC: &[u8] = b"II*\0";
const TIFF_BE_MAGIC: &[u8] = b"MM\0*";
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const SNIFF_LEN: usize = 16;

/// Detects the input kind of the file at `path`.
pub fn detect_input_kind(path: &Path) -> io::Result<InputKind> {
    let mut header = Vec::with_capacity(SNIFF_LEN);
    File::open(path)?
        .take(SNIFF_LEN as u64)
        .read_to_end(&mut header)?;
    Ok(detect_from_parts(&header, extension(path).as_deref()))
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
}

/// Sniffs `header` (the first bytes of the file) and falls back to `ext`.
pub fn detect_from_parts(header: &[u8], ext: Option<&str>) -> InputKind {
    if header.starts_with(PDF_MAGIC) {
        return InputKind::Pdf;
    }
    if [PNG_MAGIC, JPEG_MAGIC, GIF_MAGIC, TIFF_LE_MAGIC, TIFF_BE_MAGIC]
        .iter()
        .any(|m| header.starts_with(m))
    {
        return InputKind::Image;
    }
    if header.starts_with(ZIP_MAGIC) {
        // office formats and epub are all zip containers
        return match ext {
            Some("docx") => InputKind::Docx,
            Some("pptx") => InputKind::Pptx,
            Some("xlsx") => InputKind::Xlsx,
            Some("epub") => InputKind::Epub,
            other => InputKind::Unknown(other.unwrap_or_default().to_owned()),
        };
    }
    from_extension(ext.unwrap_or_default())
}

fn from_extension(ext: &str) -> InputKind {
    match ext {
        "pdf" => InputKind::Pdf,
        "png" | "jpg" | "jpeg" | "gif" | "tif" | "tiff" => InputKind::Image,
        "docx" => InputKind::Docx,
        "pptx" => InputKind::Pptx,
        "xlsx" => InputKind::Xlsx,
        "epub" => InputKind::Epub,
        "html" | "htm" => InputKind::Html,
        "md" | "markdown" => InputKind::Markdown,
        "txt" | "text" => InputKind::Text,
        "json" => InputKind::LayoutJson,
        other => InputKind::Unknown(other.to_owned()),
    }
}

/// Mime type of an image file from its magic bytes.
pub fn image_mime(header: &[u8]) -> Option<&'static str> {
    if header.starts_with(PNG_MAGIC) {
        Some("image/png")
    } else if header.starts_with(JPEG_MAGIC) {
        Some("image/jpeg")
    } else if header.starts_with(GIF_MAGIC) {
        Some("image/gif")
    } else if header.starts_with(TIFF_LE_MAGIC) || header.starts_with(TIFF_BE_MAGIC) {
        Some("image/tiff")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn content_wins_over_extension() {
        assert_eq!(detect_from_parts(b"%PDF-1.7\n", Some("txt")), InputKind::Pdf);
        assert_eq!(
            detect_from_parts(b"\x89PNG\r\n\x1a\n0000", Some("pdf")),
            InputKind::Image
        );
    }

    #[test]
    fn zip_containers_use_extension() {
        assert_eq!(detect_from_parts(b"PK\x03\x04....", Some("docx")), InputKind::Docx);
        assert_eq!(detect_from_parts(b"PK\x03\x04....", Some("epub")), InputKind::Epub);
        assert_eq!(
            detect_from_parts(b"PK\x03\x04....", Some("zip")),
            InputKind::Unknown("zip".into())
        );
    }

    #[test]
    fn falls_back_to_extension() {
        assert_eq!(detect_from_parts(b"# Title", Some("md")), InputKind::Markdown);
        assert_eq!(detect_from_parts(b"{\"pages\"", Some("json")), InputKind::LayoutJson);
        assert_eq!(detect_from_parts(b"hello", None), InputKind::Unknown(String::new()));
        assert_eq!(
            detect_from_parts(b"hello", Some("xyz")),
            InputKind::Unknown("xyz".into())
        );
    }

    #[test]
    fn detects_from_file() -> anyhow::Result<()> {
        let mut file = tempfile::Builder::new().suffix(".TXT").tempfile()?;
        writeln!(file, "plain text")?;
        assert_eq!(detect_input_kind(file.path())?, InputKind::Text);
        Ok(())
    }
}
