use std::path::Path;

use crate::normalizer::TabularFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Csv,
    Xlsx,
    Pdf,
    Jpeg,
    Png,
    Webp,
    Heic,
}

impl FileFormat {
    pub fn from_file_name(name: &str) -> Option<Self> {
        let ext = Path::new(name).extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "csv" | "txt" => Some(Self::Csv),
            "xlsx" | "xls" | "xlsm" | "ods" => Some(Self::Xlsx),
            "pdf" => Some(Self::Pdf),
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "webp" => Some(Self::Webp),
            "heic" | "heif" => Some(Self::Heic),
            _ => None,
        }
    }

    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(b"%PDF") {
            Some(Self::Pdf)
        } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(Self::Jpeg)
        } else if bytes.starts_with(b"\x89PNG") {
            Some(Self::Png)
        } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
            Some(Self::Webp)
        } else if bytes.len() >= 12 && &bytes[4..8] == b"ftyp" && matches!(&bytes[8..12], b"heic" | b"heix" | b"mif1") {
            Some(Self::Heic)
        } else if bytes.starts_with(b"PK\x03\x04") || bytes.starts_with(&[0xD0, 0xCF, 0x11, 0xE0]) {
            Some(Self::Xlsx)
        } else {
            None
        }
    }

    /// Magic bytes beat the file extension; text files fall back to it.
    pub fn detect(file_name: &str, bytes: &[u8]) -> Option<Self> {
        Self::sniff(bytes).or_else(|| Self::from_file_name(file_name))
    }

    pub fn media_type(&self) -> &'static str {
        match self {
            Self::Csv => "text/csv",
            Self::Xlsx => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            Self::Pdf => "application/pdf",
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Webp => "image/webp",
            Self::Heic => "image/heic",
        }
    }

    pub fn tabular(&self) -> Option<TabularFormat> {
        match self {
            Self::Csv => Some(TabularFormat::Csv),
            Self::Xlsx => Some(TabularFormat::Xlsx),
            _ => None,
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, Self::Jpeg | Self::Png | Self::Webp | Self::Heic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_and_magic() {
        assert_eq!(FileFormat::from_file_name("Jan.CSV"), Some(FileFormat::Csv));
        assert_eq!(FileFormat::from_file_name("scan"), None);
        assert_eq!(FileFormat::sniff(b"%PDF-1.7"), Some(FileFormat::Pdf));
        assert_eq!(FileFormat::detect("receipt.pdf", &[0xFF, 0xD8, 0xFF, 0xE0]), Some(FileFormat::Jpeg));
        assert_eq!(FileFormat::detect("jan.csv", b"Date,Amount"), Some(FileFormat::Csv));
        assert_eq!(FileFormat::detect("notes.docx.bin", b"hello"), None);
    }

    #[test]
    fn test_kinds() {
        assert!(FileFormat::Heic.is_image());
        assert_eq!(FileFormat::Xlsx.tabular(), Some(TabularFormat::Xlsx));
        assert_eq!(FileFormat::Pdf.media_type(), "application/pdf");
    }
}
