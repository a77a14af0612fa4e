use crate::error::ExtractionError;
use crate::models::FileType;
use lopdf::Document;
use serde::{Deserialize, Serialize};
use std::path::Path;

const PDF_MAGIC: &[u8] = b"%PDF-";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageText {
    pub number: u32,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedDocument {
    pub file_type: FileType,
    pub pages: Vec<PageText>,
}

impl ExtractedDocument {
    pub fn page_count(&self) -> u32 {
        self.pages.len() as u32
    }
}

pub trait DocumentExtractor {
    fn extract_pages(&self, bytes: &[u8]) -> Result<Vec<PageText>, ExtractionError>;
}

#[derive(Default)]
pub struct LopdfExtractor;

impl DocumentExtractor for LopdfExtractor {
    fn extract_pages(&self, bytes: &[u8]) -> Result<Vec<PageText>, ExtractionError> {
        let document =
            Document::load_mem(bytes).map_err(|error| ExtractionError::PdfParse(error.to_string()))?;

        let mut pages = Vec::new();
        for (page_no, _page_id) in document.get_pages() {
            let text = document
                .extract_text(&[page_no])
                .map_err(|error| ExtractionError::PdfParse(error.to_string()))?;

            if !text.trim().is_empty() {
                pages.push(PageText {
                    number: page_no,
                    text,
                });
            }
        }

        if pages.is_empty() {
            return Err(ExtractionError::Empty("pdf had no readable page text".to_string()));
        }

        Ok(pages)
    }
}

/// UTF-8 text; form feeds separate pages.
#[derive(Default)]
pub struct PlainTextExtractor;

impl DocumentExtractor for PlainTextExtractor {
    fn extract_pages(&self, bytes: &[u8]) -> Result<Vec<PageText>, ExtractionError> {
        let text = std::str::from_utf8(bytes).map_err(|_| ExtractionError::InvalidEncoding)?;
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);

        let pages = text
            .split('\u{000c}')
            .enumerate()
            .filter_map(|(index, page)| {
                if page.trim().is_empty() {
                    None
                } else {
                    Some(PageText {
                        number: (index + 1) as u32,
                        text: page.to_string(),
                    })
                }
            })
            .collect::<Vec<_>>();

        if pages.is_empty() {
            return Err(ExtractionError::Empty("text document is blank".to_string()));
        }

        Ok(pages)
    }
}

/// Resolves the file type from the declared MIME type, then the filename
/// extension, then the leading bytes.
pub fn detect_file_type(filename: &str, mime_type: Option<&str>, bytes: &[u8]) -> Option<FileType> {
    if let Some(file_type) = mime_type.and_then(FileType::from_mime) {
        return Some(file_type);
    }

    let by_extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .and_then(FileType::from_extension);
    if by_extension.is_some() {
        return by_extension;
    }

    if bytes.starts_with(PDF_MAGIC) {
        Some(FileType::Pdf)
    } else {
        None
    }
}

/// Turns raw bytes into per-page plain text. Pure: no I/O, no state.
pub fn extract_document(
    bytes: &[u8],
    filename: &str,
    mime_type: Option<&str>,
    allowed: &[FileType],
) -> Result<ExtractedDocument, ExtractionError> {
    let file_type = detect_file_type(filename, mime_type, bytes).ok_or_else(|| {
        ExtractionError::Unsupported(mime_type.unwrap_or(filename).to_string())
    })?;

    if !allowed.contains(&file_type) {
        return Err(ExtractionError::Unsupported(file_type.to_string()));
    }

    if file_type == FileType::Pdf && !bytes.starts_with(PDF_MAGIC) {
        return Err(ExtractionError::PdfParse(
            "missing %PDF- header".to_string(),
        ));
    }

    let pages = match file_type {
        FileType::Pdf => LopdfExtractor.extract_pages(bytes)?,
        FileType::Text | FileType::Markdown => PlainTextExtractor.extract_pages(bytes)?,
    };

    Ok(ExtractedDocument { file_type, pages })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [FileType; 3] = [FileType::Pdf, FileType::Text, FileType::Markdown];

    #[test]
    fn text_pages_split_on_form_feed() {
        let extracted = extract_document(b"First page\x0cSecond page\n", "notes.txt", None, &ALL)
            .expect("text should extract");

        assert_eq!(extracted.file_type, FileType::Text);
        assert_eq!(extracted.page_count(), 2);
        assert_eq!(extracted.pages[0].number, 1);
        assert_eq!(extracted.pages[1].text, "Second page\n");
    }

    #[test]
    fn blank_pages_keep_their_numbers() {
        let pages = PlainTextExtractor
            .extract_pages(b"one\x0c   \x0cthree")
            .expect("text should extract");
        let numbers: Vec<_> = pages.iter().map(|page| page.number).collect();
        assert_eq!(numbers, vec![1, 3]);
    }

    #[test]
    fn mime_type_wins_over_extension() {
        assert_eq!(
            detect_file_type("report.txt", Some("application/pdf"), b""),
            Some(FileType::Pdf)
        );
        assert_eq!(
            detect_file_type("upload.bin", None, b"%PDF-1.7\n"),
            Some(FileType::Pdf)
        );
        assert_eq!(detect_file_type("image.png", None, b"\x89PNG"), None);
    }

    #[test]
    fn corrupt_pdf_is_an_extraction_error() {
        let result = extract_document(b"%PDF-1.4\n%broken", "broken.pdf", None, &ALL);
        assert!(matches!(result, Err(ExtractionError::PdfParse(_))));
    }

    #[test]
    fn disallowed_types_are_unsupported() {
        let result = extract_document(b"# Title", "readme.md", None, &[FileType::Pdf]);
        assert!(matches!(result, Err(ExtractionError::Unsupported(_))));
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let result = extract_document(&[0xff, 0xfe, 0x00], "bytes.txt", None, &ALL);
        assert!(matches!(result, Err(ExtractionError::InvalidEncoding)));
    }

    #[test]
    fn blank_text_is_empty() {
        let result = extract_document(b"  \n\n ", "blank.txt", None, &ALL);
        assert!(matches!(result, Err(ExtractionError::Empty(_))));
    }
}
