// src/pdf.rs
//! Page-level text extraction for uploaded PDFs. Parsing is delegated to
//! lopdf; this module only walks the page tree and pairs each page number
//! with its extracted text.

use crate::vector_store::PagePassage;
use lopdf::Document;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PdfError {
    #[error("failed to parse PDF: {0}")]
    Parse(String),
    #[error("failed to extract text from page {page}: {message}")]
    Extract { page: u32, message: String },
}

/// Extracts per-page text. Page numbers are 1-based, in document order.
/// Pages without extractable text come back empty rather than failing;
/// a page the parser cannot process at all is an error, and the caller
/// marks the upload FAILED.
pub fn extract_pages(bytes: &[u8]) -> Result<Vec<PagePassage>, PdfError> {
    let doc = Document::load_mem(bytes).map_err(|e| PdfError::Parse(e.to_string()))?;

    let mut pages = Vec::new();
    for (page_number, _object_id) in doc.get_pages() {
        let text = doc
            .extract_text(&[page_number])
            .map_err(|e| PdfError::Extract {
                page: page_number,
                message: e.to_string(),
            })?;

        pages.push(PagePassage {
            page: page_number,
            text,
        });
    }

    Ok(pages)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal two-page PDF built by hand: body objects first, then an
    /// xref with correct byte offsets so the parser accepts it.
    fn two_page_pdf() -> Vec<u8> {
        let mut out = Vec::new();
        let mut offsets = Vec::new();

        let obj = |out: &mut Vec<u8>, offsets: &mut Vec<usize>, body: String| {
            offsets.push(out.len());
            out.extend_from_slice(body.as_bytes());
        };

        out.extend_from_slice(b"%PDF-1.4\n");
        obj(
            &mut out,
            &mut offsets,
            "1 0 obj << /Type /Catalog /Pages 2 0 R >> endobj\n".to_string(),
        );
        obj(
            &mut out,
            &mut offsets,
            "2 0 obj << /Type /Pages /Kids [3 0 R 4 0 R] /Count 2 >> endobj\n".to_string(),
        );
        obj(
            &mut out,
            &mut offsets,
            "3 0 obj << /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents 5 0 R /Resources << /Font << /F1 7 0 R >> >> >> endobj\n".to_string(),
        );
        obj(
            &mut out,
            &mut offsets,
            "4 0 obj << /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents 6 0 R /Resources << /Font << /F1 7 0 R >> >> >> endobj\n".to_string(),
        );

        let first = "BT /F1 12 Tf 100 700 Td (total revenue was 42) Tj ET";
        obj(
            &mut out,
            &mut offsets,
            format!(
                "5 0 obj << /Length {} >> stream\n{}\nendstream endobj\n",
                first.len(),
                first
            ),
        );
        let second = "BT /F1 12 Tf 100 700 Td (appendix follows) Tj ET";
        obj(
            &mut out,
            &mut offsets,
            format!(
                "6 0 obj << /Length {} >> stream\n{}\nendstream endobj\n",
                second.len(),
                second
            ),
        );
        obj(
            &mut out,
            &mut offsets,
            "7 0 obj << /Type /Font /Subtype /Type1 /BaseFont /Helvetica >> endobj\n".to_string(),
        );

        let xref_start = out.len();
        out.extend_from_slice(b"xref\n0 8\n");
        out.extend_from_slice(format!("{:010} 65535 f \n", 0).as_bytes());
        for offset in &offsets {
            out.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
        }
        out.extend_from_slice(b"trailer << /Size 8 /Root 1 0 R >>\nstartxref\n");
        out.extend_from_slice(format!("{}\n", xref_start).as_bytes());
        out.extend_from_slice(b"%%EOF\n");
        out
    }

    #[test]
    fn extracts_each_page_with_its_own_text() {
        let pages = extract_pages(&two_page_pdf()).unwrap();

        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].page, 1);
        assert!(pages[0].text.contains("total revenue was 42"));
        assert_eq!(pages[1].page, 2);
        assert!(pages[1].text.contains("appendix follows"));
        assert!(!pages[1].text.contains("total revenue"));
    }

    #[test]
    fn rejects_bytes_that_are_not_a_pdf() {
        let err = extract_pages(b"definitely not a pdf").unwrap_err();
        assert!(matches!(err, PdfError::Parse(_)));
    }
}
