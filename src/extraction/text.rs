//! Plain-text views of documents for the template fast path and the spreadsheet adapter.

use calamine::{Data, Reader};
use std::io::Cursor;

use crate::models::MediaType;

/// Cell text per row of the first worksheet. Dates are rendered as ISO `YYYY-MM-DD`.
pub fn spreadsheet_rows(bytes: &[u8]) -> Result<Vec<Vec<String>>, String> {
    let cursor = Cursor::new(bytes.to_vec());
    let mut workbook = calamine::open_workbook_auto_from_rs(cursor).map_err(|e| e.to_string())?;

    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| "workbook has no worksheets".to_string())?
        .map_err(|e| e.to_string())?;

    Ok(range
        .rows()
        .map(|row| row.iter().map(cell_text).collect())
        .collect())
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.trim().to_string(),
        Data::Float(f) => f.to_string(),
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => dt
            .as_datetime()
            .map(|d| d.date().to_string())
            .unwrap_or_else(|| dt.to_string()),
        Data::DateTimeIso(s) => s.clone(),
        _ => String::new(),
    }
}

/// Text layer of a document, or `None` when it has none (images, scanned PDFs).
pub fn document_text(bytes: &[u8], media: MediaType) -> Option<String> {
    let text = match media {
        MediaType::Pdf => match pdf_extract::extract_text_from_mem(bytes) {
            Ok(text) => text,
            Err(e) => {
                tracing::debug!(error = %e, "pdf has no extractable text layer");
                return None;
            }
        },
        MediaType::Xlsx | MediaType::Xls => {
            let rows = spreadsheet_rows(bytes).ok()?;
            rows.iter()
                .map(|row| {
                    row.iter()
                        .filter(|c| !c.is_empty())
                        .cloned()
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .filter(|line| !line.is_empty())
                .collect::<Vec<_>>()
                .join("\n")
        }
        MediaType::Jpeg | MediaType::Png => return None,
    };

    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}
