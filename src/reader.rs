//! Executes compiled SQL and streams typed rows to a caller sink, with
//! offset/size paging and an optional full-page buffering mode (§4.4).

use sqlx::any::AnyPool;
use sqlx::{Column, Row, TypeInfo};

use crate::cell::CellValue;
use crate::error::{Error, Result};

/// The page window requested by the caller: `offset` rows are discarded
/// before delivery begins; `size = None` means unbounded.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub offset: u64,
    pub size: Option<u64>,
}

/// What [`ReadTo`](Reader::read_to) reports back about how much of the
/// result set it actually delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageResult {
    pub offset: u64,
    pub size: u64,
    pub is_last_page: bool,
}

/// One row of cells, in column order.
pub type RowCells = Vec<CellValue>;

/// Return `false` to stop iteration early (e.g. the caller's transport
/// closed); returning an error aborts the scan immediately.
pub type Sink<'a> = dyn FnMut(RowCells) -> Result<bool> + Send + 'a;

pub struct Reader<'a> {
    pool: &'a AnyPool,
}

impl<'a> Reader<'a> {
    pub fn new(pool: &'a AnyPool) -> Self {
        Reader { pool }
    }

    /// Execute `sql` (already prefixed with any CTEs) and stream rows
    /// within `page` to `sink`, row at a time.
    pub async fn read_to(&self, sql: &str, page: Page, sink: &mut Sink<'_>) -> Result<PageResult> {
        use futures::TryStreamExt;

        let mut stream = sqlx::query(sql).fetch(self.pool);
        let mut seen: u64 = 0;
        let mut delivered: u64 = 0;
        let mut exhausted = true;

        while let Some(row) = stream
            .try_next()
            .await
            .map_err(|e| Error::io("scan result row", e))?
        {
            if seen < page.offset {
                seen += 1;
                continue;
            }
            if let Some(size) = page.size {
                if delivered >= size {
                    exhausted = false;
                    break;
                }
            }

            let cells = decode_row(&row)?;
            let keep_going = sink(cells)?;
            delivered += 1;
            seen += 1;
            if !keep_going {
                exhausted = false;
                break;
            }
        }

        Ok(PageResult {
            offset: page.offset,
            size: delivered,
            is_last_page: exhausted,
        })
    }

    /// Full-page mode: buffer every row in `page` into memory before
    /// returning, so the caller can start writing bytes downstream without
    /// holding the scan open.
    pub async fn read_page(&self, sql: &str, page: Page) -> Result<(Vec<RowCells>, PageResult)> {
        let mut rows = Vec::new();
        let mut sink: Box<Sink<'_>> = Box::new(|cells| {
            rows.push(cells);
            Ok(true)
        });
        let result = self.read_to(sql, page, &mut *sink).await?;
        Ok((rows, result))
    }
}

/// Normalise a driver row into cells: integer-typed driver values (however
/// logically a bool/enum/id) come through as `Int`, strings as `Str`
/// (null-aware), floats as `Float` (null-aware). This mirrors the "opaque
/// value holders" per-column scan buffer described in §4.4 — the Cell
/// Converter, not the Reader, knows what the logical type of a column is.
fn decode_row(row: &sqlx::any::AnyRow) -> Result<RowCells> {
    let mut cells = Vec::with_capacity(row.columns().len());
    for (idx, col) in row.columns().iter().enumerate() {
        let type_name = col.type_info().name().to_ascii_uppercase();
        let cell = if type_name.contains("INT") || type_name.contains("BOOL") {
            match row.try_get::<Option<i64>, _>(idx) {
                Ok(Some(v)) => CellValue::Int(v),
                Ok(None) => CellValue::Null,
                Err(e) => return Err(Error::io("decode integer cell", e)),
            }
        } else if type_name.contains("FLOAT") || type_name.contains("DOUBLE") || type_name.contains("REAL") {
            match row.try_get::<Option<f64>, _>(idx) {
                Ok(Some(v)) => CellValue::Float(v),
                Ok(None) => CellValue::Null,
                Err(e) => return Err(Error::io("decode float cell", e)),
            }
        } else {
            match row.try_get::<Option<String>, _>(idx) {
                Ok(Some(v)) => CellValue::Str(v),
                Ok(None) => CellValue::Null,
                Err(e) => return Err(Error::io("decode string cell", e)),
            }
        };
        cells.push(cell);
    }
    Ok(cells)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_result_reports_exhaustion_correctly() {
        let full = PageResult { offset: 0, size: 3, is_last_page: true };
        let partial = PageResult { offset: 0, size: 3, is_last_page: false };
        assert!(full.is_last_page);
        assert!(!partial.is_last_page);
    }
}
