//! Lazy decoder for batch responses.
//!
//! A batch response carries one result set per operation in the request.
//! [`ResultSet`] walks them using each result's embedded byte length, so
//! skipping a result set never requires parsing its rows. Within a row
//! set, rows are decoded one at a time, forward-only.
//!
//! The cursor mutably borrows the client's response buffer, so the borrow
//! checker enforces the protocol-level rule that a result is invalidated
//! by the next `execute`.
//!
//! # Example
//!
//! ```ignore
//! client.put("SELECT id, name FROM t")?;
//! let mut rs = client.execute(true).await?;
//! while let Some(row) = rs.next_row()? {
//!     let id = row.get("id")?.as_integer();
//!     let name = row.get("name")?.as_text();
//! }
//! assert!(!rs.next_result_set()?);
//! ```

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::protocol::buffer::FrameBuffer;
use crate::protocol::wire::{self, flag};
use crate::value::Value;

/// Cursor over the result sets of one executed batch.
///
/// Positioned at the first result set on creation. For a mutation the
/// result set is a summary ([`lines_changed`](Self::lines_changed),
/// [`last_row_id`](Self::last_row_id)); for a query it is a row set
/// iterated with [`next_row`](Self::next_row).
pub struct ResultSet<'a> {
    buf: &'a mut FrameBuffer,
    /// Byte offset of the next result set within the response frame.
    next_result_set: usize,
    lines_changed: i32,
    last_row_id: i64,
    row_count: i32,
    remaining_rows: i32,
    column_names: Vec<String>,
    column_map: HashMap<String, usize>,
    /// Decoded values of the current row, reused across rows.
    values: Vec<Value>,
}

impl<'a> ResultSet<'a> {
    /// Wrap a decoded response buffer positioned just past the status
    /// flag and advance to the first result set.
    pub(crate) fn new(buf: &'a mut FrameBuffer) -> Result<Self> {
        let mut rs = ResultSet {
            next_result_set: buf.position(),
            buf,
            lines_changed: 0,
            last_row_id: 0,
            row_count: -1,
            remaining_rows: -1,
            column_names: Vec::new(),
            column_map: HashMap::new(),
            values: Vec::new(),
        };

        if !rs.next_result_set()? {
            return Err(Error::Corrupt("response contains no result set".into()));
        }

        Ok(rs)
    }

    /// Advance to the next result set. Returns `false` once all result
    /// sets have been visited. Unread rows of the current result set are
    /// skipped without being parsed.
    pub fn next_result_set(&mut self) -> Result<bool> {
        self.lines_changed = 0;
        self.last_row_id = 0;
        self.row_count = -1;
        self.remaining_rows = -1;
        self.column_names.clear();
        self.column_map.clear();
        self.values.clear();

        self.buf.set_position(self.next_result_set);

        if self.buf.get_u8()? != flag::OP {
            return Ok(false);
        }

        // The embedded length counts from the length field itself to the
        // end of this result set.
        let len_at = self.buf.position();
        let op_len = self.buf.get_u32()? as usize;
        self.next_result_set = len_at + op_len;

        self.lines_changed = self.buf.get_i32()?;
        self.last_row_id = self.buf.get_i64()?;

        match self.buf.get_u8()? {
            flag::ROW => {
                let columns = self.buf.get_u32()? as usize;
                for i in 0..columns {
                    let name = self
                        .buf
                        .get_str()?
                        .ok_or_else(|| Error::Corrupt("null column name".into()))?;
                    self.column_map.insert(name.clone(), i);
                    self.column_names.push(name);
                }
                self.row_count = self.buf.get_i32()?;
                self.remaining_rows = self.row_count;
            }
            flag::OP_END => {}
            other => {
                return Err(Error::Corrupt(format!(
                    "unexpected flag in result set: {}",
                    other
                )))
            }
        }

        Ok(true)
    }

    /// Decode and return the next row of the current result set, or
    /// `None` when the result set is exhausted (or is a mutation
    /// summary). The returned row borrows this cursor and is overwritten
    /// by the next call.
    pub fn next_row(&mut self) -> Result<Option<Row<'_, 'a>>> {
        if self.remaining_rows <= 0 {
            return Ok(None);
        }
        self.remaining_rows -= 1;

        self.values.clear();
        for _ in 0..self.column_names.len() {
            let value = wire::get_value(self.buf)?;
            self.values.push(value);
        }

        Ok(Some(Row { rs: self }))
    }

    /// Rows changed by a mutation (INSERT/UPDATE/DELETE).
    pub fn lines_changed(&self) -> i32 {
        self.lines_changed
    }

    /// Rowid of the last inserted row.
    pub fn last_row_id(&self) -> i64 {
        self.last_row_id
    }

    /// Number of rows in the current result set, or -1 for a mutation
    /// summary.
    pub fn row_count(&self) -> i32 {
        self.row_count
    }

    /// Number of columns in the current result set.
    pub fn column_count(&self) -> usize {
        self.column_names.len()
    }

    /// Column name by index.
    pub fn column_name(&self, index: usize) -> Result<&str> {
        self.column_names
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| Error::Misuse(format!("column index out of range: {}", index)))
    }

    #[cfg(test)]
    fn next_result_set_offset(&self) -> usize {
        self.next_result_set
    }
}

impl std::fmt::Debug for ResultSet<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSet")
            .field("lines_changed", &self.lines_changed)
            .field("last_row_id", &self.last_row_id)
            .field("row_count", &self.row_count)
            .field("columns", &self.column_names)
            .finish()
    }
}

/// One decoded row, valid until the next [`ResultSet::next_row`] call.
pub struct Row<'r, 'a> {
    rs: &'r ResultSet<'a>,
}

impl Row<'_, '_> {
    /// Column value by name. Unknown names are a usage error.
    pub fn get(&self, column: &str) -> Result<&Value> {
        let index = self
            .rs
            .column_map
            .get(column)
            .ok_or_else(|| Error::Misuse(format!("column does not exist: {}", column)))?;
        Ok(&self.rs.values[*index])
    }

    /// Column value by index. Out-of-range indexes are a usage error.
    pub fn get_index(&self, index: usize) -> Result<&Value> {
        self.rs
            .values
            .get(index)
            .ok_or_else(|| Error::Misuse(format!("column index out of range: {}", index)))
    }

    /// Column name by index.
    pub fn column_name(&self, index: usize) -> Result<&str> {
        self.rs.column_name(index)
    }

    /// Number of columns in this row.
    pub fn column_count(&self) -> usize {
        self.rs.column_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::wire::param;

    /// Append one result set to `buf`, patching the embedded length.
    fn put_op_result(buf: &mut FrameBuffer, body: impl FnOnce(&mut FrameBuffer)) {
        buf.put_u8(flag::OP);
        let len_at = buf.position();
        buf.put_u32(0);
        body(buf);
        buf.patch_u32_at(len_at, (buf.position() - len_at) as u32);
    }

    fn put_mutation(buf: &mut FrameBuffer, lines: i32, row_id: i64) {
        put_op_result(buf, |buf| {
            buf.put_i32(lines);
            buf.put_i64(row_id);
            buf.put_u8(flag::OP_END);
        });
    }

    fn put_row_set(buf: &mut FrameBuffer, columns: &[&str], rows: &[Vec<Value>]) {
        put_op_result(buf, |buf| {
            buf.put_i32(0);
            buf.put_i64(0);
            buf.put_u8(flag::ROW);
            buf.put_u32(columns.len() as u32);
            for c in columns {
                buf.put_str(Some(c));
            }
            buf.put_u32(rows.len() as u32);
            for row in rows {
                for v in row {
                    wire::put_value(buf, v);
                }
            }
        });
    }

    /// Build a response body: result sets followed by the end marker,
    /// flipped and positioned as `ResultSet::new` expects.
    fn response(build: impl FnOnce(&mut FrameBuffer)) -> FrameBuffer {
        let mut buf = FrameBuffer::with_capacity(1024);
        build(&mut buf);
        buf.put_u8(flag::MSG_END);
        buf.flip();
        buf
    }

    #[test]
    fn test_mutation_summary() {
        let mut buf = response(|buf| put_mutation(buf, 3, 17));
        let mut rs = ResultSet::new(&mut buf).unwrap();

        assert_eq!(rs.lines_changed(), 3);
        assert_eq!(rs.last_row_id(), 17);
        assert_eq!(rs.row_count(), -1);
        assert!(rs.next_row().unwrap().is_none());
        assert!(!rs.next_result_set().unwrap());
    }

    #[test]
    fn test_row_iteration() {
        let mut buf = response(|buf| {
            put_row_set(
                buf,
                &["id", "name"],
                &[
                    vec![Value::Integer(1), Value::Text("a".into())],
                    vec![Value::Integer(2), Value::Null],
                ],
            );
        });
        let mut rs = ResultSet::new(&mut buf).unwrap();

        assert_eq!(rs.row_count(), 2);
        assert_eq!(rs.column_count(), 2);
        assert_eq!(rs.column_name(0).unwrap(), "id");

        let row = rs.next_row().unwrap().unwrap();
        assert_eq!(row.get("id").unwrap().as_integer(), Some(1));
        assert_eq!(row.get("name").unwrap().as_text(), Some("a"));
        assert_eq!(row.get_index(1).unwrap().as_text(), Some("a"));

        let row = rs.next_row().unwrap().unwrap();
        assert_eq!(row.get("id").unwrap().as_integer(), Some(2));
        assert!(row.get("name").unwrap().is_null());

        assert!(rs.next_row().unwrap().is_none());
        assert!(!rs.next_result_set().unwrap());
    }

    #[test]
    fn test_column_lookup_errors_are_usage_errors() {
        let mut buf = response(|buf| {
            put_row_set(buf, &["id"], &[vec![Value::Integer(1)]]);
        });
        let mut rs = ResultSet::new(&mut buf).unwrap();
        let row = rs.next_row().unwrap().unwrap();

        assert!(matches!(row.get("missing"), Err(Error::Misuse(_))));
        assert!(matches!(row.get_index(5), Err(Error::Misuse(_))));
        assert!(matches!(row.column_name(5), Err(Error::Misuse(_))));
    }

    #[test]
    fn test_skip_lands_at_same_offset_as_full_consume() {
        let build = |buf: &mut FrameBuffer| {
            put_row_set(
                buf,
                &["v"],
                &[vec![Value::Integer(1)], vec![Value::Integer(2)]],
            );
            put_mutation(buf, 1, 5);
        };

        // Skip the row set without reading any rows: the cursor must land
        // exactly on the following mutation summary.
        let mut skipped = response(build);
        let mut rs = ResultSet::new(&mut skipped).unwrap();
        assert!(rs.next_result_set().unwrap());
        assert_eq!(rs.lines_changed(), 1);
        assert_eq!(rs.last_row_id(), 5);
        let skipped_at = rs.next_result_set_offset();

        // Fully consume the rows first, then advance.
        let mut consumed = response(build);
        let mut rs = ResultSet::new(&mut consumed).unwrap();
        while rs.next_row().unwrap().is_some() {}
        assert!(rs.next_result_set().unwrap());
        assert_eq!(rs.lines_changed(), 1);
        assert_eq!(rs.last_row_id(), 5);
        let consumed_at = rs.next_result_set_offset();

        assert_eq!(skipped_at, consumed_at);
    }

    #[test]
    fn test_multiple_result_sets_one_per_operation() {
        let mut buf = response(|buf| {
            put_mutation(buf, 1, 1);
            put_mutation(buf, 1, 2);
            put_row_set(buf, &["x"], &[vec![Value::Integer(9)]]);
        });
        let mut rs = ResultSet::new(&mut buf).unwrap();

        let mut count = 1;
        while rs.next_result_set().unwrap() {
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[test]
    fn test_malformed_result_set_flag() {
        let mut buf = response(|buf| {
            put_op_result(buf, |buf| {
                buf.put_i32(0);
                buf.put_i64(0);
                buf.put_u8(0xEE);
            });
        });
        assert!(matches!(
            ResultSet::new(&mut buf),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn test_empty_response_rejected() {
        let mut buf = response(|_| {});
        assert!(matches!(
            ResultSet::new(&mut buf),
            Err(Error::Corrupt(_))
        ));
    }
}
