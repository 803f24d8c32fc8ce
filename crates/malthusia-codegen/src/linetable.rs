//! Debug line-offset table.
//!
//! The table is a sequence of `(byte_delta: u8, line_delta: i8)` pairs
//! relative to `(0, first_line)`. Each pair advances the byte offset and
//! the line together; a delta that does not fit in one entry is split
//! across several, with the other half of the pair set to zero.

/// Encode `(offset, line)` rows, sorted by offset, into a table.
pub fn encode(first_line: u32, rows: &[(usize, u32)]) -> Vec<u8> {
    let mut table = Vec::new();
    let mut last_offset = 0usize;
    let mut last_line = first_line as i64;

    for &(offset, line) in rows {
        let line = line as i64;
        if line == last_line {
            continue;
        }
        let mut byte_delta = offset.saturating_sub(last_offset);
        let mut line_delta = line - last_line;

        while byte_delta > 255 {
            table.extend_from_slice(&[255, 0]);
            byte_delta -= 255;
        }
        while line_delta > 127 {
            table.extend_from_slice(&[byte_delta as u8, 127]);
            byte_delta = 0;
            line_delta -= 127;
        }
        while line_delta < -128 {
            table.extend_from_slice(&[byte_delta as u8, (-128i8) as u8]);
            byte_delta = 0;
            line_delta += 128;
        }
        table.extend_from_slice(&[byte_delta as u8, line_delta as i8 as u8]);

        last_offset = offset;
        last_line = line;
    }
    table
}

/// Decode a table into `(offset, line)` change points, starting with
/// `(0, first_line)`.
pub fn decode(first_line: u32, table: &[u8]) -> Vec<(usize, u32)> {
    let mut rows = vec![(0usize, first_line)];
    let mut offset = 0usize;
    let mut line = first_line as i64;
    for pair in table.chunks_exact(2) {
        offset += pair[0] as usize;
        line += pair[1] as i8 as i64;
        let line = line.max(0) as u32;
        match rows.last_mut() {
            Some(last) if last.0 == offset => last.1 = line,
            _ => rows.push((offset, line)),
        }
    }
    rows
}

/// Source line of the instruction at `offset`.
pub fn line_at(first_line: u32, table: &[u8], offset: usize) -> u32 {
    let mut line = first_line;
    for (start, l) in decode(first_line, table) {
        if start > offset {
            break;
        }
        line = l;
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_rows() {
        let table = encode(1, &[(0, 1), (4, 2), (10, 5)]);
        assert_eq!(table, vec![4, 1, 6, 3]);
        assert_eq!(decode(1, &table), vec![(0, 1), (4, 2), (10, 5)]);
    }

    #[test]
    fn large_byte_delta_is_split() {
        let table = encode(1, &[(600, 2)]);
        assert_eq!(table, vec![255, 0, 255, 0, 90, 1]);
        assert_eq!(line_at(1, &table, 599), 1);
        assert_eq!(line_at(1, &table, 600), 2);
    }

    #[test]
    fn large_line_delta_is_split() {
        let table = encode(1, &[(2, 301)]);
        assert_eq!(table, vec![2, 127, 0, 127, 0, 46]);
        assert_eq!(line_at(1, &table, 2), 301);
    }

    #[test]
    fn negative_line_delta() {
        let table = encode(10, &[(0, 10), (6, 3)]);
        assert_eq!(line_at(10, &table, 6), 3);
        assert_eq!(line_at(10, &table, 4), 10);
    }
}
