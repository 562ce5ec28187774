//! CSV decoding.

use crate::error::{DecodeError, DecodeResult};
use crate::types::RowSet;

use super::infer::{build_row_set, normalize_headers, CsvInference};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Decode delimited text into a typed [`RowSet`].
///
/// Rules:
///
/// - The first record is the header and defines the columns.
/// - Every data record must have exactly as many fields as the header, otherwise decoding fails
///   with [`DecodeError::MalformedRow`] carrying the 1-based line number.
/// - Blank lines are skipped; a header with no data rows fails with [`DecodeError::NoRows`].
/// - Column types come from [`CsvInference`].
pub fn decode_csv(bytes: &[u8], delimiter: u8) -> DecodeResult<RowSet> {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(DecodeError::EmptyFile);
    }

    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes);

    let header = rdr.headers().map_err(map_csv_error)?.clone();
    if header.is_empty() || header.iter().all(|h| h.trim().is_empty()) {
        return Err(DecodeError::NoColumns);
    }
    let expected = header.len();

    let mut rows: Vec<Vec<String>> = Vec::new();
    for result in rdr.records() {
        let record = result.map_err(map_csv_error)?;
        if record.len() != expected {
            return Err(DecodeError::MalformedRow {
                line: record.position().map(|p| p.line()).unwrap_or_default(),
                expected,
                found: record.len(),
            });
        }
        rows.push(record.iter().map(str::to_owned).collect());
    }
    if rows.is_empty() {
        return Err(DecodeError::NoRows);
    }

    let headers = normalize_headers(header.iter().map(str::to_owned).collect());
    Ok(build_row_set(&CsvInference, headers, rows))
}

fn map_csv_error(err: csv::Error) -> DecodeError {
    match err.kind() {
        csv::ErrorKind::Utf8 { .. } | csv::ErrorKind::Io(_) => DecodeError::Unreadable {
            message: err.to_string(),
        },
        _ => DecodeError::Csv(err),
    }
}

#[cfg(test)]
mod tests {
    use super::decode_csv;
    use crate::error::DecodeError;
    use crate::types::{DataType, Value};

    #[test]
    fn decodes_header_and_typed_rows() {
        let rs = decode_csv(b"id,score\nS001,98.5\nS002,87\n", b',').unwrap();
        assert_eq!(rs.columns(), vec!["id", "score"]);
        assert_eq!(rs.schema.fields[1].data_type, DataType::Float64);
        assert_eq!(rs.rows[1][1], Value::Float64(87.0));
    }

    #[test]
    fn honours_declared_delimiter() {
        let rs = decode_csv(b"id;name\n1;Ada\n", b';').unwrap();
        assert_eq!(rs.columns(), vec!["id", "name"]);
        assert_eq!(rs.rows[0][1], Value::Utf8("Ada".into()));
    }

    #[test]
    fn ragged_row_reports_line_number() {
        let err = decode_csv(b"id,name\nS001,Ada\nS002\n", b',').unwrap_err();
        assert!(matches!(
            err,
            DecodeError::MalformedRow {
                line: 3,
                expected: 2,
                found: 1
            }
        ));
    }

    #[test]
    fn empty_and_header_only_inputs_fail() {
        assert!(matches!(decode_csv(b"", b','), Err(DecodeError::EmptyFile)));
        assert!(matches!(decode_csv(b"\n \n", b','), Err(DecodeError::EmptyFile)));
        assert!(matches!(decode_csv(b"id,name\n", b','), Err(DecodeError::NoRows)));
        assert!(matches!(decode_csv(b",,\n1,2,3\n", b','), Err(DecodeError::NoColumns)));
    }

    #[test]
    fn invalid_utf8_is_unreadable() {
        let err = decode_csv(b"id\n\xff\xfe\n", b',').unwrap_err();
        assert!(matches!(err, DecodeError::Unreadable { .. }));
    }

    #[test]
    fn bom_is_stripped_from_first_header() {
        let rs = decode_csv(b"\xEF\xBB\xBFid,name\n1,Ada\n", b',').unwrap();
        assert_eq!(rs.columns(), vec!["id", "name"]);
    }
}
