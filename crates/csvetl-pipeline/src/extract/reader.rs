//! Chunked delimited-file reader
//!
//! `ChunkReader` is a lazy, fused iterator of `RawRecord` batches. Each batch holds at most
//! `batch_size` records and line order is preserved within and across batches. The
//! underlying file is owned by the reader, so it is closed whenever the reader is dropped:
//! after exhaustion, after an error, or when the consumer stops early.
//!
//! Rows that cannot be parsed do not fail the stream. They come back flagged as malformed
//! and the validator rejects them with a `parse-error` violation.

use csv::{ByteRecord, ReaderBuilder};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::{debug, trace};

use crate::error::{EtlError, Result};
use crate::types::RawRecord;

/// Text encoding of input files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TextEncoding {
    #[default]
    Utf8,
    /// ISO-8859-1: every byte maps to the code point of the same value
    Latin1,
}

impl TextEncoding {
    fn decode(self, bytes: &[u8]) -> std::result::Result<String, String> {
        match self {
            TextEncoding::Utf8 => std::str::from_utf8(bytes)
                .map(str::to_owned)
                .map_err(|e| format!("invalid utf-8 ({e})")),
            TextEncoding::Latin1 => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
        }
    }
}

impl std::str::FromStr for TextEncoding {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "utf-8" | "utf8" => Ok(TextEncoding::Utf8),
            "latin-1" | "latin1" | "iso-8859-1" => Ok(TextEncoding::Latin1),
            other => Err(EtlError::config(format!("unsupported encoding '{other}'"))),
        }
    }
}

/// Delimiter, quoting and decoding conventions for input files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvFormat {
    pub delimiter: u8,
    pub quote: u8,
    pub encoding: TextEncoding,
    pub has_header: bool,
    /// Accept quoted fields spanning several lines. When off, a field containing a line
    /// break is treated as an unterminated quote.
    pub allow_multiline: bool,
}

impl Default for CsvFormat {
    fn default() -> Self {
        Self {
            delimiter: b',',
            quote: b'"',
            encoding: TextEncoding::Utf8,
            has_header: true,
            allow_multiline: false,
        }
    }
}

/// Byte source of an opened file
pub type SourceReader = Box<dyn Read + Send>;

pub struct ChunkReader<R: Read> {
    inner: csv::Reader<R>,
    source: String,
    encoding: TextEncoding,
    allow_multiline: bool,
    batch_size: usize,
    headers: Option<Vec<String>>,
    expected_fields: Option<usize>,
    pending_error: Option<EtlError>,
    done: bool,
}

impl ChunkReader<SourceReader> {
    /// Open a file for batched reading
    pub fn open(path: impl AsRef<Path>, format: &CsvFormat, batch_size: usize) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| EtlError::io(path, e))?;
        debug!(file = %path.display(), batch_size, "Opened source file");
        Self::from_reader(Box::new(file), path.display().to_string(), format, batch_size)
    }
}

impl<R: Read> ChunkReader<R> {
    /// Wrap any reader; `source` labels errors
    pub fn from_reader(
        reader: R,
        source: impl Into<String>,
        format: &CsvFormat,
        batch_size: usize,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(EtlError::config("batch size must be greater than 0"));
        }

        let inner = ReaderBuilder::new()
            .delimiter(format.delimiter)
            .quote(format.quote)
            .has_headers(format.has_header)
            .flexible(true)
            .from_reader(reader);

        let mut chunk_reader = Self {
            inner,
            source: source.into(),
            encoding: format.encoding,
            allow_multiline: format.allow_multiline,
            batch_size,
            headers: None,
            expected_fields: None,
            pending_error: None,
            done: false,
        };

        if format.has_header {
            chunk_reader.read_headers()?;
        }

        Ok(chunk_reader)
    }

    /// Header names, when the format declares a header row
    pub fn headers(&self) -> Option<&[String]> {
        self.headers.as_deref()
    }

    fn read_headers(&mut self) -> Result<()> {
        let raw = match self.inner.byte_headers() {
            Ok(raw) => raw.clone(),
            Err(err) => return Err(read_error(&self.source, err)),
        };

        let mut names = Vec::with_capacity(raw.len());
        for (i, field) in raw.iter().enumerate() {
            let name = self
                .encoding
                .decode(field)
                .map_err(|e| EtlError::Schema(format!("{}: header field {}: {e}", self.source, i + 1)))?;
            names.push(name.trim_start_matches('\u{feff}').trim().to_string());
        }

        if !names.is_empty() {
            self.expected_fields = Some(names.len());
        }
        self.headers = Some(names);
        Ok(())
    }

    fn next_batch(&mut self) -> Result<Vec<RawRecord>> {
        let mut batch = Vec::with_capacity(self.batch_size.min(4096));
        let mut record = ByteRecord::new();

        while batch.len() < self.batch_size {
            match self.inner.read_byte_record(&mut record) {
                Ok(true) => batch.push(self.to_raw(&record)),
                Ok(false) => {
                    self.done = true;
                    break;
                },
                Err(err) => {
                    self.done = true;
                    let err = read_error(&self.source, err);
                    if batch.is_empty() {
                        return Err(err);
                    }
                    // hand out what was read; the error follows on the next call
                    self.pending_error = Some(err);
                    break;
                },
            }
        }

        trace!(source = %self.source, records = batch.len(), "Read batch");
        Ok(batch)
    }

    fn to_raw(&mut self, record: &ByteRecord) -> RawRecord {
        let line = record.position().map(|p| p.line()).unwrap_or(0);
        let mut fields = Vec::with_capacity(record.len());
        let mut problem = None;

        for (i, bytes) in record.iter().enumerate() {
            match self.encoding.decode(bytes) {
                Ok(text) => {
                    if !self.allow_multiline && problem.is_none() && text.contains(['\n', '\r']) {
                        problem = Some(format!("unterminated quote in field {}", i + 1));
                    }
                    fields.push(text);
                },
                Err(e) => {
                    if problem.is_none() {
                        problem = Some(format!("field {}: {e}", i + 1));
                    }
                    fields.push(String::from_utf8_lossy(bytes).into_owned());
                },
            }
        }

        let expected = *self.expected_fields.get_or_insert(fields.len());
        if problem.is_none() && fields.len() != expected {
            problem = Some(format!("expected {expected} fields, found {}", fields.len()));
        }

        match problem {
            Some(reason) => RawRecord::malformed(line, fields, reason),
            None => RawRecord::new(line, fields),
        }
    }
}

impl<R: Read> Iterator for ChunkReader<R> {
    type Item = Result<Vec<RawRecord>>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(err) = self.pending_error.take() {
            return Some(Err(err));
        }
        if self.done {
            return None;
        }

        match self.next_batch() {
            Ok(batch) if batch.is_empty() => None,
            Ok(batch) => Some(Ok(batch)),
            Err(err) => Some(Err(err)),
        }
    }
}

impl<R: Read> std::iter::FusedIterator for ChunkReader<R> {}

/// I/O failures name the file; anything else the csv reader raises is a parse failure at
/// the line it stopped on
fn read_error(source: &str, err: csv::Error) -> EtlError {
    let line = err.position().map(|p| p.line()).unwrap_or(0);
    match err.into_kind() {
        csv::ErrorKind::Io(io) => EtlError::io(source, io),
        other => EtlError::Parse {
            line,
            message: format!("{source}: {other:?}"),
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Serves `data`, then fails every further read
    struct FailAfter {
        data: Cursor<Vec<u8>>,
    }

    impl Read for FailAfter {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.data.read(buf)? {
                0 => Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "volume went away")),
                n => Ok(n),
            }
        }
    }

    fn reader(data: &[u8], batch_size: usize) -> ChunkReader<Cursor<Vec<u8>>> {
        ChunkReader::from_reader(Cursor::new(data.to_vec()), "test.csv", &CsvFormat::default(), batch_size)
            .unwrap()
    }

    #[test]
    fn test_batches_are_bounded_and_ordered() {
        let data = b"id,amt\n1,10\n2,20\n3,30\n4,40\n5,50\n";
        let batches: Vec<_> = reader(data, 2).map(|b| b.unwrap()).collect();

        let sizes: Vec<_> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);

        let ids: Vec<_> = batches.iter().flatten().map(|r| r.fields[0].clone()).collect();
        assert_eq!(ids, vec!["1", "2", "3", "4", "5"]);

        let lines: Vec<_> = batches.iter().flatten().map(|r| r.line).collect();
        assert_eq!(lines, vec![2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_read_failure_mid_stream_follows_the_records_already_read() {
        let source = FailAfter {
            data: Cursor::new(b"id,amt\n1,10\n2,20\n3,30\n".to_vec()),
        };
        let mut r = ChunkReader::from_reader(source, "flaky.csv", &CsvFormat::default(), 2).unwrap();

        let first = r.next().unwrap().unwrap();
        assert_eq!(first.len(), 2);
        let second = r.next().unwrap().unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].fields, vec!["3", "30"]);

        let err = r.next().unwrap().unwrap_err();
        assert!(matches!(err, EtlError::Io { ref path, .. } if path == "flaky.csv"));
        assert!(r.next().is_none());
    }

    #[test]
    fn test_read_failure_before_any_record_is_returned_directly() {
        let source = FailAfter {
            data: Cursor::new(b"id,amt\n".to_vec()),
        };
        let mut r = ChunkReader::from_reader(source, "flaky.csv", &CsvFormat::default(), 2).unwrap();
        assert!(matches!(r.next(), Some(Err(EtlError::Io { .. }))));
        assert!(r.next().is_none());
    }

    #[test]
    fn test_headers_are_trimmed() {
        let r = reader(b" id , amt\n1,10\n", 10);
        assert_eq!(r.headers().unwrap(), &["id".to_string(), "amt".to_string()]);
    }

    #[test]
    fn test_wrong_field_count_is_flagged_not_raised() {
        let batches: Vec<_> = reader(b"id,amt\n1,10\n2\n3,30,extra\n", 10)
            .map(|b| b.unwrap())
            .collect();
        let records = &batches[0];

        assert_eq!(records.len(), 3);
        assert!(!records[0].is_malformed());
        assert_eq!(records[1].malformed.as_deref(), Some("expected 2 fields, found 1"));
        assert!(records[2].is_malformed());
    }

    #[test]
    fn test_unterminated_quote_is_flagged() {
        let batches: Vec<_> = reader(b"id,name\n1,\"open\n2,b\n", 10)
            .map(|b| b.unwrap())
            .collect();
        let records = &batches[0];

        assert_eq!(records.len(), 1);
        assert!(records[0]
            .malformed
            .as_deref()
            .unwrap()
            .contains("unterminated quote"));
    }

    #[test]
    fn test_multiline_fields_allowed_when_configured() {
        let format = CsvFormat {
            allow_multiline: true,
            ..CsvFormat::default()
        };
        let data = b"id,note\n1,\"two\nlines\"\n2,plain\n".to_vec();
        let records: Vec<_> = ChunkReader::from_reader(Cursor::new(data), "m.csv", &format, 10)
            .unwrap()
            .flat_map(|b| b.unwrap())
            .collect();

        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| !r.is_malformed()));
        assert_eq!(records[0].fields[1], "two\nlines");
    }

    #[test]
    fn test_invalid_utf8_is_malformed_but_latin1_decodes() {
        let data = b"id,name\n1,caf\xe9\n".to_vec();

        let utf8: Vec<_> = reader(&data, 10).flat_map(|b| b.unwrap()).collect();
        assert!(utf8[0].malformed.as_deref().unwrap().contains("invalid utf-8"));

        let format = CsvFormat {
            encoding: TextEncoding::Latin1,
            ..CsvFormat::default()
        };
        let latin1: Vec<_> = ChunkReader::from_reader(Cursor::new(data), "l.csv", &format, 10)
            .unwrap()
            .flat_map(|b| b.unwrap())
            .collect();
        assert_eq!(latin1[0].fields[1], "café");
        assert!(!latin1[0].is_malformed());
    }

    #[test]
    fn test_custom_delimiter_and_no_header() {
        let format = CsvFormat {
            delimiter: b';',
            quote: b'\'',
            has_header: false,
            ..CsvFormat::default()
        };
        let data = b"1;'a;b'\n2;c\n".to_vec();
        let mut r = ChunkReader::from_reader(Cursor::new(data), "s.csv", &format, 10).unwrap();
        assert!(r.headers().is_none());

        let records = r.next().unwrap().unwrap();
        assert_eq!(records[0].fields, vec!["1", "a;b"]);
        assert_eq!(records[0].line, 1);
        assert!(r.next().is_none());
        assert!(r.next().is_none());
    }

    #[test]
    fn test_empty_file_yields_nothing() {
        assert_eq!(reader(b"", 5).count(), 0);
        assert_eq!(reader(b"id,amt\n", 5).count(), 0);
    }

    #[test]
    fn test_open_missing_file_is_io_error() {
        let result = ChunkReader::open("/no/such/dir/file.csv", &CsvFormat::default(), 10);
        assert!(matches!(result, Err(EtlError::Io { .. })));
    }

    #[test]
    fn test_zero_batch_size_is_configuration_error() {
        let result =
            ChunkReader::from_reader(Cursor::new(Vec::new()), "z.csv", &CsvFormat::default(), 0);
        assert!(matches!(result, Err(EtlError::Configuration(_))));
    }

    #[test]
    fn test_encoding_names() {
        assert_eq!("UTF-8".parse::<TextEncoding>().unwrap(), TextEncoding::Utf8);
        assert_eq!("iso_8859_1".parse::<TextEncoding>().unwrap(), TextEncoding::Latin1);
        assert!("shift-jis".parse::<TextEncoding>().is_err());
    }
}
