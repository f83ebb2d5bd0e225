//! Delimited-text codec.
//!
//! Source files are CSV, usually gzip-compressed. Normalization parses every
//! record (so structural damage surfaces as a [`FormatError`] instead of a bad
//! warehouse load) and re-encodes it as plain CSV. Records stream from the
//! decoder to the writer one at a time; nothing is materialized in memory.
//!
//! [`Table`] is the fully materialized form, used where a whole file has to be
//! compared or inspected.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;
use thiserror::Error;

/// Compression applied to a source file, inferred from its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
}

impl Compression {
    pub fn from_file_name(name: &str) -> Self {
        if name.ends_with(".gz") {
            Compression::Gzip
        } else {
            Compression::None
        }
    }

    pub fn from_path(path: &Path) -> Self {
        path.file_name()
            .and_then(|n| n.to_str())
            .map(Self::from_file_name)
            .unwrap_or(Compression::None)
    }

    pub fn suffix(self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            Compression::Gzip => Some(".gz"),
        }
    }
}

/// File name with its compression suffix removed (`a.csv.gz` → `a.csv`).
pub fn uncompressed_file_name(name: &str) -> String {
    match Compression::from_file_name(name).suffix() {
        Some(suffix) => name[..name.len() - suffix.len()].to_string(),
        None => name.to_string(),
    }
}

/// Unparseable tabular content.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("{path}: no header row")]
    MissingHeader { path: PathBuf },

    #[error("{path}: record {record} (line {line}) has {found} fields, expected {expected}")]
    Ragged {
        path: PathBuf,
        record: u64,
        line: u64,
        expected: u64,
        found: u64,
    },

    #[error("{path}: invalid UTF-8 in record {record} (line {line})")]
    Encoding { path: PathBuf, record: u64, line: u64 },

    #[error("{path}: failed to decompress: {source}")]
    Decompress {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

impl FormatError {
    fn from_read(path: &Path, compression: Compression, err: csv::Error) -> Self {
        let path = path.to_path_buf();
        match err.into_kind() {
            csv::ErrorKind::UnequalLengths {
                pos,
                expected_len,
                len,
            } => {
                let (record, line) = pos.map(|p| (p.record(), p.line())).unwrap_or((0, 0));
                FormatError::Ragged {
                    path,
                    record,
                    line,
                    expected: expected_len,
                    found: len,
                }
            }
            csv::ErrorKind::Utf8 { pos, .. } => {
                let (record, line) = pos.map(|p| (p.record(), p.line())).unwrap_or((0, 0));
                FormatError::Encoding { path, record, line }
            }
            csv::ErrorKind::Io(source) if compression == Compression::Gzip => {
                FormatError::Decompress { path, source }
            }
            csv::ErrorKind::Io(source) => FormatError::Io { path, source },
            other => FormatError::Csv {
                path,
                source: csv::Error::from(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("{other:?}"),
                )),
            },
        }
    }

    fn from_write(path: &Path, err: csv::Error) -> Self {
        match err.into_kind() {
            csv::ErrorKind::Io(source) => FormatError::Io {
                path: path.to_path_buf(),
                source,
            },
            other => FormatError::Csv {
                path: path.to_path_buf(),
                source: csv::Error::from(io::Error::new(
                    io::ErrorKind::Other,
                    format!("{other:?}"),
                )),
            },
        }
    }
}

/// Open a file for reading, transparently inflating gzip.
fn open_source(path: &Path) -> Result<(Box<dyn Read>, Compression), FormatError> {
    let compression = Compression::from_path(path);
    let file = File::open(path).map_err(|source| FormatError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let reader = BufReader::new(file);
    let reader: Box<dyn Read> = match compression {
        Compression::Gzip => Box::new(MultiGzDecoder::new(reader)),
        Compression::None => Box::new(reader),
    };
    Ok((reader, compression))
}

fn csv_reader<R: Read>(reader: R) -> csv::Reader<R> {
    csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .from_reader(reader)
}

/// Counts from one normalization pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizeStats {
    /// Data rows, header excluded.
    pub rows: u64,
    pub columns: usize,
    pub bytes_written: u64,
}

/// Parse `src` (decompressing if needed) and write it as plain CSV to `dst`.
pub fn normalize_csv(src: &Path, dst: &Path) -> Result<NormalizeStats, FormatError> {
    if src == dst {
        return Err(FormatError::Io {
            path: dst.to_path_buf(),
            source: io::Error::new(
                io::ErrorKind::InvalidInput,
                "source and destination are the same file",
            ),
        });
    }
    let (reader, compression) = open_source(src)?;
    let mut rdr = csv_reader(reader);

    let headers = rdr
        .headers()
        .map_err(|e| FormatError::from_read(src, compression, e))?
        .clone();
    if headers.is_empty() {
        return Err(FormatError::MissingHeader {
            path: src.to_path_buf(),
        });
    }

    let out = File::create(dst).map_err(|source| FormatError::Io {
        path: dst.to_path_buf(),
        source,
    })?;
    let mut wtr = csv::Writer::from_writer(BufWriter::new(out));
    wtr.write_record(&headers)
        .map_err(|e| FormatError::from_write(dst, e))?;

    let mut rows = 0u64;
    let mut record = csv::StringRecord::new();
    loop {
        let more = rdr
            .read_record(&mut record)
            .map_err(|e| FormatError::from_read(src, compression, e))?;
        if !more {
            break;
        }
        wtr.write_record(&record)
            .map_err(|e| FormatError::from_write(dst, e))?;
        rows += 1;
    }

    let mut inner = wtr.into_inner().map_err(|e| FormatError::Io {
        path: dst.to_path_buf(),
        source: e.into_error(),
    })?;
    inner.flush().map_err(|source| FormatError::Io {
        path: dst.to_path_buf(),
        source,
    })?;
    drop(inner);

    let bytes_written = std::fs::metadata(dst)
        .map_err(|source| FormatError::Io {
            path: dst.to_path_buf(),
            source,
        })?
        .len();

    Ok(NormalizeStats {
        rows,
        columns: headers.len(),
        bytes_written,
    })
}

/// A fully materialized delimited table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    /// Read a CSV file (gzip when the name ends in `.gz`).
    pub fn read(path: &Path) -> Result<Self, FormatError> {
        let (reader, compression) = open_source(path)?;
        let mut rdr = csv_reader(reader);

        let headers: Vec<String> = rdr
            .headers()
            .map_err(|e| FormatError::from_read(path, compression, e))?
            .iter()
            .map(String::from)
            .collect();
        if headers.is_empty() {
            return Err(FormatError::MissingHeader {
                path: path.to_path_buf(),
            });
        }

        let mut rows = Vec::new();
        for record in rdr.records() {
            let record = record.map_err(|e| FormatError::from_read(path, compression, e))?;
            rows.push(record.iter().map(String::from).collect());
        }

        Ok(Self { headers, rows })
    }

    /// Write as plain CSV.
    pub fn write(&self, path: &Path) -> Result<(), FormatError> {
        let file = File::create(path).map_err(|source| FormatError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut wtr = csv::Writer::from_writer(BufWriter::new(file));
        wtr.write_record(&self.headers)
            .map_err(|e| FormatError::from_write(path, e))?;
        for row in &self.rows {
            wtr.write_record(row)
                .map_err(|e| FormatError::from_write(path, e))?;
        }
        wtr.flush().map_err(|source| FormatError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.headers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;

    const SAMPLE: &str = "VendorID,lpep_pickup_datetime,fare_amount\n\
                          2,2021-01-01 00:15:56,8.5\n\
                          1,2021-01-01 00:25:59,\"1,000.0\"\n\
                          ,2021-01-01 00:45:57,4.0\n";

    fn write_gz(path: &Path, body: &[u8]) {
        let file = File::create(path).unwrap();
        let mut enc = GzEncoder::new(file, flate2::Compression::default());
        enc.write_all(body).unwrap();
        enc.finish().unwrap();
    }

    #[test]
    fn strips_compression_suffix() {
        assert_eq!(uncompressed_file_name("a_2021-01.csv.gz"), "a_2021-01.csv");
        assert_eq!(uncompressed_file_name("a.csv"), "a.csv");
        assert_eq!(Compression::from_file_name("x.csv.gz"), Compression::Gzip);
        assert_eq!(Compression::from_file_name("x.csv"), Compression::None);
    }

    #[test]
    fn normalizes_gzip_to_plain_csv() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("t.csv.gz");
        let dst = dir.path().join("t.csv");
        write_gz(&src, SAMPLE.as_bytes());

        let stats = normalize_csv(&src, &dst).unwrap();
        assert_eq!(stats.rows, 3);
        assert_eq!(stats.columns, 3);

        let written = std::fs::read_to_string(&dst).unwrap();
        assert_eq!(written, SAMPLE);
        assert_eq!(stats.bytes_written, written.len() as u64);
    }

    #[test]
    fn refuses_to_normalize_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("t.csv");
        std::fs::write(&src, SAMPLE).unwrap();

        let err = normalize_csv(&src, &src).unwrap_err();
        assert!(matches!(err, FormatError::Io { .. }), "{err:?}");
        assert_eq!(std::fs::read_to_string(&src).unwrap(), SAMPLE);
    }

    #[test]
    fn ragged_row_is_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("bad.csv");
        std::fs::write(&src, "a,b\n1,2\n3\n").unwrap();
        let err = normalize_csv(&src, &dir.path().join("out.csv")).unwrap_err();
        assert!(matches!(err, FormatError::Ragged { expected: 2, found: 1, .. }), "{err:?}");
    }

    #[test]
    fn invalid_utf8_is_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("bad.csv");
        std::fs::write(&src, b"a,b\n1,\xff\xfe\n").unwrap();
        let err = normalize_csv(&src, &dir.path().join("out.csv")).unwrap_err();
        assert!(matches!(err, FormatError::Encoding { .. }), "{err:?}");
    }

    #[test]
    fn corrupt_gzip_is_decompress_error() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("bad.csv.gz");
        std::fs::write(&src, b"this is not gzip at all").unwrap();
        let err = normalize_csv(&src, &dir.path().join("out.csv")).unwrap_err();
        assert!(matches!(err, FormatError::Decompress { .. }), "{err:?}");
    }

    #[test]
    fn empty_file_has_no_header() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("empty.csv");
        std::fs::write(&src, "").unwrap();
        let err = Table::read(&src).unwrap_err();
        assert!(matches!(err, FormatError::MissingHeader { .. }));
    }

    #[test]
    fn table_reread_is_identical() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("t.csv.gz");
        write_gz(&src, SAMPLE.as_bytes());

        let first = Table::read(&src).unwrap();
        let plain = dir.path().join("t.csv");
        first.write(&plain).unwrap();
        let second = Table::read(&plain).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.row_count(), 3);
        assert_eq!(first.headers[0], "VendorID");
        assert_eq!(first.rows[1][2], "1,000.0");
    }
}
