//! Plaintext and gzip-compressed file input and output.
//!
//! Instrument exports are usually plain CSV, but archived runs are often
//! gzipped. [`InputFile`] sniffs the gzip magic number so either can be
//! read through one interface, and [`OutputFile`] compresses whenever the
//! output path ends in `.gz`.
//!
use csv::{Reader, ReaderBuilder};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FileError {
    #[error("IO error on '{path}': {source}")]
    IOError { path: String, source: io::Error },
}

impl FileError {
    fn io(path: &Path, source: io::Error) -> Self {
        FileError::IOError {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Check if a file is gzipped by looking for the magic numbers.
fn is_gzipped_file(file_path: &Path) -> io::Result<bool> {
    let mut file = File::open(file_path)?;
    let mut buffer = [0; 2];
    match file.read_exact(&mut buffer) {
        Ok(()) => Ok(buffer == [0x1f, 0x8b]),
        // files shorter than two bytes cannot be gzip
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// An input table, possibly gzip-compressed.
#[derive(Debug, Clone)]
pub struct InputFile {
    pub filepath: PathBuf,
}

impl InputFile {
    /// Constructs a new `InputFile`.
    pub fn new<P: AsRef<Path>>(filepath: P) -> Self {
        Self {
            filepath: filepath.as_ref().to_path_buf(),
        }
    }

    /// Opens the file and returns a buffered reader, decompressing if the
    /// file starts with the gzip magic number.
    pub fn reader(&self) -> Result<BufReader<Box<dyn Read>>, FileError> {
        let path = &self.filepath;
        let file = File::open(path).map_err(|e| FileError::io(path, e))?;
        let is_gzipped = is_gzipped_file(path).map_err(|e| FileError::io(path, e))?;
        let reader: Box<dyn Read> = if is_gzipped {
            Box::new(GzDecoder::new(file))
        } else {
            Box::new(file)
        };
        Ok(BufReader::new(reader))
    }

    /// Checks if the first line of the file starts with `expect`.
    pub fn has_header(&self, expect: &str) -> Result<bool, FileError> {
        let mut buf_reader = self.reader()?;
        let mut first_line = String::new();
        buf_reader
            .read_line(&mut first_line)
            .map_err(|e| FileError::io(&self.filepath, e))?;
        // CSV exports from Windows tools often carry a UTF-8 BOM
        let first_line = first_line.trim_start_matches('\u{feff}');
        Ok(first_line.starts_with(expect))
    }

    /// Opens a headed, delimited CSV reader over the (possibly compressed)
    /// file. Rows may have differing numbers of fields.
    pub fn csv_reader(&self, delimiter: u8) -> Result<Reader<BufReader<Box<dyn Read>>>, FileError> {
        let buf_reader = self.reader()?;
        Ok(ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(buf_reader))
    }
}

/// An output file, gzip-compressed when the path ends in `.gz`.
pub struct OutputFile {
    pub filepath: PathBuf,
    pub header: Option<Vec<String>>,
}

impl OutputFile {
    /// Constructs a new `OutputFile`.
    ///
    /// # Arguments
    ///
    /// * `filepath` - the path to write to.
    /// * `header` - optional lines written first, each prefixed with `#`.
    pub fn new<P: AsRef<Path>>(filepath: P, header: Option<Vec<String>>) -> Self {
        Self {
            filepath: filepath.as_ref().to_path_buf(),
            header,
        }
    }

    /// Creates the file and returns a buffered writer, with any header
    /// lines already written. Call [`OutputWriter::finish`] when done so
    /// that errors completing a gzip stream are reported.
    pub fn open(&self) -> Result<OutputWriter, FileError> {
        let outfile = &self.filepath;
        let is_gzip = outfile
            .extension()
            .map_or(false, |ext| ext.eq_ignore_ascii_case("gz"));
        let file = File::create(outfile).map_err(|e| FileError::io(outfile, e))?;
        let mut writer = if is_gzip {
            OutputWriter::Gzip(BufWriter::new(GzEncoder::new(file, Compression::default())))
        } else {
            OutputWriter::Plain(BufWriter::new(file))
        };
        if let Some(entries) = &self.header {
            for entry in entries {
                writeln!(writer, "#{}", entry).map_err(|e| FileError::io(outfile, e))?;
            }
        }
        Ok(writer)
    }
}

/// A buffered writer over a plain or gzip-compressed file.
pub enum OutputWriter {
    Plain(BufWriter<File>),
    Gzip(BufWriter<GzEncoder<File>>),
}

impl OutputWriter {
    /// Flush all buffered data and, for gzip, write the stream trailer.
    pub fn finish(self) -> io::Result<()> {
        match self {
            OutputWriter::Plain(mut writer) => writer.flush(),
            OutputWriter::Gzip(writer) => {
                let encoder = writer.into_inner().map_err(|e| e.into_error())?;
                encoder.finish()?;
                Ok(())
            }
        }
    }
}

impl Write for OutputWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            OutputWriter::Plain(writer) => writer.write(buf),
            OutputWriter::Gzip(writer) => writer.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            OutputWriter::Plain(writer) => writer.flush(),
            OutputWriter::Gzip(writer) => writer.flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::tempdir;

    #[test]
    fn test_gzip_output_is_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plate.csv.gz");
        let out = OutputFile::new(&path, Some(vec!["run NIOZ385".to_string()]));
        let mut w = out.open().unwrap();
        assert!(matches!(w, OutputWriter::Gzip(_)));
        writeln!(w, "Sample,Cq").unwrap();
        writeln!(w, "STD,20.1").unwrap();
        w.finish().unwrap();
        let input = InputFile::new(&path);
        assert!(input.has_header("#run").unwrap());
        let mut contents = String::new();
        input.reader().unwrap().read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "#run NIOZ385\nSample,Cq\nSTD,20.1\n");
    }

    #[test]
    fn test_plain_output_finish() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("table.tsv");
        let mut w = OutputFile::new(&path, None).open().unwrap();
        assert!(matches!(w, OutputWriter::Plain(_)));
        writeln!(w, "Sample\tCq").unwrap();
        w.finish().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "Sample\tCq\n");
    }

    #[test]
    fn test_has_header_skips_bom() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bom.csv");
        std::fs::write(&path, "\u{feff}Sample,Cq\nA,1\n").unwrap();
        assert!(InputFile::new(&path).has_header("Sample").unwrap());
    }

    #[test]
    fn test_missing_file_reports_path() {
        match InputFile::new("does/not/exist.csv").reader() {
            Ok(_) => panic!("reading a missing file succeeded"),
            Err(err) => assert!(err.to_string().contains("does/not/exist.csv")),
        }
    }
}
