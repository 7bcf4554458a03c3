//! Extract stage: streaming delimited files into bounded batches

pub mod reader;

pub use reader::{ChunkReader, CsvFormat, SourceReader, TextEncoding};
