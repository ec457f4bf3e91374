pub mod encoder;
pub mod sink;

pub use encoder::{encode, export_filename, CsvDocument, ExportFormat, ExportKind, ExportSelection};
pub use sink::FileSink;
