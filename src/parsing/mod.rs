pub mod extractor;
pub mod filter;
pub mod lines;

pub use extractor::{
    pressure_from_current, ExtractorConfig, FieldUpdate, Label, LineGrammar, ProtocolVariant,
    ReadingExtractor,
};
pub use filter::MovingAverage;
pub use lines::LineReassembler;
