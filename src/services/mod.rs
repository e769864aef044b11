pub mod aggregator;
pub mod csv_fragments;
pub mod exporter;
pub mod extraction_service;
pub mod response_parser;
pub mod splitter;

pub use aggregator::{aggregate, MergePolicy};
pub use exporter::Exporter;
pub use extraction_service::{extractor_from_config, ExtractionService, MockExtractor, OpenAiExtractor};
pub use response_parser::{parse_extraction_response, ParsedExtraction};
pub use splitter::{splitter_for, DocumentSplitter, PassthroughSplitter, PdfSplitter};
