pub mod loaders;
pub mod run;
pub mod table;

pub use loaders::load_metadata_schema;
pub use run::{RunMetadata, RunReport, RunStatus, RunSummary, Stage};
pub use table::{AggregatedTable, AggregatedTables, CsvTable, ExportRecord, PageResult, Row, Table};
