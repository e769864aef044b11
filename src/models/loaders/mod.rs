pub mod schema_loader;

pub use schema_loader::load_metadata_schema;
