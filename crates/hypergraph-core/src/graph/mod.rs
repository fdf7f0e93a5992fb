//! Graph data model and table storage

pub mod model;
pub mod table;

pub use model::{
    Community, Covariate, Document, Entity, Relationship, TextUnit, extend_unique, tables,
};
pub use table::{
    JsonlTableProvider, MemoryTableProvider, Row, StagedTableProvider, TableProvider,
    read_records, read_records_or_empty, to_row, write_records,
};
