//! Resource schemas and records.
//!
//! A schema is declared once at model-registration time and never changes at
//! runtime. Records are the concrete rows the external storage layer hands to
//! the core for record-level checks and output projection.

pub mod catalog;
pub mod model;
pub mod record;

pub use catalog::SchemaCatalog;
pub use model::{AttributeDef, AttributeType, ParentRef, ResourceSchema};
pub use record::Record;
