//! Pipeline stage implementations.
//!
//! - [`EnrichStage`] attaches a lookup-derived activity object to each record
//! - [`RemapStage`] reshapes records with a pluggable [`MappingExpression`]
//! - [`DispatchStage`] sends each record to a learning record store

mod dispatch;
mod enrich;
mod remap;

pub use dispatch::{DispatchStage, LrsConfig};
pub use enrich::{fallback_object, EnrichStage, LookupTable};
pub use remap::{
    Bindings, FnExpression, Mapped, MappingError, MappingExpression, RemapStage, TemplateExpression,
};
