//! Service definition aggregate and authoring use cases.
//!
//! The catalog depends on the repository trait (port), never on a concrete
//! storage implementation.

pub mod catalog;
pub mod definition;

pub use catalog::{CatalogError, ServiceCatalog};
pub use definition::ServiceDefinition;
