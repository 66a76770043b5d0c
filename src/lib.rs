//! Lightweight object-relational mapping core.
//!
//! Entity classes are described once in a [`schema::SchemaRegistry`] —
//! attributes, identifiers, relations, and one of three inheritance-mapping
//! strategies (joined-table, single-table, table-per-class). The
//! [`manager::EntityManager`] facade turns those descriptors into SQL through
//! the query generator and executes it against a pluggable
//! [`engine::StorageEngine`] backend, with nested named transactions per
//! connection.
//!
//! ```no_run
//! use relmap::{AttributeDescriptor, DataType, EntityClass, SchemaRegistry};
//! use relmap::{ConnectionParams, EngineRegistry, Entity, EntityManager};
//! use serde_json::json;
//!
//! # async fn demo() -> relmap::Result<()> {
//! let mut registry = SchemaRegistry::new();
//! registry.register(
//!     EntityClass::new("Animal")
//!         .attribute(
//!             AttributeDescriptor::new("id", DataType::BigInt)
//!                 .identifier()
//!                 .generated(),
//!         )
//!         .attribute(AttributeDescriptor::new("name", DataType::Text)),
//! )?;
//!
//! let manager = EntityManager::new(registry);
//! let engines = EngineRegistry::with_defaults();
//! let mut conn = manager
//!     .connect(
//!         &engines,
//!         "sqlite",
//!         &ConnectionParams::new().set("path", ":memory:"),
//!     )
//!     .await?;
//!
//! manager.create_entity_definition(&mut conn, "Animal").await?;
//! let saved = manager
//!     .save(&mut conn, Entity::new("Animal").set("name", json!("Rex")))
//!     .await?;
//! assert!(saved.get("id").is_some());
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod error;
pub mod manager;
pub mod query;
pub mod relation;
pub mod schema;
pub mod strategy;
pub mod transaction;

#[cfg(feature = "mysql")]
pub mod mysql;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use engine::{ConnectionParams, Dialect, EngineRegistry, Row, RowSet, StorageEngine};
pub use error::{OrmError, Result};
pub use manager::{Connection, Entity, EntityManager, RelationValue};
pub use query::{FilterMap, Statement, ValueMap};
pub use relation::{FetchMode, JoinTable, RelationDescriptor, RelationType};
pub use schema::{
    AttributeDescriptor, DataType, EntityClass, GeneratorStrategy, InheritanceStrategy,
    SchemaRegistry,
};
