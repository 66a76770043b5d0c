//! Relation resolution: join conditions, fetch behavior, junction-row deltas.

use crate::error::{OrmError, Result};
use crate::schema::SchemaRegistry;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Association cardinality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    OneToOne,
    OneToMany,
    ManyToMany,
}

/// Whether a relation is resolved at load time or on first access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMode {
    Eager,
    #[default]
    Lazy,
}

/// Junction table backing a many-to-many relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinTable {
    pub table: String,
    pub source_column: String,
    pub target_column: String,
}

impl JoinTable {
    pub fn new(
        table: impl Into<String>,
        source_column: impl Into<String>,
        target_column: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            source_column: source_column.into(),
            target_column: target_column.into(),
        }
    }
}

/// Descriptor attached to a relation-typed attribute.
///
/// The side without `mapped_by` is the owning side: it persists the foreign
/// key (to-one/to-many) or the junction rows (many-to-many).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationDescriptor {
    pub relation_type: RelationType,
    pub target_entity: String,
    /// Foreign-key-bearing attribute on the owning side. Defaults to the
    /// attribute's own name when unset.
    pub join_attribute: Option<String>,
    /// Set on the inverse side of a bidirectional relation; names the owning
    /// attribute on the target entity.
    pub mapped_by: Option<String>,
    pub join_table: Option<JoinTable>,
    pub fetch: FetchMode,
}

impl RelationDescriptor {
    pub fn one_to_one(target_entity: impl Into<String>) -> Self {
        Self {
            relation_type: RelationType::OneToOne,
            target_entity: target_entity.into(),
            join_attribute: None,
            mapped_by: None,
            join_table: None,
            fetch: FetchMode::default(),
        }
    }

    pub fn one_to_many(target_entity: impl Into<String>) -> Self {
        Self {
            relation_type: RelationType::OneToMany,
            target_entity: target_entity.into(),
            join_attribute: None,
            mapped_by: None,
            join_table: None,
            fetch: FetchMode::default(),
        }
    }

    pub fn many_to_many(target_entity: impl Into<String>, join_table: JoinTable) -> Self {
        Self {
            relation_type: RelationType::ManyToMany,
            target_entity: target_entity.into(),
            join_attribute: None,
            mapped_by: None,
            join_table: Some(join_table),
            fetch: FetchMode::default(),
        }
    }

    pub fn join_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.join_attribute = Some(attribute.into());
        self
    }

    pub fn mapped_by(mut self, attribute: impl Into<String>) -> Self {
        self.mapped_by = Some(attribute.into());
        self
    }

    pub fn eager(mut self) -> Self {
        self.fetch = FetchMode::Eager;
        self
    }

    /// The owning side persists foreign keys or junction rows.
    pub fn is_owning(&self) -> bool {
        self.mapped_by.is_none()
    }

    /// Physical foreign-key column for an owning to-one/to-many attribute.
    pub fn join_column(&self, attribute_name: &str) -> String {
        self.join_attribute
            .clone()
            .unwrap_or_else(|| attribute_name.to_string())
    }
}

/// Deferred reference produced for lazily fetched relations.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationRef {
    pub target_entity: String,
    /// Foreign-key value (owning side) or the owner's identifier
    /// (inverse/junction side).
    pub key: Value,
}

/// How a single relation attribute is materialized at load time.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadAction {
    /// Owning to-one/to-many: follow this row's foreign-key column to the
    /// target's identifier.
    FollowForeignKey { fk_column: String },
    /// Inverse side: collect target rows whose owning attribute points back
    /// at this row's identifier.
    CollectByForeignKey { fk_attribute: String },
    /// Many-to-many: join through the junction table.
    JoinThroughJunction { join_table: JoinTable },
}

/// One entry of the per-class relation load plan.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadStep {
    pub attribute: String,
    pub target_entity: String,
    pub fetch: FetchMode,
    pub action: LoadAction,
}

/// Idempotent reconciliation of a many-to-many relation: only the delta
/// between the stored and the desired related-id sets is written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JunctionDelta {
    pub insert: Vec<Value>,
    pub remove: Vec<Value>,
}

impl JunctionDelta {
    pub fn is_empty(&self) -> bool {
        self.insert.is_empty() && self.remove.is_empty()
    }
}

/// Computes the junction-row delta between the currently stored related ids
/// and the desired set. Output is sorted by rendered value so repeated saves
/// emit identical statement sequences.
pub fn junction_delta(stored: &[Value], desired: &[Value]) -> JunctionDelta {
    let mut insert: Vec<Value> = desired
        .iter()
        .filter(|id| !stored.contains(id))
        .cloned()
        .collect();
    let mut remove: Vec<Value> = stored
        .iter()
        .filter(|id| !desired.contains(id))
        .cloned()
        .collect();

    insert.sort_by_key(|v| v.to_string());
    remove.sort_by_key(|v| v.to_string());
    insert.dedup();
    remove.dedup();

    JunctionDelta { insert, remove }
}

/// Resolves the load plan for every relation-typed attribute of a class,
/// inherited attributes included.
pub fn load_plan(registry: &SchemaRegistry, class: &str) -> Result<Vec<LoadStep>> {
    let mut steps = Vec::new();

    for attr in registry.attributes_of(class, true)? {
        let Some(relation) = &attr.relation else {
            continue;
        };

        // The target must be registered; relations to unknown classes are a
        // registration-order bug surfaced on first use.
        registry.resolve(&relation.target_entity)?;

        let action = match relation.relation_type {
            RelationType::ManyToMany => {
                let join_table = match (&relation.join_table, &relation.mapped_by) {
                    (Some(jt), _) => jt.clone(),
                    // Inverse side: reuse the owning side's junction table
                    // with its columns flipped.
                    (None, Some(owning_attr)) => {
                        let jt = owning_junction(registry, &relation.target_entity, owning_attr)?;
                        JoinTable::new(jt.table, jt.target_column, jt.source_column)
                    }
                    (None, None) => {
                        return Err(OrmError::Query(format!(
                            "many-to-many attribute {}.{} has no join table",
                            class, attr.name
                        )))
                    }
                };
                LoadAction::JoinThroughJunction { join_table }
            }
            RelationType::OneToOne | RelationType::OneToMany => {
                if let Some(owning_attr) = &relation.mapped_by {
                    // Validates that mapped_by names an owning relation.
                    owning_join_column(registry, &relation.target_entity, owning_attr)?;
                    LoadAction::CollectByForeignKey {
                        fk_attribute: owning_attr.clone(),
                    }
                } else {
                    LoadAction::FollowForeignKey {
                        fk_column: relation.join_column(&attr.name),
                    }
                }
            }
        };

        steps.push(LoadStep {
            attribute: attr.name.clone(),
            target_entity: relation.target_entity.clone(),
            fetch: relation.fetch,
            action,
        });
    }

    Ok(steps)
}

/// Looks up the junction table declared by the owning many-to-many attribute
/// named by `mapped_by` on the target entity.
fn owning_junction(
    registry: &SchemaRegistry,
    target_entity: &str,
    owning_attr: &str,
) -> Result<JoinTable> {
    for attr in registry.attributes_of(target_entity, true)? {
        if attr.name == owning_attr {
            return attr
                .relation
                .as_ref()
                .filter(|rel| rel.relation_type == RelationType::ManyToMany)
                .and_then(|rel| rel.join_table.clone())
                .ok_or_else(|| {
                    OrmError::Query(format!(
                        "mapped_by points at {}.{}, which declares no junction table",
                        target_entity, owning_attr
                    ))
                });
        }
    }
    Err(OrmError::Query(format!(
        "mapped_by points at unknown attribute {}.{}",
        target_entity, owning_attr
    )))
}

/// Looks up the physical foreign-key column behind the owning attribute named
/// by `mapped_by` on the target entity.
fn owning_join_column(
    registry: &SchemaRegistry,
    target_entity: &str,
    owning_attr: &str,
) -> Result<String> {
    for attr in registry.attributes_of(target_entity, true)? {
        if attr.name == owning_attr {
            let relation = attr.relation.as_ref().ok_or_else(|| {
                OrmError::Query(format!(
                    "mapped_by points at {}.{}, which is not a relation attribute",
                    target_entity, owning_attr
                ))
            })?;
            if !relation.is_owning() {
                return Err(OrmError::Query(format!(
                    "mapped_by points at {}.{}, which is itself an inverse side",
                    target_entity, owning_attr
                )));
            }
            return Ok(relation.join_column(&attr.name));
        }
    }
    Err(OrmError::Query(format!(
        "mapped_by points at unknown attribute {}.{}",
        target_entity, owning_attr
    )))
}
