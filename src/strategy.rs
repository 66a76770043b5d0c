//! Inheritance strategy resolution: which tables, joins, and filters apply
//! when querying one entity class.

use crate::error::Result;
use crate::schema::{InheritanceStrategy, SchemaRegistry};

/// One ancestor table participating in a joined-table query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableJoin {
    pub table: String,
    /// Rendered identifier-equality condition, `child.id = ancestor.id`.
    pub on: String,
}

impl TableJoin {
    pub fn to_sql(&self) -> String {
        format!("INNER JOIN {} ON {}", self.table, self.on)
    }
}

/// Resolved set of tables, joins, and filters for querying one entity class
/// under its active inheritance strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingPlan {
    pub primary_table: String,
    /// Participating ancestor tables, nearest parent first, root last.
    pub joins: Vec<TableJoin>,
    /// Discriminator (column, value) filter for single-table subclasses.
    pub discriminator: Option<(String, String)>,
}

impl MappingPlan {
    pub fn has_joins(&self) -> bool {
        !self.joins.is_empty()
    }
}

/// Resolves the mapping plan for an entity class.
///
/// - `joined_table`: one INNER JOIN per ancestor, chained by identifier
///   equality from the leaf table up to the root; no discriminator.
/// - `single_table`: no joins; the root's table is primary, filtered by the
///   class's discriminator value when it has one.
/// - `table_per_class`: no joins, no discriminator; the class's own table
///   already carries every inherited column.
pub fn mapping_plan(registry: &SchemaRegistry, class: &str) -> Result<MappingPlan> {
    let strategy = registry.effective_strategy(class)?;

    match strategy {
        InheritanceStrategy::JoinedTable => {
            let chain = registry.ancestry(class)?;
            let identifier = registry.identifier_of(class)?.name.clone();
            let primary_table = chain[chain.len() - 1].table.clone();

            // Walk leaf to root; each ancestor joins against its immediate
            // child table so the chain stays connected.
            let mut joins = Vec::new();
            for pair in chain.windows(2).rev() {
                let (parent, child) = (&pair[0], &pair[1]);
                joins.push(TableJoin {
                    table: parent.table.clone(),
                    on: format!(
                        "{}.{} = {}.{}",
                        child.table, identifier, parent.table, identifier
                    ),
                });
            }

            Ok(MappingPlan {
                primary_table,
                joins,
                discriminator: None,
            })
        }
        InheritanceStrategy::SingleTable => Ok(MappingPlan {
            primary_table: registry.root_of(class)?.table.clone(),
            joins: Vec::new(),
            discriminator: registry.discriminator_of(class)?,
        }),
        InheritanceStrategy::TablePerClass => Ok(MappingPlan {
            primary_table: registry.resolve(class)?.table.clone(),
            joins: Vec::new(),
            discriminator: None,
        }),
    }
}
