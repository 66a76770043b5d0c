//! SQL statement generation from entity descriptors and mapping plans.

use crate::error::{OrmError, Result};
use crate::relation::JoinTable;
use crate::schema::{InheritanceStrategy, SchemaRegistry};
use crate::strategy::{mapping_plan, MappingPlan};
use serde_json::Value;
use std::collections::BTreeMap;

/// Caller-supplied filter predicates, conjoined in key order.
pub type FilterMap = BTreeMap<String, Value>;

/// Attribute values of one entity instance, keyed by attribute name.
pub type ValueMap = BTreeMap<String, Value>;

/// A generated SQL statement: text with `?` placeholders plus the bound
/// parameters in order.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    /// Inlines the bound parameters into the statement text. Adapters execute
    /// rendered text; generated SQL never carries `?` inside literals.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(self.sql.len());
        let mut params = self.params.iter();
        for ch in self.sql.chars() {
            if ch == '?' {
                match params.next() {
                    Some(value) => out.push_str(&format_value(value)),
                    None => out.push(ch),
                }
            } else {
                out.push(ch);
            }
        }
        out
    }
}

/// Formats a value as a SQL literal, escaping single quotes.
pub fn format_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => b.to_string().to_uppercase(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Array(_) | Value::Object(_) => format!(
            "'{}'",
            serde_json::to_string(value)
                .unwrap_or_default()
                .replace('\'', "''")
        ),
    }
}

/// Builds the SELECT for an entity class: joins per the mapping plan, the
/// caller's filter predicates conjoined with the discriminator filter.
pub fn build_find(registry: &SchemaRegistry, class: &str, filter: &FilterMap) -> Result<Statement> {
    let plan = mapping_plan(registry, class)?;

    let mut sql = String::from("SELECT ");
    if plan.has_joins() {
        sql.push_str(&projection_columns(registry, class)?.join(", "));
    } else {
        sql.push('*');
    }
    sql.push_str(&format!(" FROM {}", plan.primary_table));

    for join in &plan.joins {
        sql.push(' ');
        sql.push_str(&join.to_sql());
    }

    let mut params = Vec::new();
    let predicates = filter_predicates(registry, class, &plan, filter, &mut params)?;
    if !predicates.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&predicates.join(" AND "));
    }

    Ok(Statement::new(sql, params))
}

/// Builds the INSERT statement sequence for an entity. Single-table and
/// table-per-class target only the primary table; joined-table emits one
/// statement per participating table, root first, so foreign keys resolve.
pub fn build_insert(
    registry: &SchemaRegistry,
    class: &str,
    values: &ValueMap,
) -> Result<Vec<Statement>> {
    let identifier = registry.identifier_of(class)?;
    let id_value = values
        .get(&identifier.name)
        .filter(|v| !v.is_null())
        .cloned()
        .ok_or_else(|| {
            OrmError::Query(format!(
                "insert into {} without identifier {}",
                class, identifier.name
            ))
        })?;

    match registry.effective_strategy(class)? {
        InheritanceStrategy::JoinedTable => {
            let mut statements = Vec::new();
            for member in registry.ancestry(class)? {
                let mut columns = vec![identifier.name.clone()];
                let mut params = vec![id_value.clone()];
                for attr in &member.attributes {
                    if attr.is_identifier {
                        continue;
                    }
                    if let (Some(column), Some(value)) =
                        (attr.column_name(), values.get(&attr.name))
                    {
                        columns.push(column);
                        params.push(value.clone());
                    }
                }
                statements.push(insert_statement(&member.table, &columns, params));
            }
            Ok(statements)
        }
        strategy => {
            let table = if strategy == InheritanceStrategy::SingleTable {
                registry.root_of(class)?.table.clone()
            } else {
                registry.resolve(class)?.table.clone()
            };
            let mut columns = vec![identifier.name.clone()];
            let mut params = vec![id_value];
            if let Some((column, value)) = registry.discriminator_of(class)? {
                columns.push(column);
                params.push(Value::String(value));
            }
            for attr in registry.attributes_of(class, true)? {
                if attr.is_identifier {
                    continue;
                }
                if let (Some(column), Some(value)) = (attr.column_name(), values.get(&attr.name)) {
                    columns.push(column);
                    params.push(value.clone());
                }
            }
            Ok(vec![insert_statement(&table, &columns, params)])
        }
    }
}

/// Builds the UPDATE statement sequence for an entity, keyed by identifier.
/// Under joined-table only tables owning at least one updated column emit a
/// statement.
pub fn build_update(
    registry: &SchemaRegistry,
    class: &str,
    values: &ValueMap,
) -> Result<Vec<Statement>> {
    let identifier = registry.identifier_of(class)?;
    let id_value = values
        .get(&identifier.name)
        .filter(|v| !v.is_null())
        .cloned()
        .ok_or_else(|| {
            OrmError::Query(format!(
                "update of {} without identifier {}",
                class, identifier.name
            ))
        })?;

    match registry.effective_strategy(class)? {
        InheritanceStrategy::JoinedTable => {
            let mut statements = Vec::new();
            for member in registry.ancestry(class)? {
                let mut assignments = Vec::new();
                let mut params = Vec::new();
                for attr in &member.attributes {
                    if attr.is_identifier {
                        continue;
                    }
                    if let (Some(column), Some(value)) =
                        (attr.column_name(), values.get(&attr.name))
                    {
                        assignments.push(format!("{} = ?", column));
                        params.push(value.clone());
                    }
                }
                if assignments.is_empty() {
                    continue;
                }
                params.push(id_value.clone());
                statements.push(Statement::new(
                    format!(
                        "UPDATE {} SET {} WHERE {} = ?",
                        member.table,
                        assignments.join(", "),
                        identifier.name
                    ),
                    params,
                ));
            }
            Ok(statements)
        }
        strategy => {
            let table = if strategy == InheritanceStrategy::SingleTable {
                registry.root_of(class)?.table.clone()
            } else {
                registry.resolve(class)?.table.clone()
            };
            let mut assignments = Vec::new();
            let mut params = Vec::new();
            for attr in registry.attributes_of(class, true)? {
                if attr.is_identifier {
                    continue;
                }
                if let (Some(column), Some(value)) = (attr.column_name(), values.get(&attr.name)) {
                    assignments.push(format!("{} = ?", column));
                    params.push(value.clone());
                }
            }
            if assignments.is_empty() {
                return Ok(Vec::new());
            }
            params.push(id_value);
            Ok(vec![Statement::new(
                format!(
                    "UPDATE {} SET {} WHERE {} = ?",
                    table,
                    assignments.join(", "),
                    identifier.name
                ),
                params,
            )])
        }
    }
}

/// Builds the DELETE statement sequence for an identifier. Joined-table
/// mirrors insert ordering in reverse: leaf table first.
pub fn build_delete(registry: &SchemaRegistry, class: &str, id: &Value) -> Result<Vec<Statement>> {
    let identifier = registry.identifier_of(class)?.name.clone();

    match registry.effective_strategy(class)? {
        InheritanceStrategy::JoinedTable => {
            let mut statements = Vec::new();
            for member in registry.ancestry(class)?.iter().rev() {
                statements.push(Statement::new(
                    format!("DELETE FROM {} WHERE {} = ?", member.table, identifier),
                    vec![id.clone()],
                ));
            }
            Ok(statements)
        }
        InheritanceStrategy::SingleTable => Ok(vec![Statement::new(
            format!(
                "DELETE FROM {} WHERE {} = ?",
                registry.root_of(class)?.table,
                identifier
            ),
            vec![id.clone()],
        )]),
        InheritanceStrategy::TablePerClass => Ok(vec![Statement::new(
            format!(
                "DELETE FROM {} WHERE {} = ?",
                registry.resolve(class)?.table,
                identifier
            ),
            vec![id.clone()],
        )]),
    }
}

/// Reads related entities of a many-to-many attribute through the junction
/// table, keyed by the owning row's identifier.
pub fn build_relation_find(
    registry: &SchemaRegistry,
    target_class: &str,
    join_table: &JoinTable,
    owner_id: &Value,
) -> Result<Statement> {
    let plan = mapping_plan(registry, target_class)?;
    let target_identifier = registry.identifier_of(target_class)?.name.clone();

    let mut sql = format!(
        "SELECT {} FROM {} INNER JOIN {} ON {}.{} = {}.{}",
        projection_columns(registry, target_class)?.join(", "),
        plan.primary_table,
        join_table.table,
        plan.primary_table,
        target_identifier,
        join_table.table,
        join_table.target_column,
    );
    for join in &plan.joins {
        sql.push(' ');
        sql.push_str(&join.to_sql());
    }

    let mut params = vec![owner_id.clone()];
    sql.push_str(&format!(
        " WHERE {}.{} = ?",
        join_table.table, join_table.source_column
    ));
    if let Some((column, value)) = &plan.discriminator {
        sql.push_str(&format!(" AND {}.{} = ?", plan.primary_table, column));
        params.push(Value::String(value.clone()));
    }

    Ok(Statement::new(sql, params))
}

/// Currently stored related ids of a junction row set.
pub fn build_junction_select(join_table: &JoinTable, owner_id: &Value) -> Statement {
    Statement::new(
        format!(
            "SELECT {} FROM {} WHERE {} = ?",
            join_table.target_column, join_table.table, join_table.source_column
        ),
        vec![owner_id.clone()],
    )
}

pub fn build_junction_insert(
    join_table: &JoinTable,
    owner_id: &Value,
    related_id: &Value,
) -> Statement {
    Statement::new(
        format!(
            "INSERT INTO {} ({}, {}) VALUES (?, ?)",
            join_table.table, join_table.source_column, join_table.target_column
        ),
        vec![owner_id.clone(), related_id.clone()],
    )
}

pub fn build_junction_delete(
    join_table: &JoinTable,
    owner_id: &Value,
    related_id: &Value,
) -> Statement {
    Statement::new(
        format!(
            "DELETE FROM {} WHERE {} = ? AND {} = ?",
            join_table.table, join_table.source_column, join_table.target_column
        ),
        vec![owner_id.clone(), related_id.clone()],
    )
}

/// Removes every junction row owned by an entity; used by remove().
pub fn build_junction_clear(join_table: &JoinTable, owner_id: &Value) -> Statement {
    Statement::new(
        format!(
            "DELETE FROM {} WHERE {} = ?",
            join_table.table, join_table.source_column
        ),
        vec![owner_id.clone()],
    )
}

/// Table-backed sequence statements. The counter row is read then bumped
/// inside the same transaction as the insert so gaps never become visible to
/// concurrent readers before commit.
pub fn build_counter_read(counter_table: &str, key: &str) -> Statement {
    Statement::new(
        format!("SELECT value FROM {} WHERE name = ?", counter_table),
        vec![Value::String(key.to_string())],
    )
}

pub fn build_counter_seed(counter_table: &str, key: &str) -> Statement {
    Statement::new(
        format!("INSERT INTO {} (name, value) VALUES (?, 0)", counter_table),
        vec![Value::String(key.to_string())],
    )
}

pub fn build_counter_bump(counter_table: &str, key: &str, next: i64) -> Statement {
    Statement::new(
        format!("UPDATE {} SET value = ? WHERE name = ?", counter_table),
        vec![Value::Number(next.into()), Value::String(key.to_string())],
    )
}

/// Qualified projection list, leaf class first so child columns stay
/// authoritative on name collision.
fn projection_columns(registry: &SchemaRegistry, class: &str) -> Result<Vec<String>> {
    let mut columns = Vec::new();
    for member in registry.ancestry(class)?.iter().rev() {
        for attr in &member.attributes {
            if let Some(column) = attr.column_name() {
                let table = registry.declaring_table(class, &attr.name)?;
                columns.push(format!("{}.{}", table, column));
            }
        }
    }
    Ok(columns)
}

fn filter_predicates(
    registry: &SchemaRegistry,
    class: &str,
    plan: &MappingPlan,
    filter: &FilterMap,
    params: &mut Vec<Value>,
) -> Result<Vec<String>> {
    let attrs = registry.attributes_of(class, true)?;
    let mut predicates = Vec::new();

    for (name, value) in filter {
        let attr = attrs
            .iter()
            .find(|a| &a.name == name)
            .ok_or_else(|| OrmError::Query(format!("unknown attribute {}.{}", class, name)))?;
        let column = attr
            .column_name()
            .ok_or_else(|| OrmError::Query(format!("attribute {}.{} has no column", class, name)))?;
        let expr = if plan.has_joins() {
            format!("{}.{}", registry.declaring_table(class, name)?, column)
        } else {
            column
        };

        match value {
            Value::Null => predicates.push(format!("{} IS NULL", expr)),
            Value::Array(items) => {
                let placeholders = vec!["?"; items.len()].join(", ");
                predicates.push(format!("{} IN ({})", expr, placeholders));
                params.extend(items.iter().cloned());
            }
            _ => {
                predicates.push(format!("{} = ?", expr));
                params.push(value.clone());
            }
        }
    }

    if let Some((column, value)) = &plan.discriminator {
        predicates.push(format!("{} = ?", column));
        params.push(Value::String(value.clone()));
    }

    Ok(predicates)
}

fn insert_statement(table: &str, columns: &[String], params: Vec<Value>) -> Statement {
    let placeholders = vec!["?"; columns.len()].join(", ");
    Statement::new(
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            columns.join(", "),
            placeholders
        ),
        params,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AttributeDescriptor, DataType, EntityClass, InheritanceStrategy};
    use serde_json::json;

    fn joined_registry() -> SchemaRegistry {
        let mut registry = SchemaRegistry::new();
        registry
            .register(
                EntityClass::new("Animal")
                    .attribute(AttributeDescriptor::new("id", DataType::BigInt).identifier())
                    .attribute(AttributeDescriptor::new("name", DataType::Text)),
            )
            .unwrap();
        registry
            .register(
                EntityClass::new("Dog")
                    .parent("Animal")
                    .attribute(AttributeDescriptor::new("breed", DataType::Text)),
            )
            .unwrap();
        registry
    }

    fn single_table_registry() -> SchemaRegistry {
        let mut registry = SchemaRegistry::new();
        registry
            .register(
                EntityClass::new("Vehicle")
                    .strategy(InheritanceStrategy::SingleTable)
                    .discriminator_column("vehicle_type")
                    .attribute(AttributeDescriptor::new("id", DataType::BigInt).identifier())
                    .attribute(AttributeDescriptor::new("wheels", DataType::Integer)),
            )
            .unwrap();
        registry
            .register(
                EntityClass::new("Car")
                    .parent("Vehicle")
                    .discriminator_value("car")
                    .attribute(AttributeDescriptor::new("doors", DataType::Integer)),
            )
            .unwrap();
        registry
    }

    #[test]
    fn find_on_joined_subclass_joins_each_ancestor() {
        let registry = joined_registry();
        let mut filter = FilterMap::new();
        filter.insert("name".to_string(), json!("Rex"));

        let stmt = build_find(&registry, "Dog", &filter).unwrap();
        let sql = stmt.render();

        assert_eq!(
            sql,
            "SELECT Dog.breed, Animal.id, Animal.name FROM Dog \
             INNER JOIN Animal ON Dog.id = Animal.id WHERE Animal.name = 'Rex'"
        );
        assert!(!sql.contains("vehicle_type"));
    }

    #[test]
    fn find_on_single_table_subclass_never_joins() {
        let registry = single_table_registry();
        let stmt = build_find(&registry, "Car", &FilterMap::new()).unwrap();
        let sql = stmt.render();

        assert_eq!(sql, "SELECT * FROM Vehicle WHERE vehicle_type = 'car'");
        assert!(!sql.contains("JOIN"));
    }

    #[test]
    fn find_on_single_table_root_scans_all_rows() {
        let registry = single_table_registry();
        let stmt = build_find(&registry, "Vehicle", &FilterMap::new()).unwrap();

        assert_eq!(stmt.render(), "SELECT * FROM Vehicle");
    }

    #[test]
    fn find_on_table_per_class_selects_one_table() {
        let mut registry = SchemaRegistry::new();
        registry
            .register(
                EntityClass::new("Shape")
                    .strategy(InheritanceStrategy::TablePerClass)
                    .attribute(AttributeDescriptor::new("id", DataType::BigInt).identifier())
                    .attribute(AttributeDescriptor::new("color", DataType::Text)),
            )
            .unwrap();
        registry
            .register(
                EntityClass::new("Circle")
                    .parent("Shape")
                    .attribute(AttributeDescriptor::new("radius", DataType::Real)),
            )
            .unwrap();

        let stmt = build_find(&registry, "Circle", &FilterMap::new()).unwrap();
        let sql = stmt.render();

        assert_eq!(sql, "SELECT * FROM Circle");
        assert!(!sql.contains("JOIN"));
    }

    #[test]
    fn find_filters_support_null_and_lists() {
        let registry = joined_registry();
        let mut filter = FilterMap::new();
        filter.insert("name".to_string(), Value::Null);

        let stmt = build_find(&registry, "Animal", &filter).unwrap();
        assert_eq!(stmt.render(), "SELECT * FROM Animal WHERE name IS NULL");

        let mut filter = FilterMap::new();
        filter.insert("id".to_string(), json!([1, 2, 3]));
        let stmt = build_find(&registry, "Animal", &filter).unwrap();
        assert_eq!(stmt.render(), "SELECT * FROM Animal WHERE id IN (1, 2, 3)");
    }

    #[test]
    fn find_rejects_unknown_filter_attribute() {
        let registry = joined_registry();
        let mut filter = FilterMap::new();
        filter.insert("nope".to_string(), json!(1));

        assert!(matches!(
            build_find(&registry, "Dog", &filter),
            Err(OrmError::Query(_))
        ));
    }

    #[test]
    fn joined_insert_targets_root_first() {
        let registry = joined_registry();
        let mut values = ValueMap::new();
        values.insert("id".to_string(), json!(7));
        values.insert("name".to_string(), json!("Rex"));
        values.insert("breed".to_string(), json!("collie"));

        let stmts = build_insert(&registry, "Dog", &values).unwrap();

        assert_eq!(stmts.len(), 2);
        assert_eq!(
            stmts[0].render(),
            "INSERT INTO Animal (id, name) VALUES (7, 'Rex')"
        );
        assert_eq!(
            stmts[1].render(),
            "INSERT INTO Dog (id, breed) VALUES (7, 'collie')"
        );
    }

    #[test]
    fn single_table_insert_writes_discriminator() {
        let registry = single_table_registry();
        let mut values = ValueMap::new();
        values.insert("id".to_string(), json!(1));
        values.insert("wheels".to_string(), json!(4));
        values.insert("doors".to_string(), json!(5));

        let stmts = build_insert(&registry, "Car", &values).unwrap();

        assert_eq!(stmts.len(), 1);
        assert_eq!(
            stmts[0].render(),
            "INSERT INTO Vehicle (id, vehicle_type, wheels, doors) VALUES (1, 'car', 4, 5)"
        );
    }

    #[test]
    fn insert_requires_identifier() {
        let registry = joined_registry();
        let mut values = ValueMap::new();
        values.insert("name".to_string(), json!("Rex"));

        assert!(matches!(
            build_insert(&registry, "Dog", &values),
            Err(OrmError::Query(_))
        ));
    }

    #[test]
    fn joined_update_skips_untouched_tables() {
        let registry = joined_registry();
        let mut values = ValueMap::new();
        values.insert("id".to_string(), json!(7));
        values.insert("breed".to_string(), json!("husky"));

        let stmts = build_update(&registry, "Dog", &values).unwrap();

        assert_eq!(stmts.len(), 1);
        assert_eq!(
            stmts[0].render(),
            "UPDATE Dog SET breed = 'husky' WHERE id = 7"
        );
    }

    #[test]
    fn joined_delete_runs_leaf_first() {
        let registry = joined_registry();
        let stmts = build_delete(&registry, "Dog", &json!(7)).unwrap();

        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[0].render(), "DELETE FROM Dog WHERE id = 7");
        assert_eq!(stmts[1].render(), "DELETE FROM Animal WHERE id = 7");
    }

    #[test]
    fn relation_find_joins_through_junction() {
        let mut registry = SchemaRegistry::new();
        registry
            .register(
                EntityClass::new("Tag")
                    .attribute(AttributeDescriptor::new("id", DataType::BigInt).identifier())
                    .attribute(AttributeDescriptor::new("label", DataType::Text)),
            )
            .unwrap();

        let jt = JoinTable::new("post_tags", "post_id", "tag_id");
        let stmt = build_relation_find(&registry, "Tag", &jt, &json!(3)).unwrap();

        assert_eq!(
            stmt.render(),
            "SELECT Tag.id, Tag.label FROM Tag \
             INNER JOIN post_tags ON Tag.id = post_tags.tag_id \
             WHERE post_tags.post_id = 3"
        );
    }

    #[test]
    fn junction_statements_target_single_rows() {
        let jt = JoinTable::new("post_tags", "post_id", "tag_id");

        assert_eq!(
            build_junction_insert(&jt, &json!(1), &json!(9)).render(),
            "INSERT INTO post_tags (post_id, tag_id) VALUES (1, 9)"
        );
        assert_eq!(
            build_junction_delete(&jt, &json!(1), &json!(9)).render(),
            "DELETE FROM post_tags WHERE post_id = 1 AND tag_id = 9"
        );
        assert_eq!(
            build_junction_select(&jt, &json!(1)).render(),
            "SELECT tag_id FROM post_tags WHERE post_id = 1"
        );
    }

    #[test]
    fn render_escapes_quotes() {
        let stmt = Statement::new("SELECT * FROM t WHERE n = ?", vec![json!("O'Reilly")]);
        assert_eq!(stmt.render(), "SELECT * FROM t WHERE n = 'O''Reilly'");
    }

    #[test]
    fn counter_statements() {
        assert_eq!(
            build_counter_read("relmap_identifiers", "Animal").render(),
            "SELECT value FROM relmap_identifiers WHERE name = 'Animal'"
        );
        assert_eq!(
            build_counter_seed("relmap_identifiers", "Animal").render(),
            "INSERT INTO relmap_identifiers (name, value) VALUES ('Animal', 0)"
        );
        assert_eq!(
            build_counter_bump("relmap_identifiers", "Animal", 4).render(),
            "UPDATE relmap_identifiers SET value = 4 WHERE name = 'Animal'"
        );
    }
}
