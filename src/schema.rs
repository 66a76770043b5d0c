//! Schema registry: entity class descriptors, registration-time validation,
//! and DDL generation for the three inheritance-mapping strategies.

use crate::error::{OrmError, Result};
use crate::relation::{RelationDescriptor, RelationType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Declared attribute type, mapped onto SQL column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Integer,
    BigInt,
    Real,
    Text,
    Boolean,
    Timestamp,
    Json,
    Blob,
    /// Foreign-key-bearing attribute; shape comes from its relation descriptor.
    Relation,
}

impl DataType {
    pub fn sql_type(&self) -> &'static str {
        match self {
            DataType::Integer => "INTEGER",
            DataType::BigInt => "BIGINT",
            DataType::Real => "DOUBLE PRECISION",
            DataType::Text => "TEXT",
            DataType::Boolean => "BOOLEAN",
            DataType::Timestamp => "TIMESTAMP",
            DataType::Json => "TEXT",
            DataType::Blob => "BLOB",
            DataType::Relation => "BIGINT",
        }
    }

    /// Whether a runtime value is acceptable for this declared type.
    /// Null is always acceptable; column nullability is a DDL concern.
    pub fn accepts(&self, value: &Value) -> bool {
        if value.is_null() {
            return true;
        }
        match self {
            DataType::Integer | DataType::BigInt => value.is_i64() || value.is_u64(),
            DataType::Real => value.is_number(),
            DataType::Text | DataType::Blob => value.is_string(),
            DataType::Boolean => value.is_boolean(),
            DataType::Timestamp => value.is_string() || value.is_i64() || value.is_u64(),
            DataType::Json => true,
            DataType::Relation => value.is_number() || value.is_string(),
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DataType::Integer => "integer",
            DataType::BigInt => "bigint",
            DataType::Real => "real",
            DataType::Text => "text",
            DataType::Boolean => "boolean",
            DataType::Timestamp => "timestamp",
            DataType::Json => "json",
            DataType::Blob => "blob",
            DataType::Relation => "relation",
        };
        write!(f, "{}", name)
    }
}

/// Identifier generation strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeneratorStrategy {
    /// Table-backed sequence: a named counter row is read then incremented
    /// inside the same transaction as the insert.
    Table { counter_table: String },
}

/// Counter table used when a generated identifier declares no generator.
pub const DEFAULT_COUNTER_TABLE: &str = "relmap_identifiers";

/// Inheritance-mapping strategy, declared once at the hierarchy root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InheritanceStrategy {
    #[default]
    JoinedTable,
    SingleTable,
    TablePerClass,
}

/// One attribute of an entity class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeDescriptor {
    pub name: String,
    pub data_type: DataType,
    pub is_identifier: bool,
    pub is_generated: bool,
    pub generator: Option<GeneratorStrategy>,
    pub relation: Option<RelationDescriptor>,
}

impl AttributeDescriptor {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            is_identifier: false,
            is_generated: false,
            generator: None,
            relation: None,
        }
    }

    pub fn relation(name: impl Into<String>, descriptor: RelationDescriptor) -> Self {
        Self {
            name: name.into(),
            data_type: DataType::Relation,
            is_identifier: false,
            is_generated: false,
            generator: None,
            relation: Some(descriptor),
        }
    }

    pub fn identifier(mut self) -> Self {
        self.is_identifier = true;
        self
    }

    pub fn generated(mut self) -> Self {
        self.is_generated = true;
        self
    }

    pub fn generator(mut self, generator: GeneratorStrategy) -> Self {
        self.is_generated = true;
        self.generator = Some(generator);
        self
    }

    /// Physical column name, when the attribute maps onto a column of its
    /// declaring table. Inverse-side and many-to-many relation attributes
    /// have no column of their own.
    pub fn column_name(&self) -> Option<String> {
        match &self.relation {
            None => Some(self.name.clone()),
            Some(rel) => {
                if rel.relation_type == RelationType::ManyToMany || !rel.is_owning() {
                    None
                } else {
                    Some(rel.join_column(&self.name))
                }
            }
        }
    }
}

/// Static schema definition for one persistable type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityClass {
    pub name: String,
    pub table: String,
    pub parent: Option<String>,
    pub strategy: Option<InheritanceStrategy>,
    pub discriminator_column: Option<String>,
    pub discriminator_value: Option<String>,
    pub attributes: Vec<AttributeDescriptor>,
}

impl EntityClass {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            table: name.clone(),
            name,
            parent: None,
            strategy: None,
            discriminator_column: None,
            discriminator_value: None,
            attributes: Vec::new(),
        }
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn strategy(mut self, strategy: InheritanceStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn discriminator_column(mut self, column: impl Into<String>) -> Self {
        self.discriminator_column = Some(column.into());
        self
    }

    pub fn discriminator_value(mut self, value: impl Into<String>) -> Self {
        self.discriminator_value = Some(value.into());
        self
    }

    pub fn attribute(mut self, attribute: AttributeDescriptor) -> Self {
        self.attributes.push(attribute);
        self
    }
}

/// Physical column of a table layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub sql_type: &'static str,
    pub not_null: bool,
    pub primary_key: bool,
    pub references: Option<(String, String)>,
}

/// Resolved physical layout of the table a class primarily maps onto.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLayout {
    pub table: String,
    pub columns: Vec<ColumnDef>,
}

impl TableLayout {
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// Registry of entity class descriptors. Populated once at startup, then
/// read-only; registration must happen before any query use.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    classes: HashMap<String, EntityClass>,
    order: Vec<String>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an entity class, validating schema shape up front so query
    /// time never has to. Parents must be registered before their subclasses.
    pub fn register(&mut self, mut class: EntityClass) -> Result<()> {
        if self.classes.contains_key(&class.name) {
            return Err(OrmError::DuplicateEntity(class.name));
        }

        if let Some(parent) = &class.parent {
            if !self.classes.contains_key(parent) {
                return Err(OrmError::UnknownEntity(parent.clone()));
            }
        }

        self.validate_strategy(&class)?;
        self.validate_identifier(&class)?;
        self.validate_redeclarations(&class)?;
        self.validate_relations(&class)?;

        // Generated identifiers without an explicit generator fall back to
        // the shared counter table.
        for attr in &mut class.attributes {
            if attr.is_generated && attr.generator.is_none() {
                attr.generator = Some(GeneratorStrategy::Table {
                    counter_table: DEFAULT_COUNTER_TABLE.to_string(),
                });
            }
        }

        self.order.push(class.name.clone());
        self.classes.insert(class.name.clone(), class);
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Result<&EntityClass> {
        self.classes
            .get(name)
            .ok_or_else(|| OrmError::UnknownEntity(name.to_string()))
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.classes.contains_key(name)
    }

    /// Inheritance chain, root first, target class last.
    pub fn ancestry(&self, name: &str) -> Result<Vec<&EntityClass>> {
        let mut chain = Vec::new();
        let mut current = Some(self.resolve(name)?);
        while let Some(class) = current {
            chain.push(class);
            current = match &class.parent {
                Some(parent) => Some(self.resolve(parent)?),
                None => None,
            };
        }
        chain.reverse();
        Ok(chain)
    }

    /// Root of the inheritance chain the class belongs to.
    pub fn root_of(&self, name: &str) -> Result<&EntityClass> {
        Ok(self.ancestry(name)?[0])
    }

    /// Strategy in effect for a class: the root's declaration, joined-table
    /// by default.
    pub fn effective_strategy(&self, name: &str) -> Result<InheritanceStrategy> {
        Ok(self.root_of(name)?.strategy.unwrap_or_default())
    }

    /// Ordered attribute descriptors of a class, inherited ones first.
    pub fn attributes_of(
        &self,
        name: &str,
        include_inherited: bool,
    ) -> Result<Vec<&AttributeDescriptor>> {
        if include_inherited {
            let mut attrs = Vec::new();
            for class in self.ancestry(name)? {
                attrs.extend(class.attributes.iter());
            }
            Ok(attrs)
        } else {
            Ok(self.resolve(name)?.attributes.iter().collect())
        }
    }

    /// The single identifier attribute of a class (inherited or own).
    pub fn identifier_of(&self, name: &str) -> Result<&AttributeDescriptor> {
        self.attributes_of(name, true)?
            .into_iter()
            .find(|a| a.is_identifier)
            .ok_or_else(|| {
                OrmError::InconsistentStrategy(format!(
                    "entity class {} has no identifier attribute",
                    name
                ))
            })
    }

    /// Discriminator (column, value) pair for single-table classes carrying
    /// a discriminator value. The column is declared on the root.
    pub fn discriminator_of(&self, name: &str) -> Result<Option<(String, String)>> {
        if self.effective_strategy(name)? != InheritanceStrategy::SingleTable {
            return Ok(None);
        }
        let column = self.root_of(name)?.discriminator_column.clone();
        let value = self.resolve(name)?.discriminator_value.clone();
        Ok(match (column, value) {
            (Some(column), Some(value)) => Some((column, value)),
            _ => None,
        })
    }

    /// Classes whose inheritance chain passes through `root`, in registration
    /// order, the root itself included.
    pub fn hierarchy_of(&self, root: &str) -> Result<Vec<&EntityClass>> {
        self.resolve(root)?;
        let mut members = Vec::new();
        for name in &self.order {
            let chain = self.ancestry(name)?;
            if chain.iter().any(|c| c.name == root) {
                members.push(self.resolve(name)?);
            }
        }
        Ok(members)
    }

    /// Table that physically holds an attribute's column under the class's
    /// active strategy.
    pub fn declaring_table(&self, name: &str, attribute: &str) -> Result<String> {
        match self.effective_strategy(name)? {
            InheritanceStrategy::SingleTable => Ok(self.root_of(name)?.table.clone()),
            InheritanceStrategy::TablePerClass => Ok(self.resolve(name)?.table.clone()),
            InheritanceStrategy::JoinedTable => {
                for class in self.ancestry(name)? {
                    if class.attributes.iter().any(|a| a.name == attribute) {
                        return Ok(class.table.clone());
                    }
                }
                Err(OrmError::Query(format!(
                    "unknown attribute {}.{}",
                    name, attribute
                )))
            }
        }
    }

    /// Counter table and key for the class's generated identifier, when any.
    /// The key is the root table name so identifiers stay unique across an
    /// entire hierarchy.
    pub fn counter_of(&self, name: &str) -> Result<Option<(String, String)>> {
        let identifier = self.identifier_of(name)?;
        if !identifier.is_generated {
            return Ok(None);
        }
        let counter_table = match &identifier.generator {
            Some(GeneratorStrategy::Table { counter_table }) => counter_table.clone(),
            None => DEFAULT_COUNTER_TABLE.to_string(),
        };
        Ok(Some((counter_table, self.root_of(name)?.table.clone())))
    }

    /// Physical layout of the primary table a class maps onto.
    pub fn table_layout(&self, name: &str) -> Result<TableLayout> {
        let class = self.resolve(name)?;
        let strategy = self.effective_strategy(name)?;
        let identifier = self.identifier_of(name)?;

        let id_column = ColumnDef {
            name: identifier.name.clone(),
            sql_type: identifier.data_type.sql_type(),
            not_null: true,
            primary_key: true,
            references: None,
        };

        match strategy {
            InheritanceStrategy::SingleTable => {
                let root = self.root_of(name)?;
                let mut columns = vec![id_column];
                if let Some(discriminator) = &root.discriminator_column {
                    columns.push(ColumnDef {
                        name: discriminator.clone(),
                        sql_type: "TEXT",
                        not_null: true,
                        primary_key: false,
                        references: None,
                    });
                }
                // Union of all hierarchy columns; rows leave the ones
                // irrelevant to their class null.
                for member in self.hierarchy_of(&root.name)? {
                    for attr in &member.attributes {
                        if attr.is_identifier {
                            continue;
                        }
                        if let Some(column) = data_column(attr) {
                            if !columns.iter().any(|c| c.name == column.name) {
                                columns.push(column);
                            }
                        }
                    }
                }
                Ok(TableLayout {
                    table: root.table.clone(),
                    columns,
                })
            }
            InheritanceStrategy::TablePerClass => {
                let mut columns = vec![id_column];
                for member in self.ancestry(name)? {
                    for attr in &member.attributes {
                        if attr.is_identifier {
                            continue;
                        }
                        if let Some(column) = data_column(attr) {
                            columns.push(column);
                        }
                    }
                }
                Ok(TableLayout {
                    table: class.table.clone(),
                    columns,
                })
            }
            InheritanceStrategy::JoinedTable => {
                let mut id_column = id_column;
                if let Some(parent) = &class.parent {
                    let parent_class = self.resolve(parent)?;
                    id_column.references =
                        Some((parent_class.table.clone(), identifier.name.clone()));
                }
                let mut columns = vec![id_column];
                for attr in &class.attributes {
                    if attr.is_identifier {
                        continue;
                    }
                    if let Some(column) = data_column(attr) {
                        columns.push(column);
                    }
                }
                Ok(TableLayout {
                    table: class.table.clone(),
                    columns,
                })
            }
        }
    }

    /// CREATE TABLE statements for a class: its primary table, junction
    /// tables for owning many-to-many attributes, and the counter table for
    /// table-generated identifiers.
    pub fn create_table_sql(&self, name: &str) -> Result<Vec<String>> {
        let layout = self.table_layout(name)?;
        let mut statements = vec![render_create_table(&layout)];

        for attr in self.attributes_of(name, true)? {
            if let Some(relation) = &attr.relation {
                if relation.relation_type == RelationType::ManyToMany && relation.is_owning() {
                    if let Some(jt) = &relation.join_table {
                        statements.push(format!(
                            "CREATE TABLE IF NOT EXISTS {} (\n    {} BIGINT NOT NULL,\n    {} BIGINT NOT NULL,\n    PRIMARY KEY ({}, {})\n);",
                            jt.table,
                            jt.source_column,
                            jt.target_column,
                            jt.source_column,
                            jt.target_column
                        ));
                    }
                }
            }
        }

        if let Some((counter_table, _)) = self.counter_of(name)? {
            statements.push(format!(
                "CREATE TABLE IF NOT EXISTS {} (\n    name TEXT NOT NULL,\n    value BIGINT NOT NULL,\n    PRIMARY KEY (name)\n);",
                counter_table
            ));
        }

        Ok(statements)
    }

    fn validate_strategy(&self, class: &EntityClass) -> Result<()> {
        if let Some(parent) = &class.parent {
            let root_strategy = self.effective_strategy(parent)?;
            if let Some(declared) = class.strategy {
                if declared != root_strategy {
                    return Err(OrmError::InconsistentStrategy(format!(
                        "{} declares {:?} but its hierarchy root uses {:?}",
                        class.name, declared, root_strategy
                    )));
                }
            }
            if root_strategy == InheritanceStrategy::SingleTable
                && class.discriminator_value.is_none()
            {
                return Err(OrmError::InconsistentStrategy(format!(
                    "single-table subclass {} declares no discriminator value",
                    class.name
                )));
            }
        } else if class.strategy == Some(InheritanceStrategy::SingleTable)
            && class.discriminator_column.is_none()
        {
            return Err(OrmError::InconsistentStrategy(format!(
                "single-table root {} declares no discriminator column",
                class.name
            )));
        }
        Ok(())
    }

    fn validate_identifier(&self, class: &EntityClass) -> Result<()> {
        let own = class.attributes.iter().filter(|a| a.is_identifier).count();
        let inherited = match &class.parent {
            Some(parent) => self
                .attributes_of(parent, true)?
                .iter()
                .filter(|a| a.is_identifier)
                .count(),
            None => 0,
        };
        if own + inherited != 1 {
            return Err(OrmError::InconsistentStrategy(format!(
                "entity class {} must have exactly one identifier attribute, found {}",
                class.name,
                own + inherited
            )));
        }
        Ok(())
    }

    fn validate_redeclarations(&self, class: &EntityClass) -> Result<()> {
        let inherited: Vec<&AttributeDescriptor> = match &class.parent {
            Some(parent) => self.attributes_of(parent, true)?,
            None => Vec::new(),
        };
        for (index, attr) in class.attributes.iter().enumerate() {
            if inherited.iter().any(|a| a.name == attr.name) {
                return Err(OrmError::InconsistentStrategy(format!(
                    "{} redeclares inherited attribute {}",
                    class.name, attr.name
                )));
            }
            if class.attributes[..index].iter().any(|a| a.name == attr.name) {
                return Err(OrmError::InconsistentStrategy(format!(
                    "{} declares attribute {} more than once",
                    class.name, attr.name
                )));
            }
        }
        Ok(())
    }

    fn validate_relations(&self, class: &EntityClass) -> Result<()> {
        for attr in &class.attributes {
            if let Some(relation) = &attr.relation {
                if attr.data_type != DataType::Relation {
                    return Err(OrmError::Query(format!(
                        "relation attribute {}.{} must use the relation data type",
                        class.name, attr.name
                    )));
                }
                if relation.relation_type == RelationType::ManyToMany
                    && relation.is_owning()
                    && relation.join_table.is_none()
                {
                    return Err(OrmError::Query(format!(
                        "owning many-to-many attribute {}.{} declares no join table",
                        class.name, attr.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Column for a non-identifier attribute, when it maps onto one.
fn data_column(attr: &AttributeDescriptor) -> Option<ColumnDef> {
    attr.column_name().map(|name| ColumnDef {
        name,
        sql_type: attr.data_type.sql_type(),
        not_null: false,
        primary_key: false,
        references: None,
    })
}

fn render_create_table(layout: &TableLayout) -> String {
    let mut sql = format!("CREATE TABLE IF NOT EXISTS {} (\n", layout.table);
    let column_defs: Vec<String> = layout
        .columns
        .iter()
        .map(|col| {
            let mut def = format!("    {} {}", col.name, col.sql_type);
            if col.not_null {
                def.push_str(" NOT NULL");
            }
            if let Some((table, column)) = &col.references {
                def.push_str(&format!(" REFERENCES {}({})", table, column));
            }
            def
        })
        .collect();
    sql.push_str(&column_defs.join(",\n"));

    let pk: Vec<&str> = layout
        .columns
        .iter()
        .filter(|c| c.primary_key)
        .map(|c| c.name.as_str())
        .collect();
    if !pk.is_empty() {
        sql.push_str(&format!(",\n    PRIMARY KEY ({})\n", pk.join(", ")));
    } else {
        sql.push('\n');
    }
    sql.push_str(");");
    sql
}

/// Column rendering for ALTER statements, reused by schema reconciliation.
pub fn render_column_ddl(column: &ColumnDef) -> String {
    let mut def = format!("{} {}", column.name, column.sql_type);
    if column.not_null {
        def.push_str(" NOT NULL");
    }
    def
}
