//! Entity manager facade: ties the schema registry, query generator,
//! relation resolver, transaction stack, and storage engines together behind
//! one runtime API.

use crate::engine::{ConnectionParams, Dialect, EngineRegistry, Row, RowSet, StorageEngine};
use crate::error::{OrmError, Result};
use crate::query::{self, format_value, FilterMap, Statement, ValueMap};
use crate::relation::{junction_delta, load_plan, FetchMode, JoinTable, LoadAction, LoadStep, RelationRef};
use crate::schema::{render_column_ddl, SchemaRegistry};
use crate::transaction::{TransactionStack, TxAction};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// In-memory representation of one persistable row, keyed by attribute name.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub class: String,
    pub values: ValueMap,
    pub relations: BTreeMap<String, RelationValue>,
}

/// State of one relation attribute on a loaded or to-be-saved entity.
#[derive(Debug, Clone, PartialEq)]
pub enum RelationValue {
    /// Lazy marker; resolvable through [`EntityManager::load_relation`].
    Unloaded(RelationRef),
    One(Box<Entity>),
    Many(Vec<Entity>),
    /// Desired related identifiers of a many-to-many attribute, reconciled
    /// against the junction table on the next save.
    Ids(Vec<Value>),
}

impl Entity {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            values: ValueMap::new(),
            relations: BTreeMap::new(),
        }
    }

    /// Builder-style attribute assignment.
    pub fn set(mut self, attribute: impl Into<String>, value: Value) -> Self {
        self.values.insert(attribute.into(), value);
        self
    }

    /// Builder-style desired related-id set for a many-to-many attribute.
    pub fn relate(mut self, attribute: impl Into<String>, ids: Vec<Value>) -> Self {
        self.relations
            .insert(attribute.into(), RelationValue::Ids(ids));
        self
    }

    pub fn set_value(&mut self, attribute: impl Into<String>, value: Value) {
        self.values.insert(attribute.into(), value);
    }

    pub fn get(&self, attribute: &str) -> Option<&Value> {
        self.values.get(attribute)
    }

    pub fn relation(&self, attribute: &str) -> Option<&RelationValue> {
        self.relations.get(attribute)
    }
}

/// One logical storage connection plus its nested transaction stack.
pub struct Connection {
    engine: Box<dyn StorageEngine>,
    txns: TransactionStack,
}

impl Connection {
    pub fn in_transaction(&self) -> bool {
        self.txns.is_active()
    }

    pub fn transaction_depth(&self) -> usize {
        self.txns.depth()
    }

    pub fn dialect(&self) -> Dialect {
        self.engine.dialect()
    }

    pub async fn close(self) -> Result<()> {
        self.engine.close().await
    }

    async fn run(&mut self, stmt: &Statement) -> Result<u64> {
        self.engine.execute(&stmt.render()).await
    }

    async fn query(&mut self, stmt: &Statement) -> Result<RowSet> {
        self.engine.fetch(&stmt.render()).await
    }
}

/// Facade over a read-only schema registry. Cheap to clone; connections are
/// created per unit of work.
#[derive(Debug, Clone)]
pub struct EntityManager {
    registry: Arc<SchemaRegistry>,
}

impl EntityManager {
    pub fn new(registry: SchemaRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Opens a connection through a named storage engine.
    pub async fn connect(
        &self,
        engines: &EngineRegistry,
        engine: &str,
        params: &ConnectionParams,
    ) -> Result<Connection> {
        let engine = engines.create_connection(engine, params).await?;
        Ok(Connection {
            engine,
            txns: TransactionStack::new(),
        })
    }

    /// Loads every entity of a class matching the filter. Eager relations are
    /// resolved one level deep; lazy ones surface as `Unloaded` markers.
    pub async fn find(
        &self,
        conn: &mut Connection,
        class: &str,
        filter: &FilterMap,
    ) -> Result<Vec<Entity>> {
        let stmt = query::build_find(&self.registry, class, filter)?;
        let rows = conn.query(&stmt).await?;
        let mut entities = Vec::with_capacity(rows.len());
        for row in &rows {
            entities.push(self.entity_from_row(class, row)?);
        }
        self.attach_relations(conn, class, &mut entities).await?;
        Ok(entities)
    }

    pub async fn find_by_id(
        &self,
        conn: &mut Connection,
        class: &str,
        id: &Value,
    ) -> Result<Entity> {
        let id_name = self.registry.identifier_of(class)?.name.clone();
        let mut filter = FilterMap::new();
        filter.insert(id_name, id.clone());

        let mut entities = self.find(conn, class, &filter).await?;
        if entities.is_empty() {
            return Err(OrmError::EntryNotFound {
                entity: class.to_string(),
                id: format_value(id),
            });
        }
        Ok(entities.remove(0))
    }

    /// Persists an entity: insert when the identifier is unset (generating it
    /// when the schema says so), update otherwise. Values are type-checked
    /// before any statement is issued. The write runs in its own nested
    /// transaction scope; on a mid-scope error the scope is left open so the
    /// caller's rollback unwinds the whole unit of work.
    pub async fn save(&self, conn: &mut Connection, mut entity: Entity) -> Result<Entity> {
        let class = entity.class.clone();
        self.type_check(&entity)?;

        let identifier = self.registry.identifier_of(&class)?;
        let id_name = identifier.name.clone();
        let generated = identifier.is_generated;
        let is_update = entity
            .values
            .get(&id_name)
            .map_or(false, |v| !v.is_null());

        let scope = self.create_transaction(conn, None).await?;

        if is_update {
            debug!(target: "relmap::manager", entity = %class, "updating");
            for stmt in query::build_update(&self.registry, &class, &entity.values)? {
                conn.run(&stmt).await?;
            }
        } else {
            if generated {
                let next = self.next_identifier(conn, &class).await?;
                entity.values.insert(id_name.clone(), next);
            }
            debug!(target: "relmap::manager", entity = %class, "inserting");
            for stmt in query::build_insert(&self.registry, &class, &entity.values)? {
                conn.run(&stmt).await?;
            }
        }

        self.reconcile_junctions(conn, &entity, &id_name).await?;
        self.commit_transaction(conn, Some(&scope)).await?;
        Ok(entity)
    }

    /// Deletes an entity. Junction rows the entity owns go first so nothing
    /// dangles, then the class tables leaf-first.
    pub async fn remove(&self, conn: &mut Connection, entity: &Entity) -> Result<()> {
        let class = entity.class.as_str();
        let id_name = self.registry.identifier_of(class)?.name.clone();
        let id = entity
            .values
            .get(&id_name)
            .filter(|v| !v.is_null())
            .cloned()
            .ok_or_else(|| {
                OrmError::Query(format!("remove of {} without identifier {}", class, id_name))
            })?;

        let owned_junctions: Vec<JoinTable> = self
            .registry
            .attributes_of(class, true)?
            .iter()
            .filter_map(|attr| attr.relation.as_ref())
            .filter(|rel| rel.is_owning())
            .filter_map(|rel| rel.join_table.clone())
            .collect();

        let scope = self.create_transaction(conn, None).await?;

        for junction in &owned_junctions {
            conn.run(&query::build_junction_clear(junction, &id)).await?;
        }

        let mut affected = None;
        for stmt in query::build_delete(&self.registry, class, &id)? {
            let count = conn.run(&stmt).await?;
            affected.get_or_insert(count);
        }
        if affected == Some(0) {
            return Err(OrmError::EntryNotFound {
                entity: class.to_string(),
                id: format_value(&id),
            });
        }

        debug!(target: "relmap::manager", entity = %class, id = %format_value(&id), "removed");
        self.commit_transaction(conn, Some(&scope)).await
    }

    /// Resolves one relation attribute of a loaded entity, regardless of its
    /// declared fetch mode.
    pub async fn load_relation(
        &self,
        conn: &mut Connection,
        entity: &Entity,
        attribute: &str,
    ) -> Result<RelationValue> {
        let steps = load_plan(&self.registry, &entity.class)?;
        let mut step = steps
            .into_iter()
            .find(|s| s.attribute == attribute)
            .ok_or_else(|| {
                OrmError::Query(format!(
                    "{}.{} is not a relation attribute",
                    entity.class, attribute
                ))
            })?;
        step.fetch = FetchMode::Eager;

        let id_name = self.registry.identifier_of(&entity.class)?.name.clone();
        let resolved = self.resolve_step(conn, entity, &id_name, &step).await?;
        Ok(resolved.unwrap_or(RelationValue::Many(Vec::new())))
    }

    /// Pushes a transaction scope, issuing a physical BEGIN only on the
    /// outermost one. Returns the scope name for the matching commit.
    pub async fn create_transaction(
        &self,
        conn: &mut Connection,
        name: Option<&str>,
    ) -> Result<String> {
        let (name, action) = conn.txns.begin(name);
        if action == TxAction::Begin {
            if let Err(err) = conn.engine.execute("BEGIN").await {
                conn.txns.rollback().ok();
                return Err(err);
            }
        }
        debug!(
            target: "relmap::manager",
            transaction = %name,
            depth = conn.txns.depth(),
            "transaction scope opened"
        );
        Ok(name)
    }

    /// Pops the innermost scope; the physical COMMIT goes out only when the
    /// stack empties.
    pub async fn commit_transaction(
        &self,
        conn: &mut Connection,
        name: Option<&str>,
    ) -> Result<()> {
        let action = conn.txns.commit(name)?;
        if action == TxAction::Commit {
            conn.engine.execute("COMMIT").await?;
        }
        debug!(
            target: "relmap::manager",
            depth = conn.txns.depth(),
            "transaction scope committed"
        );
        Ok(())
    }

    /// Unwinds the entire transaction stack with exactly one physical
    /// ROLLBACK, whatever the current depth.
    pub async fn rollback_transaction(&self, conn: &mut Connection) -> Result<()> {
        conn.txns.rollback()?;
        warn!(target: "relmap::manager", "rolling back transaction stack");
        conn.engine.execute("ROLLBACK").await?;
        Ok(())
    }

    /// Whether the class's primary table exists in the connected database.
    pub async fn exists_entity_definition(
        &self,
        conn: &mut Connection,
        class: &str,
    ) -> Result<bool> {
        let table = self.registry.table_layout(class)?.table;
        conn.engine.table_exists(&table).await
    }

    /// Whether every column of the class's layout is physically present.
    pub async fn synced_entity_definition(
        &self,
        conn: &mut Connection,
        class: &str,
    ) -> Result<bool> {
        let layout = self.registry.table_layout(class)?;
        if !conn.engine.table_exists(&layout.table).await? {
            return Ok(false);
        }
        let actual = conn.engine.table_columns(&layout.table).await?;
        Ok(layout.column_names().iter().all(|c| actual.contains(c)))
    }

    /// Creates the class's primary table plus its junction and counter tables.
    pub async fn create_entity_definition(&self, conn: &mut Connection, class: &str) -> Result<()> {
        for sql in self.registry.create_table_sql(class)? {
            conn.engine.execute(&sql).await?;
        }
        info!(target: "relmap::manager", entity = class, "entity definition created");
        Ok(())
    }

    /// Reconciles the physical table with the class layout by adding missing
    /// columns. Never drops anything.
    pub async fn update_entity_definition(&self, conn: &mut Connection, class: &str) -> Result<()> {
        let layout = self.registry.table_layout(class)?;
        if !conn.engine.table_exists(&layout.table).await? {
            return self.create_entity_definition(conn, class).await;
        }
        let actual = conn.engine.table_columns(&layout.table).await?;
        for column in &layout.columns {
            if !actual.contains(&column.name) {
                conn.engine
                    .add_column(&layout.table, &render_column_ddl(column))
                    .await?;
                info!(
                    target: "relmap::manager",
                    entity = class,
                    column = %column.name,
                    "column added"
                );
            }
        }
        Ok(())
    }

    fn entity_from_row(&self, class: &str, row: &Row) -> Result<Entity> {
        let mut entity = Entity::new(class);
        for attr in self.registry.attributes_of(class, true)? {
            if let Some(column) = attr.column_name() {
                if let Some(value) = row.get(&column) {
                    if !value.is_null() {
                        entity.values.insert(attr.name.clone(), value.clone());
                    }
                }
            }
        }
        Ok(entity)
    }

    async fn attach_relations(
        &self,
        conn: &mut Connection,
        class: &str,
        entities: &mut [Entity],
    ) -> Result<()> {
        let steps = load_plan(&self.registry, class)?;
        if steps.is_empty() {
            return Ok(());
        }
        let id_name = self.registry.identifier_of(class)?.name.clone();

        for step in &steps {
            for index in 0..entities.len() {
                let resolved = self
                    .resolve_step(conn, &entities[index], &id_name, step)
                    .await?;
                if let Some(value) = resolved {
                    entities[index].relations.insert(step.attribute.clone(), value);
                }
            }
        }
        Ok(())
    }

    /// Resolves one load step for one entity. Related entities load with lazy
    /// markers only, so eager resolution never recurses.
    async fn resolve_step(
        &self,
        conn: &mut Connection,
        entity: &Entity,
        id_name: &str,
        step: &LoadStep,
    ) -> Result<Option<RelationValue>> {
        match &step.action {
            LoadAction::FollowForeignKey { .. } => {
                let Some(key) = entity
                    .values
                    .get(&step.attribute)
                    .filter(|v| !v.is_null())
                    .cloned()
                else {
                    return Ok(None);
                };
                if step.fetch == FetchMode::Lazy {
                    return Ok(Some(RelationValue::Unloaded(RelationRef {
                        target_entity: step.target_entity.clone(),
                        key,
                    })));
                }
                let target_id = self.registry.identifier_of(&step.target_entity)?.name.clone();
                let mut filter = FilterMap::new();
                filter.insert(target_id, key);
                let stmt = query::build_find(&self.registry, &step.target_entity, &filter)?;
                let rows = conn.query(&stmt).await?;
                Ok(match rows.first() {
                    Some(row) => Some(RelationValue::One(Box::new(
                        self.entity_from_row(&step.target_entity, row)?,
                    ))),
                    None => None,
                })
            }
            LoadAction::CollectByForeignKey { fk_attribute } => {
                let Some(key) = entity.values.get(id_name).cloned() else {
                    return Ok(None);
                };
                if step.fetch == FetchMode::Lazy {
                    return Ok(Some(RelationValue::Unloaded(RelationRef {
                        target_entity: step.target_entity.clone(),
                        key,
                    })));
                }
                let mut filter = FilterMap::new();
                filter.insert(fk_attribute.clone(), key);
                let stmt = query::build_find(&self.registry, &step.target_entity, &filter)?;
                let rows = conn.query(&stmt).await?;
                let mut related = Vec::with_capacity(rows.len());
                for row in &rows {
                    related.push(self.entity_from_row(&step.target_entity, row)?);
                }
                Ok(Some(RelationValue::Many(related)))
            }
            LoadAction::JoinThroughJunction { join_table } => {
                let Some(key) = entity.values.get(id_name).cloned() else {
                    return Ok(None);
                };
                if step.fetch == FetchMode::Lazy {
                    return Ok(Some(RelationValue::Unloaded(RelationRef {
                        target_entity: step.target_entity.clone(),
                        key,
                    })));
                }
                let stmt = query::build_relation_find(
                    &self.registry,
                    &step.target_entity,
                    join_table,
                    &key,
                )?;
                let rows = conn.query(&stmt).await?;
                let mut related = Vec::with_capacity(rows.len());
                for row in &rows {
                    related.push(self.entity_from_row(&step.target_entity, row)?);
                }
                Ok(Some(RelationValue::Many(related)))
            }
        }
    }

    /// Writes only the junction-row delta between the stored and the desired
    /// related-id sets, so repeated saves of the same entity are no-ops.
    async fn reconcile_junctions(
        &self,
        conn: &mut Connection,
        entity: &Entity,
        id_name: &str,
    ) -> Result<()> {
        let desired: Vec<(String, Vec<Value>)> = entity
            .relations
            .iter()
            .filter_map(|(name, value)| match value {
                RelationValue::Ids(ids) => Some((name.clone(), ids.clone())),
                _ => None,
            })
            .collect();
        if desired.is_empty() {
            return Ok(());
        }

        let owner_id = entity.values.get(id_name).cloned().ok_or_else(|| {
            OrmError::Query(format!(
                "junction reconciliation of {} without identifier {}",
                entity.class, id_name
            ))
        })?;
        let steps = load_plan(&self.registry, &entity.class)?;

        for (attribute, ids) in desired {
            let step = steps.iter().find(|s| s.attribute == attribute).ok_or_else(|| {
                OrmError::Query(format!(
                    "{}.{} is not a relation attribute",
                    entity.class, attribute
                ))
            })?;
            let LoadAction::JoinThroughJunction { join_table } = &step.action else {
                return Err(OrmError::Query(format!(
                    "{}.{} is not a many-to-many attribute",
                    entity.class, attribute
                )));
            };

            let rows = conn
                .query(&query::build_junction_select(join_table, &owner_id))
                .await?;
            let stored: Vec<Value> = rows
                .iter()
                .filter_map(|row| row.get(&join_table.target_column).cloned())
                .collect();

            let delta = junction_delta(&stored, &ids);
            debug!(
                target: "relmap::manager",
                entity = %entity.class,
                attribute = %attribute,
                inserts = delta.insert.len(),
                removes = delta.remove.len(),
                "reconciling junction rows"
            );
            for id in &delta.remove {
                conn.run(&query::build_junction_delete(join_table, &owner_id, id))
                    .await?;
            }
            for id in &delta.insert {
                conn.run(&query::build_junction_insert(join_table, &owner_id, id))
                    .await?;
            }
        }
        Ok(())
    }

    /// Table-backed identifier generation: the counter row is read (seeded on
    /// first use) and bumped inside the caller's transaction scope.
    async fn next_identifier(&self, conn: &mut Connection, class: &str) -> Result<Value> {
        let (counter_table, key) = self.registry.counter_of(class)?.ok_or_else(|| {
            OrmError::Query(format!("identifier of {} is not generated", class))
        })?;

        let rows = conn
            .query(&query::build_counter_read(&counter_table, &key))
            .await?;
        let current = match rows.first() {
            Some(row) => row.get_i64("value").unwrap_or(0),
            None => {
                conn.run(&query::build_counter_seed(&counter_table, &key))
                    .await?;
                0
            }
        };

        let next = current + 1;
        conn.run(&query::build_counter_bump(&counter_table, &key, next))
            .await?;
        Ok(Value::Number(next.into()))
    }

    fn type_check(&self, entity: &Entity) -> Result<()> {
        let attrs = self.registry.attributes_of(&entity.class, true)?;
        for (name, value) in &entity.values {
            let attr = attrs.iter().find(|a| &a.name == name).ok_or_else(|| {
                OrmError::Query(format!("unknown attribute {}.{}", entity.class, name))
            })?;
            if !attr.data_type.accepts(value) {
                return Err(OrmError::TypeCheckFailed {
                    attribute: format!("{}.{}", entity.class, name),
                    expected: attr.data_type.to_string(),
                    got: value_kind(value).to_string(),
                });
            }
        }
        Ok(())
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
