//! End-to-end tests of the entity manager against the in-memory SQLite
//! backend.

use relmap::engine::{ConnectionParams, EngineRegistry};
use relmap::error::OrmError;
use relmap::manager::{Connection, Entity, EntityManager, RelationValue};
use relmap::relation::{JoinTable, RelationDescriptor, RelationRef};
use relmap::schema::{
    AttributeDescriptor, DataType, EntityClass, InheritanceStrategy, SchemaRegistry,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;

fn init_logs() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

async fn connect(manager: &EntityManager) -> Connection {
    let engines = EngineRegistry::with_defaults();
    manager
        .connect(
            &engines,
            "sqlite",
            &ConnectionParams::new().set("path", ":memory:"),
        )
        .await
        .unwrap()
}

fn animal_manager() -> EntityManager {
    let mut registry = SchemaRegistry::new();
    registry
        .register(
            EntityClass::new("Animal")
                .attribute(
                    AttributeDescriptor::new("id", DataType::BigInt)
                        .identifier()
                        .generated(),
                )
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
    EntityManager::new(registry)
}

async fn animal_setup() -> (EntityManager, Connection) {
    init_logs();
    let manager = animal_manager();
    let mut conn = connect(&manager).await;
    manager
        .create_entity_definition(&mut conn, "Animal")
        .await
        .unwrap();
    manager
        .create_entity_definition(&mut conn, "Dog")
        .await
        .unwrap();
    (manager, conn)
}

#[tokio::test]
async fn joined_table_save_and_find_round_trip() {
    let (manager, mut conn) = animal_setup().await;

    let saved = manager
        .save(
            &mut conn,
            Entity::new("Dog")
                .set("name", json!("Rex"))
                .set("breed", json!("collie")),
        )
        .await
        .unwrap();
    assert_eq!(saved.get("id"), Some(&json!(1)));

    let mut filter = BTreeMap::new();
    filter.insert("breed".to_string(), json!("collie"));
    let found = manager.find(&mut conn, "Dog", &filter).await.unwrap();

    assert_eq!(found.len(), 1);
    assert_eq!(found[0].get("name"), Some(&json!("Rex")));
    assert_eq!(found[0].get("breed"), Some(&json!("collie")));

    let by_id = manager
        .find_by_id(&mut conn, "Dog", &json!(1))
        .await
        .unwrap();
    assert_eq!(by_id.get("name"), Some(&json!("Rex")));
}

#[tokio::test]
async fn identifiers_are_sequential_across_a_hierarchy() {
    let (manager, mut conn) = animal_setup().await;

    let cat = manager
        .save(&mut conn, Entity::new("Animal").set("name", json!("Tom")))
        .await
        .unwrap();
    let dog = manager
        .save(
            &mut conn,
            Entity::new("Dog")
                .set("name", json!("Rex"))
                .set("breed", json!("collie")),
        )
        .await
        .unwrap();

    // Dog and Animal share the root's counter, so ids never collide
    // between the two tables.
    assert_eq!(cat.get("id"), Some(&json!(1)));
    assert_eq!(dog.get("id"), Some(&json!(2)));
}

#[tokio::test]
async fn save_with_identifier_set_updates_in_place() {
    let (manager, mut conn) = animal_setup().await;

    manager
        .save(
            &mut conn,
            Entity::new("Dog")
                .set("name", json!("Rex"))
                .set("breed", json!("collie")),
        )
        .await
        .unwrap();

    let mut fetched = manager
        .find_by_id(&mut conn, "Dog", &json!(1))
        .await
        .unwrap();
    fetched.set_value("breed", json!("husky"));
    manager.save(&mut conn, fetched).await.unwrap();

    let updated = manager
        .find_by_id(&mut conn, "Dog", &json!(1))
        .await
        .unwrap();
    assert_eq!(updated.get("breed"), Some(&json!("husky")));
    assert_eq!(updated.get("name"), Some(&json!("Rex")));

    let all = manager
        .find(&mut conn, "Dog", &BTreeMap::new())
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn remove_deletes_across_joined_tables() {
    let (manager, mut conn) = animal_setup().await;

    let dog = manager
        .save(
            &mut conn,
            Entity::new("Dog")
                .set("name", json!("Rex"))
                .set("breed", json!("collie")),
        )
        .await
        .unwrap();

    manager.remove(&mut conn, &dog).await.unwrap();

    assert!(manager
        .find(&mut conn, "Dog", &BTreeMap::new())
        .await
        .unwrap()
        .is_empty());
    // The root row must be gone too.
    assert!(manager
        .find(&mut conn, "Animal", &BTreeMap::new())
        .await
        .unwrap()
        .is_empty());

    let result = manager.find_by_id(&mut conn, "Dog", &json!(1)).await;
    assert!(matches!(
        result,
        Err(OrmError::EntryNotFound { entity, id }) if entity == "Dog" && id == "1"
    ));
}

#[tokio::test]
async fn single_table_subclasses_share_one_table() {
    init_logs();
    let mut registry = SchemaRegistry::new();
    registry
        .register(
            EntityClass::new("Vehicle")
                .strategy(InheritanceStrategy::SingleTable)
                .discriminator_column("vehicle_type")
                .attribute(
                    AttributeDescriptor::new("id", DataType::BigInt)
                        .identifier()
                        .generated(),
                )
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
        .register(
            EntityClass::new("Bike")
                .parent("Vehicle")
                .discriminator_value("bike")
                .attribute(AttributeDescriptor::new("gears", DataType::Integer)),
        )
        .unwrap();
    let manager = EntityManager::new(registry);
    let mut conn = connect(&manager).await;
    manager
        .create_entity_definition(&mut conn, "Vehicle")
        .await
        .unwrap();

    manager
        .save(
            &mut conn,
            Entity::new("Car")
                .set("wheels", json!(4))
                .set("doors", json!(5)),
        )
        .await
        .unwrap();
    let bike = manager
        .save(
            &mut conn,
            Entity::new("Bike")
                .set("wheels", json!(2))
                .set("gears", json!(21)),
        )
        .await
        .unwrap();

    let cars = manager
        .find(&mut conn, "Car", &BTreeMap::new())
        .await
        .unwrap();
    assert_eq!(cars.len(), 1);
    assert_eq!(cars[0].get("doors"), Some(&json!(5)));

    // The root carries no discriminator value: it scans every row.
    let vehicles = manager
        .find(&mut conn, "Vehicle", &BTreeMap::new())
        .await
        .unwrap();
    assert_eq!(vehicles.len(), 2);

    let found = manager
        .find_by_id(&mut conn, "Bike", bike.get("id").unwrap())
        .await
        .unwrap();
    assert_eq!(found.get("gears"), Some(&json!(21)));
}

#[tokio::test]
async fn table_per_class_keeps_tables_independent() {
    init_logs();
    let mut registry = SchemaRegistry::new();
    registry
        .register(
            EntityClass::new("Shape")
                .strategy(InheritanceStrategy::TablePerClass)
                .attribute(
                    AttributeDescriptor::new("id", DataType::BigInt)
                        .identifier()
                        .generated(),
                )
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
    let manager = EntityManager::new(registry);
    let mut conn = connect(&manager).await;
    manager
        .create_entity_definition(&mut conn, "Shape")
        .await
        .unwrap();
    manager
        .create_entity_definition(&mut conn, "Circle")
        .await
        .unwrap();

    manager
        .save(
            &mut conn,
            Entity::new("Circle")
                .set("color", json!("red"))
                .set("radius", json!(2.5)),
        )
        .await
        .unwrap();

    let circles = manager
        .find(&mut conn, "Circle", &BTreeMap::new())
        .await
        .unwrap();
    assert_eq!(circles.len(), 1);
    assert_eq!(circles[0].get("color"), Some(&json!("red")));

    // Circle rows never land in the Shape table.
    assert!(manager
        .find(&mut conn, "Shape", &BTreeMap::new())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn rollback_discards_nested_work() {
    let (manager, mut conn) = animal_setup().await;

    manager
        .create_transaction(&mut conn, Some("outer"))
        .await
        .unwrap();
    manager
        .save(
            &mut conn,
            Entity::new("Dog")
                .set("name", json!("Rex"))
                .set("breed", json!("collie")),
        )
        .await
        .unwrap();

    // Uncommitted work is visible on the same connection.
    assert_eq!(
        manager
            .find(&mut conn, "Dog", &BTreeMap::new())
            .await
            .unwrap()
            .len(),
        1
    );
    assert_eq!(conn.transaction_depth(), 1);

    manager.rollback_transaction(&mut conn).await.unwrap();
    assert_eq!(conn.transaction_depth(), 0);

    assert!(manager
        .find(&mut conn, "Dog", &BTreeMap::new())
        .await
        .unwrap()
        .is_empty());

    let result = manager.rollback_transaction(&mut conn).await;
    assert!(matches!(result, Err(OrmError::NoActiveTransaction)));
}

#[tokio::test]
async fn outermost_commit_persists_nested_work() {
    let (manager, mut conn) = animal_setup().await;

    manager
        .create_transaction(&mut conn, Some("unit"))
        .await
        .unwrap();
    manager
        .save(&mut conn, Entity::new("Animal").set("name", json!("Tom")))
        .await
        .unwrap();
    manager
        .commit_transaction(&mut conn, Some("unit"))
        .await
        .unwrap();
    assert!(!conn.in_transaction());

    assert_eq!(
        manager
            .find(&mut conn, "Animal", &BTreeMap::new())
            .await
            .unwrap()
            .len(),
        1
    );

    let result = manager.commit_transaction(&mut conn, None).await;
    assert!(matches!(result, Err(OrmError::NoActiveTransaction)));
}

#[tokio::test]
async fn commit_name_must_match_innermost_scope() {
    let (manager, mut conn) = animal_setup().await;

    manager
        .create_transaction(&mut conn, Some("outer"))
        .await
        .unwrap();
    manager
        .create_transaction(&mut conn, Some("inner"))
        .await
        .unwrap();

    let result = manager.commit_transaction(&mut conn, Some("outer")).await;
    assert!(matches!(result, Err(OrmError::Transaction(_))));
    assert_eq!(conn.transaction_depth(), 2);

    manager
        .commit_transaction(&mut conn, Some("inner"))
        .await
        .unwrap();
    manager
        .commit_transaction(&mut conn, Some("outer"))
        .await
        .unwrap();
    assert!(!conn.in_transaction());
}

#[tokio::test]
async fn type_check_failure_aborts_before_any_statement() {
    let (manager, mut conn) = animal_setup().await;

    let result = manager
        .save(&mut conn, Entity::new("Animal").set("name", json!(42)))
        .await;

    assert!(matches!(
        result,
        Err(OrmError::TypeCheckFailed { ref attribute, .. }) if attribute == "Animal.name"
    ));
    // No transaction scope was opened for the rejected save.
    assert!(!conn.in_transaction());
    assert!(manager
        .find(&mut conn, "Animal", &BTreeMap::new())
        .await
        .unwrap()
        .is_empty());
}

fn tagged_post_manager() -> EntityManager {
    let mut registry = SchemaRegistry::new();
    registry
        .register(
            EntityClass::new("Tag")
                .attribute(
                    AttributeDescriptor::new("id", DataType::BigInt)
                        .identifier()
                        .generated(),
                )
                .attribute(AttributeDescriptor::new("label", DataType::Text)),
        )
        .unwrap();
    registry
        .register(
            EntityClass::new("Post")
                .attribute(
                    AttributeDescriptor::new("id", DataType::BigInt)
                        .identifier()
                        .generated(),
                )
                .attribute(AttributeDescriptor::new("title", DataType::Text))
                .attribute(AttributeDescriptor::relation(
                    "tags",
                    RelationDescriptor::many_to_many(
                        "Tag",
                        JoinTable::new("post_tags", "post_id", "tag_id"),
                    ),
                )),
        )
        .unwrap();
    EntityManager::new(registry)
}

#[tokio::test]
async fn many_to_many_saves_only_the_junction_delta() {
    init_logs();
    let manager = tagged_post_manager();
    let mut conn = connect(&manager).await;
    manager
        .create_entity_definition(&mut conn, "Tag")
        .await
        .unwrap();
    manager
        .create_entity_definition(&mut conn, "Post")
        .await
        .unwrap();

    for label in ["rust", "sql", "orm"] {
        manager
            .save(&mut conn, Entity::new("Tag").set("label", json!(label)))
            .await
            .unwrap();
    }

    let post = manager
        .save(
            &mut conn,
            Entity::new("Post")
                .set("title", json!("hello"))
                .relate("tags", vec![json!(1), json!(2)]),
        )
        .await
        .unwrap();

    let loaded = manager
        .load_relation(&mut conn, &post, "tags")
        .await
        .unwrap();
    let RelationValue::Many(tags) = loaded else {
        panic!("expected loaded tag entities");
    };
    let mut labels: Vec<&Value> = tags.iter().filter_map(|t| t.get("label")).collect();
    labels.sort_by_key(|v| v.to_string());
    assert_eq!(labels, vec![&json!("rust"), &json!("sql")]);

    // Reconciling to {2, 3} removes tag 1 and inserts tag 3.
    let fetched = manager
        .find_by_id(&mut conn, "Post", post.get("id").unwrap())
        .await
        .unwrap()
        .relate("tags", vec![json!(2), json!(3)]);
    let fetched = manager.save(&mut conn, fetched).await.unwrap();

    let loaded = manager
        .load_relation(&mut conn, &fetched, "tags")
        .await
        .unwrap();
    let RelationValue::Many(tags) = loaded else {
        panic!("expected loaded tag entities");
    };
    let mut labels: Vec<&Value> = tags.iter().filter_map(|t| t.get("label")).collect();
    labels.sort_by_key(|v| v.to_string());
    assert_eq!(labels, vec![&json!("orm"), &json!("sql")]);
}

#[tokio::test]
async fn eager_to_one_relation_loads_with_the_owner() {
    init_logs();
    let mut registry = SchemaRegistry::new();
    registry
        .register(
            EntityClass::new("Profile")
                .attribute(
                    AttributeDescriptor::new("id", DataType::BigInt)
                        .identifier()
                        .generated(),
                )
                .attribute(AttributeDescriptor::new("bio", DataType::Text)),
        )
        .unwrap();
    registry
        .register(
            EntityClass::new("Person")
                .attribute(
                    AttributeDescriptor::new("id", DataType::BigInt)
                        .identifier()
                        .generated(),
                )
                .attribute(AttributeDescriptor::new("name", DataType::Text))
                .attribute(AttributeDescriptor::relation(
                    "profile",
                    RelationDescriptor::one_to_one("Profile").eager(),
                )),
        )
        .unwrap();
    let manager = EntityManager::new(registry);
    let mut conn = connect(&manager).await;
    manager
        .create_entity_definition(&mut conn, "Profile")
        .await
        .unwrap();
    manager
        .create_entity_definition(&mut conn, "Person")
        .await
        .unwrap();

    let profile = manager
        .save(&mut conn, Entity::new("Profile").set("bio", json!("hi")))
        .await
        .unwrap();
    manager
        .save(
            &mut conn,
            Entity::new("Person")
                .set("name", json!("Ada"))
                .set("profile", profile.get("id").unwrap().clone()),
        )
        .await
        .unwrap();
    manager
        .save(&mut conn, Entity::new("Person").set("name", json!("Bo")))
        .await
        .unwrap();

    let people = manager
        .find(&mut conn, "Person", &BTreeMap::new())
        .await
        .unwrap();
    assert_eq!(people.len(), 2);

    let ada = people.iter().find(|p| p.get("name") == Some(&json!("Ada"))).unwrap();
    let Some(RelationValue::One(loaded)) = ada.relation("profile") else {
        panic!("expected eagerly loaded profile");
    };
    assert_eq!(loaded.get("bio"), Some(&json!("hi")));

    // No foreign key, no relation entry.
    let bo = people.iter().find(|p| p.get("name") == Some(&json!("Bo"))).unwrap();
    assert!(bo.relation("profile").is_none());
}

#[tokio::test]
async fn inverse_one_to_many_collects_by_owning_attribute() {
    init_logs();
    let mut registry = SchemaRegistry::new();
    registry
        .register(
            EntityClass::new("Customer")
                .attribute(
                    AttributeDescriptor::new("id", DataType::BigInt)
                        .identifier()
                        .generated(),
                )
                .attribute(AttributeDescriptor::new("name", DataType::Text))
                .attribute(AttributeDescriptor::relation(
                    "orders",
                    RelationDescriptor::one_to_many("Order")
                        .mapped_by("customer")
                        .eager(),
                )),
        )
        .unwrap();
    registry
        .register(
            EntityClass::new("Order")
                .table("orders")
                .attribute(
                    AttributeDescriptor::new("id", DataType::BigInt)
                        .identifier()
                        .generated(),
                )
                .attribute(AttributeDescriptor::new("total", DataType::Integer))
                .attribute(AttributeDescriptor::relation(
                    "customer",
                    RelationDescriptor::one_to_one("Customer").join_attribute("customer_id"),
                )),
        )
        .unwrap();
    let manager = EntityManager::new(registry);
    let mut conn = connect(&manager).await;
    manager
        .create_entity_definition(&mut conn, "Customer")
        .await
        .unwrap();
    manager
        .create_entity_definition(&mut conn, "Order")
        .await
        .unwrap();

    let customer = manager
        .save(&mut conn, Entity::new("Customer").set("name", json!("Ada")))
        .await
        .unwrap();
    let customer_id = customer.get("id").unwrap().clone();
    for total in [10, 20] {
        manager
            .save(
                &mut conn,
                Entity::new("Order")
                    .set("total", json!(total))
                    .set("customer", customer_id.clone()),
            )
            .await
            .unwrap();
    }

    let found = manager
        .find_by_id(&mut conn, "Customer", &customer_id)
        .await
        .unwrap();
    let Some(RelationValue::Many(orders)) = found.relation("orders") else {
        panic!("expected eagerly collected orders");
    };
    assert_eq!(orders.len(), 2);

    // The owning side stays lazy by default.
    let orders = manager
        .find(&mut conn, "Order", &BTreeMap::new())
        .await
        .unwrap();
    assert_eq!(
        orders[0].relation("customer"),
        Some(&RelationValue::Unloaded(RelationRef {
            target_entity: "Customer".to_string(),
            key: customer_id,
        }))
    );
}

#[tokio::test]
async fn schema_definition_lifecycle() {
    init_logs();
    let manager = animal_manager();
    let mut conn = connect(&manager).await;

    assert!(!manager
        .exists_entity_definition(&mut conn, "Animal")
        .await
        .unwrap());
    assert!(!manager
        .synced_entity_definition(&mut conn, "Animal")
        .await
        .unwrap());

    manager
        .create_entity_definition(&mut conn, "Animal")
        .await
        .unwrap();
    assert!(manager
        .exists_entity_definition(&mut conn, "Animal")
        .await
        .unwrap());
    assert!(manager
        .synced_entity_definition(&mut conn, "Animal")
        .await
        .unwrap());

    // A wider descriptor is out of sync until the missing columns are added.
    let mut wider = SchemaRegistry::new();
    wider
        .register(
            EntityClass::new("Animal")
                .attribute(
                    AttributeDescriptor::new("id", DataType::BigInt)
                        .identifier()
                        .generated(),
                )
                .attribute(AttributeDescriptor::new("name", DataType::Text))
                .attribute(AttributeDescriptor::new("color", DataType::Text)),
        )
        .unwrap();
    let wider = EntityManager::new(wider);

    assert!(!wider
        .synced_entity_definition(&mut conn, "Animal")
        .await
        .unwrap());
    wider
        .update_entity_definition(&mut conn, "Animal")
        .await
        .unwrap();
    assert!(wider
        .synced_entity_definition(&mut conn, "Animal")
        .await
        .unwrap());
}
