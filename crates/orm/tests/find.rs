mod common;

use std::sync::Arc;

use common::{data, person_schema, seed_people, setup};
use relmap_orm::{
    AggregateFunction, DriverError, ErrorCode, FindArg, FindOptions, MemoryDriver, ModelError,
    Operation, Orm, OrmSettings,
};
use serde_json::json;

fn names(instances: &[relmap_orm::Instance]) -> Vec<String> {
    instances
        .iter()
        .map(|i| i.get("name").and_then(|v| v.as_str().map(String::from)).unwrap_or_default())
        .collect()
}

#[tokio::test]
async fn test_find_returns_rows_in_driver_order() {
    let (driver, orm) = setup();
    seed_people(&driver);
    let person = orm.define(person_schema()).unwrap();

    let people = person.find(data(json!({}))).await.unwrap();

    assert_eq!(people.len(), 2);
    assert_eq!(people[0].id(), vec![json!(1)]);
    assert_eq!(people[1].id(), vec![json!(2)]);
    assert_eq!(names(&people), ["test1", "test2"]);
    assert!(people.iter().all(|p| !p.is_new()));
}

#[tokio::test]
async fn test_find_matches_list_values_as_membership() {
    let (driver, orm) = setup();
    seed_people(&driver);
    let person = orm.define(person_schema()).unwrap();

    let found = person.find(data(json!({ "age": [30, 50] }))).await.unwrap();

    assert_eq!(names(&found), ["test1"]);
}

#[tokio::test]
async fn test_find_by_tells_arguments_apart() {
    let (driver, orm) = setup();
    seed_people(&driver);
    let person = orm.define(person_schema()).unwrap();

    let limited = person.find_by([FindArg::from(1usize)]).unwrap().await.unwrap();
    assert_eq!(names(&limited), ["test1"]);

    let reversed = person.find_by([FindArg::from("-name")]).unwrap().await.unwrap();
    assert_eq!(names(&reversed), ["test2", "test1"]);

    let listed = person
        .find_by([FindArg::from(vec!["name", "Z"])])
        .unwrap()
        .await
        .unwrap();
    assert_eq!(names(&listed), ["test2", "test1"]);

    let skipped = person
        .find_by([
            FindArg::from(data(json!({}))),
            FindArg::from(data(json!({ "offset": 1 }))),
        ])
        .unwrap()
        .await
        .unwrap();
    assert_eq!(names(&skipped), ["test2"]);
}

#[tokio::test]
async fn test_find_by_ignores_unknown_options() {
    let (driver, orm) = setup();
    seed_people(&driver);
    let person = orm.define(person_schema()).unwrap();

    let found = person
        .find_by([
            FindArg::from(data(json!({}))),
            FindArg::from(data(json!({ "bogus": true, "offset": 1 }))),
        ])
        .unwrap()
        .run()
        .await
        .unwrap();
    assert_eq!(names(&found), ["test2"]);

    let err = person
        .find_by([
            FindArg::from(data(json!({}))),
            FindArg::from(data(json!({ "limit": "ten" }))),
        ])
        .unwrap_err();
    assert!(matches!(err, ModelError::Query { .. }));
}

#[tokio::test]
async fn test_chain_can_be_refined_and_rerun() {
    let (driver, orm) = setup();
    seed_people(&driver);
    let person = orm.define(person_schema()).unwrap();

    let chain = person.all().order("-age");
    let oldest = chain.clone().limit(1).run().await.unwrap();
    assert_eq!(names(&oldest), ["test2"]);

    let next = chain.clone().offset(1).run().await.unwrap();
    assert_eq!(names(&next), ["test1"]);

    let young = chain.where_(data(json!({ "age": 30 }))).await.unwrap();
    assert_eq!(names(&young), ["test1"]);
    assert_eq!(driver.calls(Operation::Find), 3);
}

#[tokio::test]
async fn test_one_count_and_exists() {
    let (driver, orm) = setup();
    seed_people(&driver);
    let person = orm.define(person_schema()).unwrap();

    let found = person.one(data(json!({ "name": "test2" }))).await.unwrap().unwrap();
    assert_eq!(found.get("age"), Some(json!(40)));
    assert!(person.one(data(json!({ "name": "nobody" }))).await.unwrap().is_none());

    assert_eq!(person.count(data(json!({}))).await.unwrap(), 2);
    assert_eq!(person.count(data(json!({ "age": 30 }))).await.unwrap(), 1);

    assert!(person.exists(vec![json!(1)]).await.unwrap());
    assert!(!person.exists(vec![json!(9)]).await.unwrap());
    assert!(person.exists(data(json!({ "name": "test1" }))).await.unwrap());
    assert!(!person.exists(json!({ "name": "nobody" })).await.unwrap());
}

#[tokio::test]
async fn test_wrong_key_count_is_rejected() {
    let (driver, orm) = setup();
    seed_people(&driver);
    let person = orm.define(person_schema()).unwrap();

    let err = person.get([1, 2]).await.unwrap_err();
    assert!(matches!(
        err,
        ModelError::ParamMismatch { expected: 1, given: 2, .. }
    ));
    assert_eq!(err.code(), Some(ErrorCode::ParamMismatch));

    let err = person.exists(vec![json!(1), json!(2)]).await.unwrap_err();
    assert!(matches!(err, ModelError::ParamMismatch { .. }));
    assert_eq!(driver.calls(Operation::Find), 0);
}

#[tokio::test]
async fn test_missing_row_is_not_found() {
    let (_driver, orm) = setup();
    let person = orm.define(person_schema()).unwrap();

    let err = person.get([99]).await.unwrap_err();

    assert!(err.is_not_found());
    assert_eq!(err.code(), Some(ErrorCode::NotFound));
}

#[tokio::test]
async fn test_driver_failure_keeps_original_code() {
    let (driver, orm) = setup();
    seed_people(&driver);
    let person = orm.define(person_schema()).unwrap();

    driver.fail_next(Operation::Find, DriverError::with_code("table is locked", "ER_LOCKED"));
    let err = person.all().await.unwrap_err();

    match err {
        ModelError::Query { message, original_code } => {
            assert_eq!(message, "table is locked");
            assert_eq!(original_code.as_deref(), Some("ER_LOCKED"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(person.all().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_optional_capabilities_report_no_support() {
    let driver = Arc::new(MemoryDriver::minimal());
    let orm = Orm::connect(driver.clone(), OrmSettings::default());
    let person = orm.define(person_schema()).unwrap();

    for err in [
        person.sync().await.unwrap_err(),
        person.drop().await.unwrap_err(),
        person.clear().await.unwrap_err(),
        person
            .aggregate(data(json!({})), ["age"])
            .count()
            .get()
            .await
            .unwrap_err(),
    ] {
        assert!(matches!(err, ModelError::NoSupport { .. }), "{err:?}");
        assert_eq!(err.code(), Some(ErrorCode::NoSupport));
    }
}

#[tokio::test]
async fn test_aggregate_functions() {
    let (driver, orm) = setup();
    seed_people(&driver);
    let person = orm.define(person_schema()).unwrap();

    let values = person
        .aggregate(data(json!({})), ["age"])
        .count()
        .sum("age")
        .call(AggregateFunction::Avg, &[])
        .get_one()
        .await
        .unwrap();
    assert_eq!(values, vec![json!(2), json!(70), json!(35)]);

    let rows = person
        .aggregate(data(json!({ "age": 40 })), Vec::<String>::new())
        .max("name")
        .get()
        .await
        .unwrap();
    assert_eq!(rows[0].get("max_name"), Some(&json!("test2")));
}

#[tokio::test]
async fn test_aggregate_groups_keep_first_seen_order() {
    let (driver, orm) = setup();
    seed_people(&driver);
    driver.seed("person", [data(json!({ "id": 3, "name": "test3", "age": 30 }))]);
    let person = orm.define(person_schema()).unwrap();

    let rows = person
        .aggregate(data(json!({})), Vec::<String>::new())
        .count()
        .group_by(["age"])
        .get()
        .await
        .unwrap();

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get("age"), Some(&json!(30)));
    assert_eq!(rows[0].get("count"), Some(&json!(2)));
    assert_eq!(rows[1].get("count"), Some(&json!(1)));
}

#[tokio::test]
async fn test_aggregate_without_functions_fails() {
    let (_driver, orm) = setup();
    let person = orm.define(person_schema()).unwrap();

    let err = person
        .aggregate(data(json!({})), ["age"])
        .get()
        .await
        .unwrap_err();

    assert!(matches!(err, ModelError::Query { ref message, .. } if message == "Missing aggregate functions"));
}

#[tokio::test]
async fn test_extra_columns_are_kept_apart_from_fields() {
    let (driver, orm) = setup();
    driver.seed(
        "person",
        [data(json!({ "id": 1, "name": "test1", "age": 30, "rank": 7 }))],
    );
    let person = orm.define(person_schema()).unwrap();

    let found = person
        .chain(data(json!({})), FindOptions::new().extra(["rank"]).cache(false))
        .await
        .unwrap();

    assert_eq!(found[0].get("rank"), Some(json!(7)));
    assert!(!found[0].fields().contains_key("rank"));
}

#[tokio::test]
async fn test_closed_connection_rejects_operations() {
    let (driver, orm) = setup();
    seed_people(&driver);
    let person = orm.define(person_schema()).unwrap();

    orm.close().await.unwrap();

    assert!(orm.is_closed());
    assert!(matches!(person.all().await.unwrap_err(), ModelError::Disconnected));
    assert!(matches!(person.get([1]).await.unwrap_err(), ModelError::Disconnected));
    assert!(orm.define(person_schema()).is_err());
}
