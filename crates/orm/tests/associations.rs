mod common;

use std::time::Duration;

use common::{data, person_schema, seed_people, setup, setup_slow, Journal};
use relmap_orm::{
    AccessorArg, AccessorOutput, ExtendAssociation, GetOptions, ManyAssociation, ManyQuery,
    ModelError, ModelSchema, OneAssociation, Operation, Orm, PropertyDecl,
};
use serde_json::json;

fn define_pets(orm: &Orm) -> (relmap_orm::Model, relmap_orm::Model) {
    let person = orm
        .define(
            person_schema()
                .has_many(ManyAssociation::new("pets", "pet").prop("since", PropertyDecl::integer()))
                .extend_to(ExtendAssociation::new("address").property("street", PropertyDecl::text())),
        )
        .unwrap();
    let pet = orm
        .define(
            ModelSchema::new("pet")
                .property("name", PropertyDecl::text())
                .has_one(OneAssociation::new("owner", "person")),
        )
        .unwrap();
    (person, pet)
}

#[tokio::test]
async fn test_one_get_set_has_remove() {
    let (driver, orm) = setup();
    seed_people(&driver);
    let (person, pet) = define_pets(&orm);

    let rex = pet.create(data(json!({ "name": "rex" }))).await.unwrap();
    let owner = rex.one("owner").unwrap();
    assert!(owner.get().await.unwrap().is_none());
    assert!(!owner.has().await.unwrap());

    let john = person.get([1]).await.unwrap();
    owner.set(&john).await.unwrap();
    rex.save().await.unwrap();

    assert_eq!(rex.get("owner_id"), Some(json!(1)));
    assert_eq!(driver.rows("pet")[0].get("owner_id"), Some(&json!(1)));
    assert!(owner.has().await.unwrap());
    assert!(owner.get().await.unwrap().unwrap().ptr_eq(&john));

    owner.remove().unwrap();
    assert_eq!(rex.get("owner_id"), Some(json!(null)));
    assert!(!owner.has().await.unwrap());
}

#[tokio::test]
async fn test_one_fetch_goes_through_identity_map() {
    let (driver, orm) = setup();
    seed_people(&driver);
    driver.seed("pet", [data(json!({ "id": 1, "name": "rex", "owner_id": 2 }))]);
    let (person, pet) = define_pets(&orm);

    let jane = person.get([2]).await.unwrap();
    let rex = pet.get([1]).await.unwrap();

    let owner = rex.one("owner").unwrap().get().await.unwrap().unwrap();
    assert!(owner.ptr_eq(&jane));
}

#[tokio::test]
async fn test_one_set_saves_new_target_first() {
    let (driver, orm) = setup();
    let (person, pet) = define_pets(&orm);

    let rex = pet.create(data(json!({ "name": "rex" }))).await.unwrap();
    let newcomer = person.build_new(data(json!({ "name": "new" }))).await.unwrap();
    rex.one("owner").unwrap().set(&newcomer).await.unwrap();

    assert!(!newcomer.is_new());
    assert_eq!(driver.rows("person").len(), 1);
    assert_eq!(rex.get("owner_id"), Some(newcomer.id()[0].clone()));
}

#[tokio::test]
async fn test_association_data_links_on_save() {
    let (driver, orm) = setup();
    seed_people(&driver);
    let (_person, pet) = define_pets(&orm);

    let rex = pet
        .create(data(json!({ "name": "rex", "owner": { "name": "ann" } })))
        .await
        .unwrap();

    assert_eq!(driver.rows("person").len(), 3);
    assert_eq!(rex.get("owner_id"), Some(json!(3)));
}

#[tokio::test]
async fn test_find_accepts_association_conditions() {
    let (driver, orm) = setup();
    seed_people(&driver);
    driver.seed(
        "pet",
        [
            data(json!({ "id": 1, "name": "rex", "owner_id": 1 })),
            data(json!({ "id": 2, "name": "tom", "owner_id": 2 })),
        ],
    );
    let (_person, pet) = define_pets(&orm);

    let by_object = pet.find(data(json!({ "owner": { "id": 2 } }))).await.unwrap();
    assert_eq!(by_object.len(), 1);
    assert_eq!(by_object[0].get("name"), Some(json!("tom")));

    let by_key = pet.count(data(json!({ "owner": 1 }))).await.unwrap();
    assert_eq!(by_key, 1);
}

#[tokio::test]
async fn test_many_add_has_remove_set() {
    let (_driver, orm) = setup();
    let (person, pet) = define_pets(&orm);

    let john = person.create(data(json!({ "name": "John" }))).await.unwrap();
    let a = pet.build_new(data(json!({ "name": "a" }))).await.unwrap();
    let b = pet.build_new(data(json!({ "name": "b" }))).await.unwrap();
    let pets = john.many("pets").unwrap();

    assert!(!pets.has(&[]).await.unwrap());
    pets.add(&[a.clone(), b.clone()]).await.unwrap();
    assert!(a.saved() && b.saved());

    let linked = pets.get().await.unwrap();
    assert_eq!(linked.len(), 2);
    assert!(linked[0].ptr_eq(&a));
    assert!(linked[1].ptr_eq(&b));
    assert!(pets.has(&[a.clone()]).await.unwrap());
    assert!(pets.has(&[]).await.unwrap());

    pets.remove(&[a.clone()]).await.unwrap();
    assert!(!pets.has(&[a.clone(), b.clone()]).await.unwrap());
    let linked = pets.get().await.unwrap();
    assert_eq!(linked.len(), 1);
    assert!(linked[0].ptr_eq(&b));

    pets.set(&[a.clone()]).await.unwrap();
    assert!(pets.has(&[a.clone()]).await.unwrap());
    assert!(!pets.has(&[b.clone()]).await.unwrap());

    pets.remove(&[]).await.unwrap();
    assert!(!pets.has(&[]).await.unwrap());
    assert!(pets.get().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_many_get_with_filter_is_not_cached() {
    let (driver, orm) = setup();
    let (person, pet) = define_pets(&orm);

    let john = person.create(data(json!({ "name": "John" }))).await.unwrap();
    let pets = john.many("pets").unwrap();
    for name in ["c", "a", "b"] {
        let item = pet.build_new(data(json!({ "name": name }))).await.unwrap();
        pets.add(&[item]).await.unwrap();
    }

    let sorted = pets.get_with(ManyQuery::new().order("name").limit(2)).await.unwrap();
    let names: Vec<_> = sorted.iter().filter_map(|p| p.get("name")).collect();
    assert_eq!(names, [json!("a"), json!("b")]);

    let finds = driver.calls(Operation::Find);
    pets.get().await.unwrap();
    pets.get().await.unwrap();
    assert_eq!(driver.calls(Operation::Find), finds + 2);
}

#[tokio::test]
async fn test_many_join_rows_carry_properties() {
    let (driver, orm) = setup();
    let (person, pet) = define_pets(&orm);

    let john = person.create(data(json!({ "name": "John" }))).await.unwrap();
    let rex = pet.create(data(json!({ "name": "rex" }))).await.unwrap();
    let pets = john.many("pets").unwrap();

    pets.add_with_props(&rex, data(json!({ "since": 2020 }))).await.unwrap();
    let rows = driver.rows("person_pets");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("person_id"), Some(&json!(1)));
    assert_eq!(rows[0].get("pets_id"), Some(&json!(1)));
    assert_eq!(rows[0].get("since"), Some(&json!(2020)));

    let err = pets
        .add_with_props(&rex, data(json!({ "color": "red" })))
        .await
        .unwrap_err();
    assert!(matches!(err, ModelError::NotDefined { .. }));
}

#[tokio::test]
async fn test_staged_items_link_on_next_save() {
    let (driver, orm) = setup();
    let (person, pet) = define_pets(&orm);

    let john = person.create(data(json!({ "name": "John" }))).await.unwrap();
    let rex = pet.create(data(json!({ "name": "rex" }))).await.unwrap();

    john.many("pets").unwrap().stage(&[rex.clone()]);
    assert!(john.is_dirty());
    assert!(driver.rows("person_pets").is_empty());

    john.save().await.unwrap();
    assert_eq!(driver.rows("person_pets").len(), 1);
    assert!(john.many("pets").unwrap().has(&[rex]).await.unwrap());
    assert!(!john.is_dirty());
}

#[tokio::test]
async fn test_extend_set_get_has_remove() {
    let (driver, orm) = setup();
    let (person, _pet) = define_pets(&orm);

    let john = person.create(data(json!({ "name": "John" }))).await.unwrap();
    let address = john.extension("address").unwrap();
    assert!(!address.has().await.unwrap());
    assert!(address.get().await.unwrap().is_none());

    let ext = address.set(data(json!({ "street": "Main" }))).await.unwrap();
    assert_eq!(ext.get("street"), Some(json!("Main")));
    assert_eq!(john.get("street"), Some(json!("Main")));
    assert!(address.has().await.unwrap());

    let rows = driver.rows("person_address");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("person_id"), Some(&json!(1)));

    address.remove().await.unwrap();
    assert!(!address.has().await.unwrap());
    assert!(john.get("street").is_none());
    assert!(driver.rows("person_address").is_empty());
}

#[tokio::test]
async fn test_extension_properties_are_written_on_save() {
    let (driver, orm) = setup();
    let (person, _pet) = define_pets(&orm);

    let john = person
        .create(data(json!({ "name": "John", "street": "Elm" })))
        .await
        .unwrap();
    assert_eq!(driver.rows("person_address")[0].get("street"), Some(&json!("Elm")));
    assert!(driver.rows("person")[0].get("street").is_none());

    john.set("street", "Oak").unwrap();
    john.save().await.unwrap();
    assert_eq!(driver.rows("person_address")[0].get("street"), Some(&json!("Oak")));
    assert_eq!(driver.rows("person_address").len(), 1);
}

#[tokio::test]
async fn test_extension_may_not_shadow_columns() {
    let (_driver, orm) = setup();

    let err = orm
        .define(
            person_schema()
                .extend_to(ExtendAssociation::new("details").property("name", PropertyDecl::text())),
        )
        .unwrap_err();

    assert!(matches!(err, ModelError::Schema(_)));
}

#[tokio::test]
async fn test_auto_fetch_runs_one_then_many_then_extend() {
    let (driver, orm) = setup();
    seed_people(&driver);
    driver.seed("pet", [data(json!({ "id": 1, "name": "rex", "owner_id": 1 }))]);
    driver.seed("toy", [data(json!({ "id": 1, "name": "ball" }))]);
    driver.seed("pet_toys", [data(json!({ "pet_id": 1, "toys_id": 1 }))]);
    driver.seed("pet_chip", [data(json!({ "pet_id": 1, "code": "X1" }))]);

    let person = orm.define(person_schema()).unwrap();
    let toy = orm
        .define(ModelSchema::new("toy").property("name", PropertyDecl::text()))
        .unwrap();
    let pet = orm
        .define(
            ModelSchema::new("pet")
                .property("name", PropertyDecl::text())
                .has_one(OneAssociation::new("owner", "person").auto_fetch(true))
                .has_many(ManyAssociation::new("toys", "toy").auto_fetch(true))
                .extend_to(
                    ExtendAssociation::new("chip")
                        .property("code", PropertyDecl::text())
                        .auto_fetch(true),
                ),
        )
        .unwrap();

    let journal = Journal::default();
    person.after_load(journal.recorder("one"));
    toy.after_load(journal.recorder("many"));
    orm.model("pet_chip").unwrap().after_load(journal.recorder("extend"));
    pet.after_auto_fetch(journal.recorder("afterAutoFetch"));

    let rex = pet.get([1]).await.unwrap();

    assert_eq!(journal.events(), ["one", "many", "extend", "afterAutoFetch"]);
    assert!(rex.association_state("owner").is_fetched());
    assert!(rex.association_state("toys").is_fetched());
    assert_eq!(rex.get("code"), Some(json!("X1")));
    assert_eq!(
        rex.to_json(),
        json!({
            "id": 1,
            "name": "rex",
            "owner_id": 1,
            "code": "X1",
            "owner": { "id": 1, "name": "test1", "age": 30 },
            "toys": [{ "id": 1, "name": "ball" }],
        })
    );
}

#[tokio::test]
async fn test_auto_fetch_tolerates_dangling_keys() {
    let (driver, orm) = setup();
    driver.seed("pet", [data(json!({ "id": 1, "name": "rex", "owner_id": 99 }))]);
    orm.define(person_schema()).unwrap();
    let pet = orm
        .define(
            ModelSchema::new("pet")
                .property("name", PropertyDecl::text())
                .has_one(OneAssociation::new("owner", "person")),
        )
        .unwrap();

    let rex = pet
        .get_with([1], GetOptions::default().auto_fetch(true))
        .await
        .unwrap();

    assert!(rex.association_state("owner").is_fetched());
    assert!(rex.one("owner").unwrap().get().await.unwrap().is_none());
}

#[tokio::test]
async fn test_cyclic_auto_fetch_terminates() {
    let (driver, orm) = setup();
    driver.seed(
        "person",
        [
            data(json!({ "id": 1, "name": "a", "friend_id": 2 })),
            data(json!({ "id": 2, "name": "b", "friend_id": 1 })),
        ],
    );
    let person = orm
        .define(
            person_schema()
                .has_one(OneAssociation::new("friend", "person").auto_fetch(true))
                .auto_fetch_limit(3),
        )
        .unwrap();

    let a = person.get([1]).await.unwrap();

    let b = a.one("friend").unwrap().get().await.unwrap().unwrap();
    assert_eq!(b.id(), vec![json!(2)]);
    let back = b.one("friend").unwrap().get().await.unwrap().unwrap();
    assert_eq!(back.id(), vec![json!(1)]);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_cyclic_auto_fetch_completes() {
    let (driver, orm) = setup_slow(Duration::from_millis(10));
    driver.seed(
        "person",
        [
            data(json!({ "id": 1, "name": "a", "friend_id": 2 })),
            data(json!({ "id": 2, "name": "b", "friend_id": 1 })),
        ],
    );
    let person = orm
        .define(
            person_schema()
                .has_one(OneAssociation::new("friend", "person").auto_fetch(true))
                .auto_fetch_limit(2),
        )
        .unwrap();

    let (a, b) = tokio::time::timeout(Duration::from_secs(60), async {
        tokio::join!(person.get([1]), person.get([2]))
    })
    .await
    .expect("concurrent cyclic gets must complete");
    let (a, b) = (a.unwrap(), b.unwrap());

    let a_friend = a.one("friend").unwrap().get().await.unwrap().unwrap();
    let b_friend = b.one("friend").unwrap().get().await.unwrap().unwrap();
    assert_eq!(a_friend.id(), vec![json!(2)]);
    assert_eq!(b_friend.id(), vec![json!(1)]);

    // Both top-level builds were cached; later gets reuse them.
    assert!(person.get([1]).await.unwrap().ptr_eq(&a));
    assert!(person.get([2]).await.unwrap().ptr_eq(&b));
}

#[tokio::test]
async fn test_association_auto_fetch_limit_overrides_model_limit() {
    let (driver, orm) = setup();
    driver.seed(
        "person",
        [
            data(json!({ "id": 1, "name": "a", "friend_id": 2, "mentor_id": 3 })),
            data(json!({ "id": 2, "name": "b", "friend_id": 4 })),
            data(json!({ "id": 3, "name": "c", "friend_id": 4 })),
            data(json!({ "id": 4, "name": "d" })),
        ],
    );
    let person = orm
        .define(
            person_schema()
                .has_one(
                    OneAssociation::new("friend", "person")
                        .auto_fetch(true)
                        .auto_fetch_limit(2),
                )
                .has_one(OneAssociation::new("mentor", "person").auto_fetch(true)),
        )
        .unwrap();

    let a = person.get([1]).await.unwrap();
    assert!(a.association_state("friend").is_fetched());
    assert!(a.association_state("mentor").is_fetched());

    let friend = a.one("friend").unwrap().get().await.unwrap().unwrap();
    assert_eq!(friend.id(), vec![json!(2)]);
    assert!(friend.association_state("friend").is_fetched());

    let mentor = a.one("mentor").unwrap().get().await.unwrap().unwrap();
    assert_eq!(mentor.id(), vec![json!(3)]);
    assert!(!mentor.association_state("friend").is_fetched());
}

#[tokio::test]
async fn test_cascade_remove_deletes_join_rows() {
    let (driver, orm) = setup();
    let (person, pet) = define_pets(&orm);

    let john = person.create(data(json!({ "name": "John" }))).await.unwrap();
    let rex = pet.create(data(json!({ "name": "rex" }))).await.unwrap();
    john.many("pets").unwrap().add(&[rex]).await.unwrap();
    john.extension("address")
        .unwrap()
        .set(data(json!({ "street": "Main" })))
        .await
        .unwrap();

    john.remove().await.unwrap();

    assert!(driver.rows("person").is_empty());
    assert!(driver.rows("person_pets").is_empty());
    assert!(driver.rows("person_address").is_empty());
    assert_eq!(driver.rows("pet").len(), 1);
}

#[tokio::test]
async fn test_cascade_can_be_disabled() {
    let (driver, orm) = setup();
    let person = orm
        .define(
            person_schema()
                .has_many(ManyAssociation::new("pets", "pet"))
                .cascade_remove(false),
        )
        .unwrap();
    let pet = orm
        .define(ModelSchema::new("pet").property("name", PropertyDecl::text()))
        .unwrap();

    let john = person.create(data(json!({ "name": "John" }))).await.unwrap();
    let rex = pet.create(data(json!({ "name": "rex" }))).await.unwrap();
    john.many("pets").unwrap().add(&[rex]).await.unwrap();

    john.remove().await.unwrap();

    assert_eq!(driver.rows("person_pets").len(), 1);
}

#[tokio::test]
async fn test_accessors_dispatch_by_method_name() {
    let (_driver, orm) = setup();
    let (person, pet) = define_pets(&orm);

    let john = person.create(data(json!({ "name": "John" }))).await.unwrap();
    let rex = pet.create(data(json!({ "name": "rex" }))).await.unwrap();

    let added = john
        .invoke("addPets", AccessorArg::Instances(vec![rex.clone()]))
        .await
        .unwrap();
    assert!(matches!(added, AccessorOutput::Done));

    let has = john.invoke("hasPets", AccessorArg::None).await.unwrap();
    assert!(matches!(has, AccessorOutput::Bool(true)));

    match john.invoke("getPets", AccessorArg::None).await.unwrap() {
        AccessorOutput::Many(items) => assert!(items[0].ptr_eq(&rex)),
        other => panic!("unexpected output: {other:?}"),
    }

    rex.invoke("setOwner", AccessorArg::Instances(vec![john.clone()]))
        .await
        .unwrap();
    match rex.invoke("getOwner", AccessorArg::None).await.unwrap() {
        AccessorOutput::One(Some(owner)) => assert!(owner.ptr_eq(&john)),
        other => panic!("unexpected output: {other:?}"),
    }

    let set = john
        .invoke("setAddress", AccessorArg::Value(json!({ "street": "Main" })))
        .await
        .unwrap();
    assert!(matches!(set, AccessorOutput::One(Some(_))));

    let err = john.invoke("addAddress", AccessorArg::None).await.unwrap_err();
    assert!(matches!(err, ModelError::NotDefined { .. }));

    let err = rex.invoke("setOwner", AccessorArg::None).await.unwrap_err();
    assert!(matches!(err, ModelError::Schema(_)));
}

#[tokio::test]
async fn test_capabilities_describe_instance_methods() {
    let (_driver, orm) = setup();
    let (person, _pet) = define_pets(&orm);

    let names: Vec<&str> = person
        .capabilities()
        .methods()
        .iter()
        .map(|m| m.name.as_str())
        .collect();

    for expected in ["getPets", "setPets", "hasPets", "addPets", "removePets", "getAddress"] {
        assert!(names.contains(&expected), "missing {expected}");
    }
    assert!(!names.contains(&"addAddress"));
}
