//! Condition checks
//!
//! Conditions may name a One association instead of its foreign key columns:
//! `{"owner": 4}`, `{"owner": [1, 2]}` for composite keys, or
//! `{"owner": {"id": 4}}` with the related row's ids. Those entries are
//! rewritten onto the foreign key columns before reaching the driver.

use serde_json::Value;

use crate::backends::Conditions;
use crate::model::Model;
use crate::relationships::OneAssociation;

pub fn check_conditions(model: &Model, conditions: Conditions) -> Conditions {
    let mut out = Conditions::new();

    for (key, value) in conditions {
        match model.one_association(&key) {
            Some(assoc) => {
                for (field, value) in foreign_key_values(model, assoc, value) {
                    out.insert(field, value);
                }
            }
            None => {
                out.insert(key, value);
            }
        }
    }

    out
}

fn foreign_key_values(model: &Model, assoc: &OneAssociation, value: Value) -> Vec<(String, Value)> {
    let fields = assoc.field.iter().cloned();
    match value {
        Value::Object(related) => {
            let target_ids = model
                .resolve(&assoc.target)
                .map(|target| target.id().to_vec())
                .unwrap_or_else(|_| vec!["id".to_string()]);
            fields
                .zip(target_ids)
                .map(|(field, id)| (field, related.get(&id).cloned().unwrap_or(Value::Null)))
                .collect()
        }
        Value::Array(values) if assoc.field.len() > 1 => fields.zip(values).collect(),
        Value::Null => fields.map(|field| (field, Value::Null)).collect(),
        single => fields.take(1).map(|field| (field, single.clone())).collect(),
    }
}
