//! Property declarations and their normalized form.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ModelError, ModelResult};
use crate::settings::PropertySettings;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PropertyType {
    Text,
    Number,
    Integer,
    Boolean,
    Date,
    Binary,
    Object,
    Enum,
    Serial,
    Point,
    /// A type registered with `Orm::define_type`
    Custom(String),
}

impl PropertyType {
    /// Built-in type for `name`, accepting the `string` / `buffer` aliases.
    pub fn builtin(name: &str) -> Option<PropertyType> {
        let kind = match name {
            "text" | "string" => PropertyType::Text,
            "number" => PropertyType::Number,
            "integer" => PropertyType::Integer,
            "boolean" => PropertyType::Boolean,
            "date" => PropertyType::Date,
            "binary" | "buffer" => PropertyType::Binary,
            "object" => PropertyType::Object,
            "enum" => PropertyType::Enum,
            "serial" => PropertyType::Serial,
            "point" => PropertyType::Point,
            _ => return None,
        };
        Some(kind)
    }

    pub fn as_str(&self) -> &str {
        match self {
            PropertyType::Text => "text",
            PropertyType::Number => "number",
            PropertyType::Integer => "integer",
            PropertyType::Boolean => "boolean",
            PropertyType::Date => "date",
            PropertyType::Binary => "binary",
            PropertyType::Object => "object",
            PropertyType::Enum => "enum",
            PropertyType::Serial => "serial",
            PropertyType::Point => "point",
            PropertyType::Custom(name) => name,
        }
    }
}

impl From<String> for PropertyType {
    fn from(name: String) -> Self {
        PropertyType::builtin(&name).unwrap_or(PropertyType::Custom(name))
    }
}

impl From<PropertyType> for String {
    fn from(kind: PropertyType) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a property comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyClass {
    /// Declared on the model itself
    Primary,
    /// Implicit key column with no declaration
    Key,
    /// Merged in from an extension table
    Extend,
}

/// Normalized column descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: PropertyType,
    pub required: bool,
    pub lazyload: bool,
    pub key: bool,
    pub klass: PropertyClass,
    pub default_value: Option<Value>,
    pub size: Option<u32>,
    pub unsigned: bool,
    pub rational: bool,
    pub values: Vec<Value>,
}

impl Property {
    /// Descriptor for an id column that has no declaration of its own.
    pub fn implicit_key(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: PropertyType::Serial,
            required: false,
            lazyload: false,
            key: true,
            klass: PropertyClass::Key,
            default_value: None,
            size: None,
            unsigned: false,
            rational: false,
            values: Vec::new(),
        }
    }
}

/// A user-registered storage type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomType {
    /// Column type the driver should create
    pub datastore: String,
}

impl CustomType {
    pub fn new(datastore: impl Into<String>) -> Self {
        Self {
            datastore: datastore.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropertyOptions {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub required: Option<bool>,
    pub lazyload: Option<bool>,
    pub key: Option<bool>,
    #[serde(alias = "defaultValue")]
    pub default_value: Option<Value>,
    pub size: Option<u32>,
    pub unsigned: Option<bool>,
    pub rational: Option<bool>,
    pub values: Option<Vec<Value>>,
}

/// Raw property declaration, before normalization.
///
/// Deserializes from a type name (`"text"`), a list of enum values, or an
/// options object (`{"type": "integer", "required": true}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyDecl {
    Type(String),
    Values(Vec<Value>),
    Full(PropertyOptions),
}

macro_rules! typed_decl {
    ($($fn_name:ident => $type_name:literal),* $(,)?) => {
        $(
            pub fn $fn_name() -> Self {
                Self::of_type($type_name)
            }
        )*
    };
}

impl PropertyDecl {
    typed_decl! {
        text => "text",
        number => "number",
        integer => "integer",
        boolean => "boolean",
        date => "date",
        binary => "binary",
        object => "object",
        serial => "serial",
        point => "point",
    }

    pub fn of_type(name: &str) -> Self {
        PropertyDecl::Full(PropertyOptions {
            kind: Some(name.to_string()),
            ..Default::default()
        })
    }

    pub fn enumeration<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        PropertyDecl::Values(values.into_iter().map(Into::into).collect())
    }

    fn into_options(self) -> PropertyOptions {
        match self {
            PropertyDecl::Type(kind) => PropertyOptions {
                kind: Some(kind),
                ..Default::default()
            },
            PropertyDecl::Values(values) => PropertyOptions {
                kind: Some("enum".to_string()),
                values: Some(values),
                ..Default::default()
            },
            PropertyDecl::Full(options) => options,
        }
    }

    fn with(self, update: impl FnOnce(&mut PropertyOptions)) -> Self {
        let mut options = self.into_options();
        update(&mut options);
        PropertyDecl::Full(options)
    }

    pub fn required(self) -> Self {
        self.with(|o| o.required = Some(true))
    }

    pub fn optional(self) -> Self {
        self.with(|o| o.required = Some(false))
    }

    pub fn lazy(self) -> Self {
        self.with(|o| o.lazyload = Some(true))
    }

    pub fn key(self) -> Self {
        self.with(|o| o.key = Some(true))
    }

    pub fn default_value(self, value: impl Into<Value>) -> Self {
        let value = value.into();
        self.with(|o| o.default_value = Some(value))
    }

    pub fn size(self, size: u32) -> Self {
        self.with(|o| o.size = Some(size))
    }

    pub fn unsigned(self) -> Self {
        self.with(|o| o.unsigned = Some(true))
    }

    pub fn rational(self, rational: bool) -> Self {
        self.with(|o| o.rational = Some(rational))
    }
}

impl From<&str> for PropertyDecl {
    fn from(kind: &str) -> Self {
        PropertyDecl::Type(kind.to_string())
    }
}

impl From<PropertyType> for PropertyDecl {
    fn from(kind: PropertyType) -> Self {
        PropertyDecl::Type(kind.as_str().to_string())
    }
}

/// Turn a raw declaration into a [`Property`].
pub fn normalize(
    name: &str,
    decl: &PropertyDecl,
    custom_types: &HashMap<String, CustomType>,
    settings: &PropertySettings,
) -> ModelResult<Property> {
    let options = decl.clone().into_options();

    let type_name = match (&options.kind, &options.values) {
        (Some(kind), _) => kind.as_str(),
        (None, Some(_)) => "enum",
        (None, None) => "text",
    };

    let kind = match PropertyType::builtin(type_name) {
        Some(kind) => kind,
        None if custom_types.contains_key(type_name) => PropertyType::Custom(type_name.to_string()),
        None => {
            return Err(ModelError::Schema(format!(
                "unknown type '{type_name}' for property '{name}'"
            )))
        }
    };

    let values = options.values.unwrap_or_default();
    if kind == PropertyType::Enum && values.is_empty() {
        return Err(ModelError::Schema(format!(
            "enum property '{name}' declares no values"
        )));
    }

    let rational = options
        .rational
        .unwrap_or(matches!(kind, PropertyType::Number));

    Ok(Property {
        name: name.to_string(),
        rational,
        required: options.required.unwrap_or(settings.required),
        lazyload: options.lazyload.unwrap_or(false),
        key: options.key.unwrap_or(false),
        klass: PropertyClass::Primary,
        default_value: options.default_value,
        size: options.size,
        unsigned: options.unsigned.unwrap_or(false),
        values,
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn norm(decl: PropertyDecl) -> ModelResult<Property> {
        normalize("field", &decl, &HashMap::new(), &PropertySettings::default())
    }

    #[test]
    fn test_type_name_shorthand() {
        let prop = norm("string".into()).unwrap();

        assert_eq!(prop.kind, PropertyType::Text);
        assert!(!prop.required);
        assert_eq!(prop.klass, PropertyClass::Primary);
    }

    #[test]
    fn test_value_list_becomes_enum() {
        let prop = norm(PropertyDecl::enumeration(["male", "female"])).unwrap();

        assert_eq!(prop.kind, PropertyType::Enum);
        assert_eq!(prop.values, vec![json!("male"), json!("female")]);
    }

    #[test]
    fn test_integer_is_not_rational() {
        assert!(!norm(PropertyDecl::integer()).unwrap().rational);
        assert!(norm(PropertyDecl::number()).unwrap().rational);
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let err = norm(PropertyDecl::of_type("money")).unwrap_err();
        assert!(matches!(err, ModelError::Schema(ref m) if m.contains("money")));
    }

    #[test]
    fn test_custom_type_is_accepted() {
        let mut custom = HashMap::new();
        custom.insert("money".to_string(), CustomType::new("DECIMAL(10,2)"));

        let prop = normalize(
            "price",
            &PropertyDecl::of_type("money"),
            &custom,
            &PropertySettings::default(),
        )
        .unwrap();

        assert_eq!(prop.kind, PropertyType::Custom("money".to_string()));
    }

    #[test]
    fn test_required_default_follows_settings() {
        let settings = PropertySettings {
            required: true,
            ..Default::default()
        };
        let prop = normalize("name", &"text".into(), &HashMap::new(), &settings).unwrap();
        assert!(prop.required);

        let prop =
            normalize("name", &PropertyDecl::text().optional(), &HashMap::new(), &settings).unwrap();
        assert!(!prop.required);
    }

    #[test]
    fn test_builder_chain_on_shorthand() {
        let decl = PropertyDecl::from("text").lazy().default_value("n/a").size(64);
        let prop = norm(decl).unwrap();

        assert!(prop.lazyload);
        assert_eq!(prop.default_value, Some(json!("n/a")));
        assert_eq!(prop.size, Some(64));
    }

    #[test]
    fn test_deserialize_declarations() {
        let decls: HashMap<String, PropertyDecl> = serde_json::from_value(json!({
            "name": "text",
            "sex": ["m", "f"],
            "age": { "type": "integer", "required": true, "defaultValue": 18 }
        }))
        .unwrap();

        let age = norm(decls["age"].clone()).unwrap();
        assert_eq!(age.kind, PropertyType::Integer);
        assert!(age.required);
        assert_eq!(age.default_value, Some(json!(18)));
        assert_eq!(norm(decls["sex"].clone()).unwrap().kind, PropertyType::Enum);
    }
}
