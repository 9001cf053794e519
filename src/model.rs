use crate::core::FieldMap;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// A typed struct that maps onto a registered entity type.
///
/// Serialization goes through `serde_json`, so field names in the struct are
/// the column names. Implementors should declare their fields explicitly;
/// when they don't, the registry infers them from `Self::default()`.
pub trait EntityModel: Serialize + DeserializeOwned + Default + Send + Sync + 'static {
    fn type_name() -> &'static str;

    /// Explicit field declarations. `None` selects inference.
    fn field_definitions() -> Option<FieldMap> {
        None
    }

    fn table_name() -> Option<&'static str> {
        None
    }
}

/// Infers fields from the model's default value.
///
/// Lossy by nature: a whole-number float default reads as an integer and a
/// `None` default reads as text. Serialization failure yields an empty map.
pub fn infer_fields<T: EntityModel>() -> FieldMap {
    match serde_json::to_value(T::default()) {
        Ok(sample) => FieldMap::infer_from_sample(&sample),
        Err(_) => FieldMap::new(),
    }
}

/// Explicit declarations first, inference second.
pub fn extract_fields<T: EntityModel>() -> FieldMap {
    T::field_definitions().unwrap_or_else(infer_fields::<T>)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FieldDef, FieldKind};
    use serde::{Deserialize, Serializer};

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Note {
        title: String,
        pinned: bool,
        #[serde(rename = "_draft")]
        draft: Option<String>,
    }

    impl EntityModel for Note {
        fn type_name() -> &'static str {
            "Note"
        }
    }

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Declared {
        sku: String,
    }

    impl EntityModel for Declared {
        fn type_name() -> &'static str {
            "Declared"
        }

        fn field_definitions() -> Option<FieldMap> {
            Some(FieldMap::new().with("sku", FieldDef::text().primary_key()))
        }
    }

    #[derive(Debug, Default, Deserialize)]
    struct Broken;

    impl Serialize for Broken {
        fn serialize<S: Serializer>(&self, _: S) -> std::result::Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("cannot serialize"))
        }
    }

    impl EntityModel for Broken {
        fn type_name() -> &'static str {
            "Broken"
        }
    }

    #[test]
    fn inference_skips_internal_members() {
        let fields = extract_fields::<Note>();
        assert_eq!(fields.names(), vec!["pinned", "title"]);
        assert_eq!(fields.get("pinned").map(|f| f.kind), Some(FieldKind::Boolean));
    }

    #[test]
    fn explicit_declarations_win() {
        let fields = extract_fields::<Declared>();
        assert!(fields.get("sku").map(|f| f.options.primary_key).unwrap_or(false));
    }

    #[test]
    fn failed_inference_is_empty() {
        assert!(extract_fields::<Broken>().is_empty());
    }
}
