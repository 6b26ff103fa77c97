use std::{collections::BTreeMap, fmt, hash::Hash};

use serde::{de::DeserializeOwned, ser::Error as _, Deserialize, Serialize};
use serde_json::{Map, Value};

/// A domain entity, the unit of CRUD operations.
///
/// A bean must serialize to a map of properties.
pub trait Bean: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// The type identifying a bean.
    type Id: Clone + Eq + Hash + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// The bean's id.
    fn id(&self) -> Self::Id;

    /// The bean's version, used for optimistic concurrency checks.
    fn version(&self) -> u64 {
        0
    }

    /// Stores a new version. Beans without a version field ignore it.
    fn set_version(&mut self, _version: u64) {}
}

/// A property-map snapshot of a bean.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BeanDto {
    /// The bean's id.
    pub id: Value,
    /// The bean's version.
    pub version: u64,
    /// The bean's properties by name.
    pub properties: BTreeMap<String, Value>,
}

impl BeanDto {
    /// Creates a DTO without properties.
    pub fn new(id: Value, version: u64) -> Self {
        BeanDto {
            id,
            version,
            properties: BTreeMap::new(),
        }
    }

    /// Snapshots a bean.
    pub fn from_bean<B: Bean>(bean: &B) -> Result<Self, serde_json::Error> {
        let properties = match serde_json::to_value(bean)? {
            Value::Object(map) => map.into_iter().collect(),
            other => {
                return Err(serde_json::Error::custom(format!(
                    "bean must serialize to a map, got {other}"
                )))
            }
        };
        Ok(BeanDto {
            id: serde_json::to_value(bean.id())?,
            version: bean.version(),
            properties,
        })
    }

    /// Rebuilds a bean from the DTO's properties.
    pub fn to_bean<B: DeserializeOwned>(&self) -> Result<B, serde_json::Error> {
        let map: Map<String, Value> = self
            .properties
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        serde_json::from_value(Value::Object(map))
    }

    /// The value of a property, `None` if the DTO has no such property.
    pub fn value(&self, property: &str) -> Option<&Value> {
        self.properties.get(property)
    }

    /// Sets a property, returning its previous value.
    pub fn set_value(&mut self, property: impl Into<String>, value: Value) -> Option<Value> {
        self.properties.insert(property.into(), value)
    }

    /// Sets a property.
    pub fn with_value(mut self, property: impl Into<String>, value: Value) -> Self {
        self.set_value(property, value);
        self
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Job {
        id: u32,
        title: String,
    }

    impl Bean for Job {
        type Id = u32;

        fn id(&self) -> u32 {
            self.id
        }
    }

    #[test]
    fn dto_snapshots_properties() -> Result<(), serde_json::Error> {
        let job = Job {
            id: 7,
            title: "Baker".to_string(),
        };
        let dto = BeanDto::from_bean(&job)?;

        assert_eq!(dto.id, json!(7));
        assert_eq!(dto.value("title"), Some(&json!("Baker")));
        assert_eq!(dto.value("salary"), None);
        assert_eq!(dto.to_bean::<Job>()?, job);
        Ok(())
    }

    #[test]
    fn modified_dto_rebuilds_modified_bean() -> Result<(), serde_json::Error> {
        let dto = BeanDto::from_bean(&Job {
            id: 1,
            title: "Baker".to_string(),
        })?
        .with_value("title", json!("Butcher"));

        assert_eq!(dto.to_bean::<Job>()?.title, "Butcher");
        Ok(())
    }
}
