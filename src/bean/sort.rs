use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::BeanDto;

/// Direction of a sort key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortOrder {
    /// Natural order of the property values.
    #[default]
    Ascending,
    /// Inverse of the natural order.
    Descending,
}

/// Sorts by one property.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortKey {
    /// The property to compare.
    pub property: String,
    /// The direction.
    pub order: SortOrder,
}

impl SortKey {
    /// Sorts by `property` in natural order.
    pub fn ascending(property: impl Into<String>) -> Self {
        SortKey {
            property: property.into(),
            order: SortOrder::Ascending,
        }
    }

    /// Sorts by `property` in inverse natural order.
    pub fn descending(property: impl Into<String>) -> Self {
        SortKey {
            property: property.into(),
            order: SortOrder::Descending,
        }
    }
}

/// Orders [`BeanDto`]s by a list of sort keys.
///
/// Keys are compared in turn until one differs. Missing and null values sort after all other values
/// whatever the direction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BeanDtoComparator {
    keys: Vec<SortKey>,
}

impl BeanDtoComparator {
    /// Creates a comparator from sort keys, most significant first.
    pub fn new(keys: impl IntoIterator<Item = SortKey>) -> Self {
        BeanDtoComparator {
            keys: keys.into_iter().collect(),
        }
    }

    /// The sort keys.
    pub fn keys(&self) -> &[SortKey] {
        &self.keys
    }

    /// Compares two DTOs.
    pub fn compare(&self, first: &BeanDto, second: &BeanDto) -> Ordering {
        for key in &self.keys {
            let ordering = compare_property(
                first.value(&key.property),
                second.value(&key.property),
                key.order,
            );
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    /// Sorts DTOs in place. The sort is stable.
    pub fn sort(&self, dtos: &mut [BeanDto]) {
        dtos.sort_by(|first, second| self.compare(first, second));
    }
}

fn compare_property(first: Option<&Value>, second: Option<&Value>, order: SortOrder) -> Ordering {
    let first = first.filter(|value| !value.is_null());
    let second = second.filter(|value| !value.is_null());
    match (first, second) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(first), Some(second)) => match order {
            SortOrder::Ascending => compare_values(first, second),
            SortOrder::Descending => compare_values(first, second).reverse(),
        },
    }
}

/// The natural order of JSON values.
///
/// Values of the same kind compare naturally: `false < true`, numbers numerically, strings
/// lexicographically, arrays element by element. Values of different kinds order by kind:
/// null, booleans, numbers, strings, arrays, objects.
pub fn compare_values(first: &Value, second: &Value) -> Ordering {
    match (first, second) {
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Number(a), Value::Number(b)) => {
            if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
                a.cmp(&b)
            } else if let (Some(a), Some(b)) = (a.as_u64(), b.as_u64()) {
                a.cmp(&b)
            } else {
                let a = a.as_f64().unwrap_or(f64::NAN);
                let b = b.as_f64().unwrap_or(f64::NAN);
                a.total_cmp(&b)
            }
        }
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Array(a), Value::Array(b)) => a
            .iter()
            .zip(b)
            .map(|(a, b)| compare_values(a, b))
            .find(|ordering| *ordering != Ordering::Equal)
            .unwrap_or_else(|| a.len().cmp(&b.len())),
        (Value::Object(a), Value::Object(b)) => a.len().cmp(&b.len()),
        (a, b) => kind_rank(a).cmp(&kind_rank(b)),
    }
}

fn kind_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}
