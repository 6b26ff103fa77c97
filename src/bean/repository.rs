use std::fmt;

use dashmap::{mapref::entry::Entry, DashMap};
use tracing::debug;

use super::Bean;
use crate::error::CrudError;

type Factory<B> = Box<dyn Fn() -> B + Send + Sync>;

/// An in-memory CRUD repository.
///
/// Creating a bean takes two steps: [`create`](Self::create) builds a fresh, unsaved bean from the
/// factory and [`post_create`](Self::post_create) stores it once it has been filled in.
pub struct HashMapCrudRepository<B: Bean> {
    beans: DashMap<B::Id, B>,
    factory: Factory<B>,
}

impl<B: Bean> HashMapCrudRepository<B> {
    /// Creates an empty repository building new beans with `factory`.
    pub fn new(factory: impl Fn() -> B + Send + Sync + 'static) -> Self {
        HashMapCrudRepository {
            beans: DashMap::new(),
            factory: Box::new(factory),
        }
    }

    /// Builds a new bean. The bean is not stored until passed to [`post_create`](Self::post_create).
    pub fn create(&self) -> B {
        (self.factory)()
    }

    /// Stores a newly created bean.
    pub fn post_create(&self, bean: B) -> Result<(), CrudError> {
        let id = bean.id();
        match self.beans.entry(id) {
            Entry::Occupied(entry) => Err(CrudError::AlreadyExists(format!("{:?}", entry.key()))),
            Entry::Vacant(entry) => {
                debug!(id = ?entry.key(), "stored bean");
                entry.insert(bean);
                Ok(())
            }
        }
    }

    /// The bean stored under `id`.
    pub fn find(&self, id: &B::Id) -> Option<B> {
        self.beans.get(id).map(|bean| bean.value().clone())
    }

    /// The beans stored under `ids`, skipping ids without a bean.
    pub fn find_many<'a>(&self, ids: impl IntoIterator<Item = &'a B::Id>) -> Vec<B> {
        ids.into_iter().filter_map(|id| self.find(id)).collect()
    }

    /// All stored beans, in no particular order.
    pub fn find_all(&self) -> Vec<B> {
        self.beans.iter().map(|bean| bean.value().clone()).collect()
    }

    /// Replaces a stored bean and returns it with its version bumped.
    ///
    /// Fails if no bean is stored under the id, or the stored bean has a newer version. Two writers
    /// holding the same version cannot both succeed.
    pub fn update(&self, mut bean: B) -> Result<B, CrudError> {
        let id = bean.id();
        let mut stored = self
            .beans
            .get_mut(&id)
            .ok_or_else(|| CrudError::NotFound(format!("{id:?}")))?;
        if stored.version() > bean.version() {
            return Err(CrudError::StaleVersion {
                id: format!("{id:?}"),
                stored: stored.version(),
                given: bean.version(),
            });
        }
        bean.set_version(stored.version() + 1);
        *stored = bean.clone();
        Ok(bean)
    }

    /// Removes and returns the bean stored under `id`.
    pub fn delete(&self, id: &B::Id) -> Result<B, CrudError> {
        self.beans
            .remove(id)
            .map(|(_, bean)| bean)
            .ok_or_else(|| CrudError::NotFound(format!("{id:?}")))
    }

    /// Number of stored beans.
    pub fn len(&self) -> usize {
        self.beans.len()
    }

    /// Returns `true` if no bean is stored.
    pub fn is_empty(&self) -> bool {
        self.beans.is_empty()
    }
}

impl<B: Bean> fmt::Debug for HashMapCrudRepository<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashMapCrudRepository")
            .field("len", &self.beans.len())
            .finish()
    }
}
