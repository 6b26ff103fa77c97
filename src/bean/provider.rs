use std::{fmt, sync::Arc};

use super::{Bean, BeanDto, BeanDtoComparator, HashMapCrudRepository, SortKey};
use crate::error::CrudError;

/// Reads beans from a repository as DTOs.
pub struct BeanProvider<B: Bean> {
    repository: Arc<HashMapCrudRepository<B>>,
}

impl<B: Bean> BeanProvider<B> {
    /// Creates a provider reading from `repository`.
    pub fn new(repository: Arc<HashMapCrudRepository<B>>) -> Self {
        BeanProvider { repository }
    }

    /// The repository beans are read from.
    pub fn repository(&self) -> &Arc<HashMapCrudRepository<B>> {
        &self.repository
    }

    /// DTOs of the beans stored under `ids`, in the order of `ids`.
    ///
    /// Ids without a bean are skipped, so an unknown id yields an empty list.
    pub fn read(&self, ids: &[B::Id]) -> Result<Vec<BeanDto>, CrudError> {
        self.repository
            .find_many(ids)
            .iter()
            .map(|bean| Ok(BeanDto::from_bean(bean)?))
            .collect()
    }

    /// DTOs of all stored beans, ordered by `sort`.
    pub fn read_all(&self, sort: &[SortKey]) -> Result<Vec<BeanDto>, CrudError> {
        let mut dtos = self
            .repository
            .find_all()
            .iter()
            .map(BeanDto::from_bean)
            .collect::<Result<Vec<_>, _>>()?;
        BeanDtoComparator::new(sort.iter().cloned()).sort(&mut dtos);
        Ok(dtos)
    }
}

impl<B: Bean> Clone for BeanProvider<B> {
    fn clone(&self) -> Self {
        BeanProvider {
            repository: self.repository.clone(),
        }
    }
}

impl<B: Bean> fmt::Debug for BeanProvider<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BeanProvider")
            .field("repository", &self.repository)
            .finish()
    }
}
