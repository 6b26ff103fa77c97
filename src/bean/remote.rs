use std::{fmt, marker::PhantomData, sync::Arc};

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use super::{Bean, BeanDto, BeanProvider, SortKey};
use crate::{
    error::{CrudError, InvocationError, RemoteError, RemoteErrorKind},
    invocation::{service_fn, InvocationClientService, InvocationServerServiceRegistry},
};

/// The CRUD operations exposed for an entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CrudOperation {
    /// Ids to DTOs.
    Read,
    /// Sort keys to all DTOs.
    ReadAll,
    /// DTO of a new bean to its stored DTO.
    Create,
    /// DTO of a changed bean to its stored DTO.
    Update,
    /// Id to the DTO of the deleted bean.
    Delete,
}

impl CrudOperation {
    /// All operations.
    pub const ALL: [CrudOperation; 5] = [
        CrudOperation::Read,
        CrudOperation::ReadAll,
        CrudOperation::Create,
        CrudOperation::Update,
        CrudOperation::Delete,
    ];

    fn as_str(self) -> &'static str {
        match self {
            CrudOperation::Read => "read",
            CrudOperation::ReadAll => "read_all",
            CrudOperation::Create => "create",
            CrudOperation::Update => "update",
            CrudOperation::Delete => "delete",
        }
    }

    /// The method name of this operation for `entity`, e.g. `person.read`.
    pub fn method_name(self, entity: &str) -> String {
        format!("{entity}.{}", self.as_str())
    }
}

impl From<CrudError> for RemoteError {
    fn from(err: CrudError) -> Self {
        let kind = match err {
            CrudError::Conversion(_) => RemoteErrorKind::InvalidParameter,
            _ => RemoteErrorKind::ServiceFailure,
        };
        RemoteError::new(kind, err.to_string())
    }
}

fn parse<T: DeserializeOwned>(parameter: Value) -> Result<T, RemoteError> {
    serde_json::from_value(parameter).map_err(RemoteError::invalid_parameter)
}

fn reply<T: Serialize>(value: &T) -> Result<Value, RemoteError> {
    serde_json::to_value(value).map_err(RemoteError::service_failure)
}

/// Registers the CRUD operations of `entity` as methods backed by `provider`.
pub fn register_crud_methods<B: Bean>(
    registry: &InvocationServerServiceRegistry,
    entity: &str,
    provider: BeanProvider<B>,
) {
    let provider = Arc::new(provider);

    let read = provider.clone();
    registry.register_method(
        CrudOperation::Read.method_name(entity),
        service_fn(move |_ctx, parameter| {
            let provider = read.clone();
            async move {
                let ids: Vec<B::Id> = parse(parameter)?;
                reply(&provider.read(&ids)?)
            }
        }),
    );

    let read_all = provider.clone();
    registry.register_method(
        CrudOperation::ReadAll.method_name(entity),
        service_fn(move |_ctx, parameter| {
            let provider = read_all.clone();
            async move {
                let sort: Vec<SortKey> = parse(parameter)?;
                reply(&provider.read_all(&sort)?)
            }
        }),
    );

    let create = provider.clone();
    registry.register_method(
        CrudOperation::Create.method_name(entity),
        service_fn(move |_ctx, parameter| {
            let provider = create.clone();
            async move {
                let dto: BeanDto = parse(parameter)?;
                let mut bean = provider.repository().create();
                merge_into(&mut bean, &dto)?;
                provider.repository().post_create(bean.clone())?;
                reply(&BeanDto::from_bean(&bean).map_err(CrudError::from)?)
            }
        }),
    );

    let update = provider.clone();
    registry.register_method(
        CrudOperation::Update.method_name(entity),
        service_fn(move |_ctx, parameter| {
            let provider = update.clone();
            async move {
                let dto: BeanDto = parse(parameter)?;
                let bean: B = dto.to_bean().map_err(CrudError::from)?;
                let bean = provider.repository().update(bean)?;
                reply(&BeanDto::from_bean(&bean).map_err(CrudError::from)?)
            }
        }),
    );

    let delete = provider;
    registry.register_method(
        CrudOperation::Delete.method_name(entity),
        service_fn(move |_ctx, parameter| {
            let provider = delete.clone();
            async move {
                let id: B::Id = parse(parameter)?;
                let bean = provider.repository().delete(&id)?;
                reply(&BeanDto::from_bean(&bean).map_err(CrudError::from)?)
            }
        }),
    );
}

/// Overwrites the properties of a freshly created bean with those present in `dto`.
fn merge_into<B: Bean>(bean: &mut B, dto: &BeanDto) -> Result<(), CrudError> {
    let mut merged = BeanDto::from_bean(bean)?;
    for (property, value) in &dto.properties {
        merged.set_value(property.clone(), value.clone());
    }
    *bean = merged.to_bean()?;
    Ok(())
}

/// Calls the CRUD methods registered by [`register_crud_methods`] for one entity.
pub struct RemoteCrudClient<B> {
    service: InvocationClientService,
    entity: String,
    phantom: PhantomData<fn() -> B>,
}

impl<B: Bean> RemoteCrudClient<B> {
    /// Creates a client for `entity`.
    pub fn new(service: InvocationClientService, entity: impl Into<String>) -> Self {
        RemoteCrudClient {
            service,
            entity: entity.into(),
            phantom: PhantomData,
        }
    }

    async fn call<P, R>(&self, operation: CrudOperation, parameter: &P) -> Result<R, InvocationError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.service
            .invoke(&operation.method_name(&self.entity), parameter)?
            .result_as()
            .await
    }

    /// DTOs of the beans stored under `ids`.
    pub async fn read(&self, ids: &[B::Id]) -> Result<Vec<BeanDto>, InvocationError> {
        self.call(CrudOperation::Read, ids).await
    }

    /// DTOs of all beans, ordered by `sort`.
    pub async fn read_all(&self, sort: &[SortKey]) -> Result<Vec<BeanDto>, InvocationError> {
        self.call(CrudOperation::ReadAll, sort).await
    }

    /// Creates a bean from the properties in `dto`. Properties it does not set keep the values the
    /// server's factory gave them.
    pub async fn create(&self, dto: &BeanDto) -> Result<B, InvocationError> {
        let stored: BeanDto = self.call(CrudOperation::Create, dto).await?;
        Ok(stored.to_bean()?)
    }

    /// Replaces a stored bean.
    pub async fn update(&self, bean: &B) -> Result<B, InvocationError> {
        let dto = BeanDto::from_bean(bean)?;
        let stored: BeanDto = self.call(CrudOperation::Update, &dto).await?;
        Ok(stored.to_bean()?)
    }

    /// Deletes the bean stored under `id`, returning it.
    pub async fn delete(&self, id: &B::Id) -> Result<B, InvocationError> {
        let deleted: BeanDto = self.call(CrudOperation::Delete, id).await?;
        Ok(deleted.to_bean()?)
    }
}

impl<B> fmt::Debug for RemoteCrudClient<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteCrudClient")
            .field("entity", &self.entity)
            .finish()
    }
}
