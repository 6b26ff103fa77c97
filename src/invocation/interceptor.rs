use std::{fmt, sync::Arc};

use serde_json::Value;
use tracing::{info, warn};

use super::ExecutionContext;
use crate::error::{ConfigError, RemoteError, RemoteErrorKind};

/// Hooks run around every method execution on the server.
///
/// Both hooks have no-op defaults.
pub trait ExecutionInterceptor: Send + Sync + 'static {
    /// The name this interceptor is configured by.
    fn name(&self) -> &str;

    /// Called before the service runs. Returning an error skips the service and answers the caller
    /// with that error.
    fn before_execution(&self, ctx: &ExecutionContext) -> Result<(), RemoteError> {
        let _ = ctx;
        Ok(())
    }

    /// Called with the result once the service has returned.
    fn after_execution(&self, ctx: &ExecutionContext, result: &Result<Value, RemoteError>) {
        let _ = (ctx, result);
    }
}

/// Logs the start and outcome of every execution.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingInterceptor;

impl TracingInterceptor {
    /// The name of this interceptor in configuration.
    pub const NAME: &'static str = "tracing";
}

impl ExecutionInterceptor for TracingInterceptor {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn before_execution(&self, ctx: &ExecutionContext) -> Result<(), RemoteError> {
        info!(
            invocation_id = %ctx.invocation_id(),
            method = ctx.method(),
            client_id = ?ctx.client_id(),
            "executing invocation"
        );
        Ok(())
    }

    fn after_execution(&self, ctx: &ExecutionContext, result: &Result<Value, RemoteError>) {
        let elapsed_ms = ctx.elapsed().as_millis() as u64;
        match result {
            Ok(_) => info!(invocation_id = %ctx.invocation_id(), method = ctx.method(), elapsed_ms, "invocation finished"),
            Err(err) => warn!(invocation_id = %ctx.invocation_id(), method = ctx.method(), elapsed_ms, error = %err, "invocation failed"),
        }
    }
}

/// Rejects invocations from clients that did not identify themselves.
#[derive(Clone, Copy, Debug, Default)]
pub struct RequireClientId;

impl RequireClientId {
    /// The name of this interceptor in configuration.
    pub const NAME: &'static str = "require-client-id";
}

impl ExecutionInterceptor for RequireClientId {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn before_execution(&self, ctx: &ExecutionContext) -> Result<(), RemoteError> {
        match ctx.client_id() {
            Some(client_id) if !client_id.is_empty() => Ok(()),
            _ => Err(RemoteError::new(RemoteErrorKind::Rejected, "client id required")),
        }
    }
}

/// Resolves a built-in interceptor by its configured name.
pub fn interceptor_by_name(name: &str) -> Result<Arc<dyn ExecutionInterceptor>, ConfigError> {
    match name {
        TracingInterceptor::NAME => Ok(Arc::new(TracingInterceptor)),
        RequireClientId::NAME => Ok(Arc::new(RequireClientId)),
        other => Err(ConfigError::UnknownInterceptor(other.to_string())),
    }
}

impl fmt::Debug for dyn ExecutionInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ExecutionInterceptor").field(&self.name()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_interceptors_resolve_by_name() -> Result<(), ConfigError> {
        assert_eq!(interceptor_by_name("tracing")?.name(), "tracing");
        assert_eq!(interceptor_by_name("require-client-id")?.name(), "require-client-id");
        assert_eq!(
            interceptor_by_name("audit").map(|_| ()),
            Err(ConfigError::UnknownInterceptor("audit".to_string()))
        );
        Ok(())
    }
}
