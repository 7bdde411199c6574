//! Query execution pipeline.
//!
//! Queries are logged like commands but never install an execution context
//! and never participate in the recursion chain.

use std::sync::Arc;
use std::time::Instant;

use soda_core::{BusError, Query};
use tracing::{info, warn};

use crate::interceptor::{short_type_name, summarize};
use crate::registry::QueryRegistry;

/// Routes queries to their single registered handler.
pub struct QueryBus {
    registry: Arc<QueryRegistry>,
}

impl QueryBus {
    pub fn new(registry: Arc<QueryRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<QueryRegistry> {
        &self.registry
    }

    pub async fn send<Q: Query>(&self, query: Q) -> Result<Q::Output, BusError> {
        let query_type = short_type_name::<Q>();
        let resolved = self.registry.resolve::<Q>().ok_or(
            BusError::NoHandlerRegistered {
                message_type: std::any::type_name::<Q>(),
            },
        )?;

        let user = query.metadata().user_name.clone();
        let argument = summarize(&query);
        info!(
            query = query_type,
            handler = %resolved.name,
            argument = %argument,
            user = %user,
            "query start"
        );
        let started = Instant::now();
        let result = resolved.handler.handle(query).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(output) => {
                info!(
                    query = query_type,
                    handler = %resolved.name,
                    duration_ms,
                    user = %user,
                    "query done"
                );
                Ok(output)
            }
            Err(source) => {
                warn!(
                    query = query_type,
                    handler = %resolved.name,
                    duration_ms,
                    user = %user,
                    error = %source,
                    "query failed"
                );
                Err(BusError::Handler {
                    message_type: std::any::type_name::<Q>(),
                    handler: resolved.name,
                    source,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::QueryHandler;
    use async_trait::async_trait;
    use soda_core::{HandlerError, QueryMetadata};

    #[derive(Debug, Clone, Default)]
    struct CountItems {
        meta: QueryMetadata,
    }

    impl Query for CountItems {
        type Output = u64;

        fn metadata(&self) -> &QueryMetadata {
            &self.meta
        }
    }

    struct CountHandler;

    #[async_trait]
    impl QueryHandler<CountItems> for CountHandler {
        async fn handle(&self, _query: CountItems) -> Result<u64, HandlerError> {
            Ok(42)
        }
    }

    #[tokio::test]
    async fn query_returns_handler_output() {
        let registry = Arc::new(QueryRegistry::new());
        registry.register::<CountItems, _>(CountHandler).unwrap();
        let bus = QueryBus::new(registry);
        assert_eq!(bus.send(CountItems::default()).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn missing_query_handler_is_reported() {
        let bus = QueryBus::new(Arc::new(QueryRegistry::new()));
        let err = bus.send(CountItems::default()).await.unwrap_err();
        assert!(matches!(err, BusError::NoHandlerRegistered { .. }));
    }
}
