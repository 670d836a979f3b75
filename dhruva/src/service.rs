use std::sync::Arc;

use crate::controller::{Destination, ExecutionContext, RoutingTable};
use crate::message::Request;
use crate::Result;

/// Chooses where an inbound request goes.
///
/// `None` means there is no route and the request is rejected.
#[async_trait::async_trait]
pub trait RoutingService: Sync + Send + 'static {
    /// Returns the service name.
    fn name(&self) -> &str;

    async fn route(&self, request: &Request, context: &ExecutionContext) -> Result<Option<Destination>>;
}

/// Routes by matching the Request-URI against a [`RoutingTable`].
pub struct StaticRouting {
    table: Arc<RoutingTable>,
}

impl StaticRouting {
    pub fn new(table: Arc<RoutingTable>) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &Arc<RoutingTable> {
        &self.table
    }
}

#[async_trait::async_trait]
impl RoutingService for StaticRouting {
    fn name(&self) -> &str {
        "StaticRouting"
    }

    async fn route(&self, request: &Request, _context: &ExecutionContext) -> Result<Option<Destination>> {
        Ok(self.table.route(&request.uri().to_string()))
    }
}
