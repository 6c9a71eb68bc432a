pub mod osrm;

use std::future::Future;

use crate::{
    error::ProviderError,
    model::{Location, Route},
};

pub use osrm::OsrmClient;

#[derive(Debug, Clone)]
pub struct RouteOptions {
    /// Ask for alternative routes in addition to the fastest one.
    pub alternatives: bool,
    pub profile: String,
}
impl Default for RouteOptions {
    fn default() -> Self {
        Self {
            alternatives: true,
            profile: "driving".to_string(),
        }
    }
}

/// Something that can compute candidate routes through a list of waypoints.
///
/// Returning an empty list means the provider found no route at all.
pub trait RoutingProvider: Send + Sync {
    fn route(
        &self,
        waypoints: &[Location],
        options: &RouteOptions,
    ) -> impl Future<Output = Result<Vec<Route>, ProviderError>> + Send;
}
