//! Turns a routing request into a validated set of candidate routes.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    cache::{RouteCache, cache_key},
    error::Error,
    geo_index::GeoIndex,
    model::{Endpoint, Location, Route},
    provider::{RouteOptions, RoutingProvider},
    route_store::{RouteSet, RouteStore},
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouteRequest {
    pub origin: Location,
    pub waypoint: Option<Location>,
    pub destination: Location,
}
impl RouteRequest {
    pub fn new(origin: Location, destination: Location) -> Self {
        Self {
            origin,
            waypoint: None,
            destination,
        }
    }

    pub fn via(mut self, waypoint: Location) -> Self {
        self.waypoint = Some(waypoint);
        self
    }

    pub fn waypoints(&self) -> Vec<Location> {
        [Some(self.origin), self.waypoint, Some(self.destination)]
            .into_iter()
            .flatten()
            .collect()
    }

    pub fn cache_key(&self) -> String {
        cache_key(self.origin, self.waypoint, self.destination)
    }
}

pub struct RoutingCoordinator {
    /// Id of the most recently started request. Results from older ones are
    /// thrown away.
    latest: AtomicU64,
    options: RouteOptions,
    timeout: Duration,
    cache_ttl: Duration,
}

impl RoutingCoordinator {
    pub fn new(options: RouteOptions, timeout: Duration, cache_ttl: Duration) -> Self {
        Self {
            latest: AtomicU64::new(0),
            options,
            timeout,
            cache_ttl,
        }
    }

    pub async fn compute_route<P: RoutingProvider>(
        &self,
        request: RouteRequest,
        geo: &GeoIndex,
        provider: &P,
        cache: &RouteCache,
        store: &Mutex<RouteStore>,
    ) -> Result<RouteSet, Error> {
        let id = self.latest.fetch_add(1, Ordering::SeqCst) + 1;

        // a blocked waypoint is left to the candidate filtering below
        for (which, point) in [
            (Endpoint::Origin, request.origin),
            (Endpoint::Destination, request.destination),
        ] {
            if let Some(zone_id) = geo.is_point_blocked(point) {
                info!("{which} {point} is inside blocked zone {zone_id}");
                return Err(Error::EndpointBlocked { which, zone_id });
            }
        }

        let key = request.cache_key();
        if let Some(route) = cache.get(&key) {
            // zones may have been blocked since it was cached
            if geo.route_crosses_blocked(&route, store.lock().sample_stride()).is_none() {
                debug!("using cached route for {key}");
                return self.finish(id, vec![route], geo, store);
            }
            debug!("cached route for {key} crosses a blocked zone, ignoring it");
        }

        let waypoints = request.waypoints();
        let routes = match tokio::time::timeout(
            self.timeout,
            provider.route(&waypoints, &self.options),
        )
        .await
        {
            Ok(Ok(routes)) => routes,
            Ok(Err(err)) => {
                warn!("routing provider failed: {err}");
                return Err(err.into());
            }
            Err(_) => {
                warn!("routing provider timed out after {:?}", self.timeout);
                return Err(Error::ProviderTimeout);
            }
        };

        let routes = routes.into_iter().map(Route::into_shared).collect();
        let set = self.finish(id, routes, geo, store)?;

        if let Some(route) = set.current()
            && let Err(err) = cache.put(&key, route.clone(), self.cache_ttl)
        {
            warn!("couldn't cache route: {err}");
        }
        Ok(set)
    }

    /// Stores the candidates, unless a newer request was started in the
    /// meantime.
    fn finish(
        &self,
        id: u64,
        routes: Vec<Arc<Route>>,
        geo: &GeoIndex,
        store: &Mutex<RouteStore>,
    ) -> Result<RouteSet, Error> {
        if self.latest.load(Ordering::SeqCst) != id {
            debug!("request {id} was superseded");
            return Err(Error::Superseded);
        }

        let mut store = store.lock();
        store.set_candidates(routes, geo)?;
        Ok(store.route_set())
    }

    pub fn switch_alternative(
        &self,
        store: &Mutex<RouteStore>,
        geo: &GeoIndex,
    ) -> Result<Arc<Route>, Error> {
        store.lock().select_next(geo)
    }

    /// Makes any request that's currently in flight return
    /// [`Error::Superseded`] instead of touching the store.
    pub fn cancel(&self) {
        self.latest.fetch_add(1, Ordering::SeqCst);
    }
}
