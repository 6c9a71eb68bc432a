//! Everything one navigation session needs, wired together.

use std::{
    collections::VecDeque,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::channel::mpsc::UnboundedReceiver;
use parking_lot::Mutex;
use tracing::{debug, info, trace};

use crate::{
    cache::RouteCache,
    clock::{Clock, Timestamp},
    config::Config,
    coordinator::{RouteRequest, RoutingCoordinator},
    db::KvStore,
    error::Error,
    geo_index::GeoIndex,
    math,
    model::{Location, PositionFix, Route, Zone},
    provider::{RouteOptions, RoutingProvider},
    route_store::{RouteSet, RouteStore},
    trail::PositionTrail,
    tracker::{ProgressSnapshot, ProgressTracker, TrackerEvent, TrackerState},
};

/// Where position fixes come from, like a GPS receiver.
pub trait PositionSource: Send {
    /// Waits for the next fix. `None` means the source is done.
    fn next_fix(&mut self) -> impl Future<Output = Option<PositionFix>> + Send;
}

/// Plays back a list of fixes, one per `interval`.
pub struct ReplaySource {
    fixes: VecDeque<PositionFix>,
    /// Real time between fixes, independent of their timestamps.
    interval: Duration,
    started: bool,
}

impl ReplaySource {
    pub fn new(fixes: impl IntoIterator<Item = PositionFix>, interval: Duration) -> Self {
        Self {
            fixes: fixes.into_iter().collect(),
            interval,
            started: false,
        }
    }

    /// Fixes along the route at a constant speed, one every `interval`,
    /// ending exactly at the last coordinate.
    pub fn along_route(
        route: &Route,
        speed_mps: f64,
        start: Timestamp,
        interval: Duration,
    ) -> Self {
        let Some(&first) = route.coordinates.first() else {
            return Self::new(Vec::new(), interval);
        };

        let step_m = (speed_mps * interval.as_secs_f64()).max(1.);
        let mut fixes = Vec::new();
        let mut timestamp = start;
        let mut push = |location| {
            fixes.push(PositionFix::new(location, 8., timestamp));
            timestamp = timestamp + interval;
        };
        push(first);

        // distance left over from the previous segment
        let mut carried = 0.;
        for w in route.coordinates.windows(2) {
            let length = w[0].distance_to(w[1]);
            let heading = math::calculate_heading(w[0], w[1]);
            let mut along = step_m - carried;
            while along < length {
                push(math::point_at_distance(w[0], heading, along));
                along += step_m;
            }
            carried = length - (along - step_m);
        }
        if let Some(&last) = route.coordinates.last()
            && route.coordinates.len() > 1
        {
            push(last);
        }

        Self::new(fixes, interval)
    }

    /// Plays the fixes back faster (or slower) than their timestamps say.
    pub fn playback(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn len(&self) -> usize {
        self.fixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fixes.is_empty()
    }
}

impl PositionSource for ReplaySource {
    async fn next_fix(&mut self) -> Option<PositionFix> {
        if self.started {
            tokio::time::sleep(self.interval).await;
        }
        self.started = true;
        self.fixes.pop_front()
    }
}

pub struct Navigator<P> {
    config: Config,
    geo: GeoIndex,
    store: Mutex<RouteStore>,
    tracker: Mutex<ProgressTracker>,
    cache: RouteCache,
    trail: Mutex<PositionTrail>,
    coordinator: RoutingCoordinator,
    provider: P,
    clock: Arc<dyn Clock>,
    /// Bumped whenever tracking starts or stops, so fixes meant for an older
    /// session are ignored.
    session: AtomicU64,
    last_accepted: Mutex<Option<Timestamp>>,
}

impl<P: RoutingProvider> Navigator<P> {
    pub fn new(config: Config, provider: P, kv: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Self {
        let coordinator = RoutingCoordinator::new(
            RouteOptions {
                alternatives: config.alternatives,
                profile: config.osrm_profile.clone(),
            },
            config.provider_timeout,
            config.cache_ttl,
        );

        Self {
            geo: GeoIndex::new(),
            store: Mutex::new(RouteStore::new(config.sample_stride)),
            tracker: Mutex::new(ProgressTracker::new(config.tracker)),
            cache: RouteCache::new(kv.clone(), clock.clone()),
            trail: Mutex::new(PositionTrail::open(kv)),
            coordinator,
            provider,
            clock,
            session: AtomicU64::new(0),
            last_accepted: Mutex::new(None),
            config,
        }
    }

    pub fn subscribe(&self) -> UnboundedReceiver<TrackerEvent> {
        self.tracker.lock().subscribe()
    }

    /// Replaces every zone. Candidates are checked again against the new
    /// zones.
    pub fn load_zones(&mut self, zones: impl IntoIterator<Item = Zone>) -> Result<(), Error> {
        self.geo.load(zones)?;
        self.store.lock().revalidate(&self.geo);
        self.sync_tracking();
        Ok(())
    }

    pub fn cache(&self) -> &RouteCache {
        &self.cache
    }

    pub async fn compute_route(&self, request: RouteRequest) -> Result<RouteSet, Error> {
        let res = self
            .coordinator
            .compute_route(request, &self.geo, &self.provider, &self.cache, &self.store)
            .await;
        self.sync_tracking();

        if let Ok(set) = &res
            && let Some(route) = set.current()
        {
            info!(
                "Route ready: {:.1}km, {:.0} min",
                route.total_distance_m / 1000.,
                route.total_time_s / 60.
            );
        }
        res
    }

    pub fn switch_alternative(&self) -> Result<Arc<Route>, Error> {
        let route = self.coordinator.switch_alternative(&self.store, &self.geo)?;
        self.sync_tracking();
        Ok(route)
    }

    /// Returns whether the selected route changed because of it.
    pub fn set_blocked(&mut self, zone_id: &str, blocked: bool) -> Result<bool, Error> {
        self.geo.set_blocked(zone_id, blocked)?;
        let changed = self.store.lock().revalidate(&self.geo);
        self.sync_tracking();
        Ok(changed)
    }

    /// Forgets the current candidates, for example because an endpoint
    /// moved. Any request still in flight is discarded.
    pub fn clear_route(&self) {
        self.coordinator.cancel();
        self.store.lock().invalidate();
        self.sync_tracking();
    }

    pub fn current_route(&self) -> Option<Arc<Route>> {
        self.store.lock().current()
    }

    pub fn route_set(&self) -> RouteSet {
        self.store.lock().route_set()
    }

    /// "route 2 of 3"
    pub fn position_among_valid(&self) -> Option<(usize, usize)> {
        self.store.lock().position_among_valid()
    }

    /// Starts following the selected route, returning the new session's id.
    pub fn begin_tracking(&self) -> Result<u64, Error> {
        let route = self.current_route().ok_or(Error::InvalidState {
            expected: "route selected",
            found: "no route",
        })?;
        self.tracker.lock().begin(route)?;
        *self.last_accepted.lock() = None;
        let session = self.session.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("tracking session {session} started");
        Ok(session)
    }

    pub fn stop_tracking(&self) {
        self.session.fetch_add(1, Ordering::SeqCst);
        self.tracker.lock().stop();
    }

    /// Feeds one fix to the tracker. Returns `None` if the fix was dropped,
    /// either because it belongs to an older session or because it came
    /// too soon after the previous one.
    pub fn handle_fix(
        &self,
        session: u64,
        fix: PositionFix,
    ) -> Result<Option<ProgressSnapshot>, Error> {
        if session != self.session.load(Ordering::SeqCst) {
            trace!("dropping fix for stale session {session}");
            return Ok(None);
        }

        {
            let mut last_accepted = self.last_accepted.lock();
            if let Some(last) = *last_accepted
                && fix.timestamp.duration_since(last) < self.config.position_interval
            {
                trace!("throttling fix at {}", fix.timestamp);
                return Ok(None);
            }
            *last_accepted = Some(fix.timestamp);
        }

        self.trail.lock().record(fix);
        self.tracker
            .lock()
            .update(fix.location, fix.timestamp)
            .map(Some)
    }

    /// Consumes fixes from `source` until it runs out, or until the session
    /// is stopped or completes.
    pub async fn follow<S: PositionSource>(
        &self,
        session: u64,
        source: &mut S,
    ) -> Result<ProgressSnapshot, Error> {
        while let Some(fix) = source.next_fix().await {
            if session != self.session.load(Ordering::SeqCst) {
                debug!("session {session} ended while following");
                break;
            }
            self.handle_fix(session, fix)?;
            if self.tracker_state() != TrackerState::Tracking {
                break;
            }
        }
        Ok(self.tick())
    }

    /// The current progress, for a periodic UI refresh.
    pub fn tick(&self) -> ProgressSnapshot {
        self.tracker.lock().snapshot()
    }

    pub fn tracker_state(&self) -> TrackerState {
        self.tracker.lock().state()
    }

    pub fn breadcrumbs(&self) -> Vec<Location> {
        self.tracker.lock().breadcrumbs()
    }

    /// The most recent fix we know of, even from a previous run.
    pub fn last_known_position(&self) -> Option<PositionFix> {
        self.trail.lock().last_known()
    }

    /// Forgets every cached route and the position trail. Returns how many
    /// routes were removed.
    pub fn clear_offline_data(&self) -> eyre::Result<usize> {
        let removed = self.cache.clear()?;
        self.trail.lock().clear();
        info!("Cleared the position trail");
        Ok(removed)
    }

    /// Drops expired cache entries. Returns how many were removed.
    pub fn sweep_cache(&self) -> usize {
        self.cache.sweep_expired(self.clock.now())
    }

    /// A tracking session only makes sense for the route that's selected
    /// right now.
    fn sync_tracking(&self) {
        let current = self.store.lock().current();
        let mut tracker = self.tracker.lock();
        let Some(tracked) = tracker.route() else {
            return;
        };
        let still_selected = current.is_some_and(|c| Arc::ptr_eq(&c, tracked));
        if !still_selected {
            info!("Selected route changed, stopping tracking");
            tracker.stop();
            self.session.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        coordinator::tests::{Answer, MockProvider, straight_route},
        db::MemoryStore,
        geo_index::tests::square,
        tracker::tests::drain,
    };

    const START: Timestamp = Timestamp(1_700_000_000_000);

    fn origin() -> Location {
        Location::new(0.005, 0.)
    }
    fn destination() -> Location {
        Location::new(0.005, 0.05)
    }

    fn navigator(provider: MockProvider) -> Navigator<MockProvider> {
        navigator_with_store(provider, Arc::new(MemoryStore::new()))
    }

    fn navigator_with_store(
        provider: MockProvider,
        kv: Arc<dyn KvStore>,
    ) -> Navigator<MockProvider> {
        let config = Config {
            sample_stride: 1,
            ..Config::default()
        };
        let mut navigator = Navigator::new(config, provider, kv, Arc::new(ManualClock::new(START)));
        navigator
            .load_zones([
                square("north", 0.02, 0.02, 0.01),
                square("middle", 0., 0.02, 0.01),
            ])
            .unwrap();
        navigator
    }

    /// Goes around "middle" through "north".
    fn detour() -> Route {
        straight_route(&[origin(), Location::new(0.025, 0.025), destination()])
    }

    #[tokio::test]
    async fn test_blocking_a_zone_moves_the_selection() {
        let direct = straight_route(&[origin(), destination()]);
        let mut nav = navigator(MockProvider::answering(Answer::Routes(vec![
            direct.clone(),
            detour(),
        ])));

        let set = nav
            .compute_route(RouteRequest::new(origin(), destination()))
            .await
            .unwrap();
        assert_eq!(set.selected, Some(0));
        assert_eq!(nav.position_among_valid(), Some((1, 2)));

        assert!(nav.set_blocked("middle", true).unwrap());
        assert_eq!(*nav.current_route().unwrap(), detour());
        assert_eq!(nav.switch_alternative(), Err(Error::NoAlternative));

        assert!(nav.set_blocked("north", true).unwrap());
        assert!(nav.current_route().is_none());

        assert_eq!(
            nav.set_blocked("nowhere", true),
            Err(Error::ZoneNotFound("nowhere".into()))
        );
    }

    #[tokio::test]
    async fn test_tracking_session() {
        let nav = navigator(MockProvider::straight());
        let mut events = nav.subscribe();

        assert!(matches!(
            nav.begin_tracking(),
            Err(Error::InvalidState { .. })
        ));

        nav.compute_route(RouteRequest::new(origin(), destination()))
            .await
            .unwrap();
        let session = nav.begin_tracking().unwrap();
        assert_eq!(nav.tracker_state(), TrackerState::Tracking);

        let route = nav.current_route().unwrap();
        let midpoint = route.coordinates[route.coordinates.len() / 2];
        let snapshot = nav
            .handle_fix(session, PositionFix::new(midpoint, 5., START))
            .unwrap()
            .unwrap();
        assert!((snapshot.percent - 50.).abs() < 1.);

        // less than a second later
        let early = PositionFix::new(destination(), 5., START + Duration::from_millis(400));
        assert_eq!(nav.handle_fix(session, early), Ok(None));

        let done = PositionFix::new(destination(), 5., START + Duration::from_secs(1));
        nav.handle_fix(session, done).unwrap().unwrap();
        assert_eq!(nav.tracker_state(), TrackerState::Completed);
        assert!(
            drain(&mut events)
                .iter()
                .any(|e| matches!(e, TrackerEvent::RouteCompleted { .. }))
        );

        nav.stop_tracking();
        assert_eq!(nav.tracker_state(), TrackerState::Idle);
        let stale = PositionFix::new(origin(), 5., START + Duration::from_secs(2));
        assert_eq!(nav.handle_fix(session, stale), Ok(None));
        assert_eq!(nav.last_known_position(), Some(done));
    }

    #[tokio::test]
    async fn test_route_change_stops_tracking() {
        let nav = navigator(MockProvider::answering(Answer::Routes(vec![
            straight_route(&[origin(), destination()]),
            detour(),
        ])));
        nav.compute_route(RouteRequest::new(origin(), destination()))
            .await
            .unwrap();
        let session = nav.begin_tracking().unwrap();

        nav.switch_alternative().unwrap();
        assert_eq!(nav.tracker_state(), TrackerState::Idle);
        let fix = PositionFix::new(origin(), 5., START);
        assert_eq!(nav.handle_fix(session, fix), Ok(None));

        let session = nav.begin_tracking().unwrap();
        nav.clear_route();
        assert_eq!(nav.tracker_state(), TrackerState::Idle);
        assert_eq!(nav.handle_fix(session, fix), Ok(None));
    }

    #[tokio::test(start_paused = true)]
    async fn test_follow_replayed_route() {
        let nav = navigator(MockProvider::straight());
        nav.compute_route(RouteRequest::new(origin(), destination()))
            .await
            .unwrap();
        let route = nav.current_route().unwrap();
        let session = nav.begin_tracking().unwrap();

        let mut source = ReplaySource::along_route(&route, 50., START, Duration::from_secs(1));
        // about 5.5km at 50m/s
        assert!(source.len() > 100);

        let snapshot = nav.follow(session, &mut source).await.unwrap();
        assert_eq!(nav.tracker_state(), TrackerState::Completed);
        assert!(snapshot.percent > 99.);
        assert_eq!(nav.breadcrumbs().len(), crate::config::BREADCRUMB_CAPACITY);
    }

    #[tokio::test]
    async fn test_trail_survives_a_new_navigator() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let nav = navigator_with_store(MockProvider::straight(), kv.clone());
        nav.compute_route(RouteRequest::new(origin(), destination()))
            .await
            .unwrap();
        let session = nav.begin_tracking().unwrap();
        let fix = PositionFix::new(origin(), 5., START);
        nav.handle_fix(session, fix).unwrap();
        drop(nav);

        let nav = navigator_with_store(MockProvider::straight(), kv);
        assert_eq!(nav.last_known_position(), Some(fix));
        // and the route came back from the cache
        nav.compute_route(RouteRequest::new(origin(), destination()))
            .await
            .unwrap();
        assert_eq!(nav.provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_clear_offline_data() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let nav = navigator_with_store(MockProvider::straight(), kv.clone());
        nav.compute_route(RouteRequest::new(origin(), destination()))
            .await
            .unwrap();
        let session = nav.begin_tracking().unwrap();
        nav.handle_fix(session, PositionFix::new(origin(), 5., START))
            .unwrap();

        assert_eq!(nav.clear_offline_data().unwrap(), 1);
        assert_eq!(nav.last_known_position(), None);
        assert!(kv.keys("").unwrap().is_empty());
    }

    #[test]
    fn test_replay_source_spacing() {
        let route = straight_route(&[origin(), destination()]);
        let source = ReplaySource::along_route(&route, 100., START, Duration::from_secs(1));
        let fixes = source.fixes.iter().collect::<Vec<_>>();

        assert_eq!(fixes[0].location, origin());
        assert_eq!(fixes.last().unwrap().location, destination());
        for w in fixes.windows(2).take(fixes.len() - 2) {
            assert!((w[0].location.distance_to(w[1].location) - 100.).abs() < 0.5);
            assert_eq!(w[1].timestamp.duration_since(w[0].timestamp), Duration::from_secs(1));
        }
    }
}
