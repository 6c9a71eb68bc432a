//! Named polygonal zones ("haciendas") that can be blocked for routing.

use std::hash::BuildHasherDefault;

use geo::{BoundingRect, Contains, LineString, Polygon, Rect};
use indexmap::IndexMap;
use rustc_hash::FxHasher;
use tracing::{debug, info};

use crate::{
    error::Error,
    math,
    model::{Location, Route, Zone, ZoneId},
};

pub type FxIndexMap<K, V> = IndexMap<K, V, BuildHasherDefault<FxHasher>>;

struct IndexedZone {
    zone: Zone,
    polygon: Polygon<f64>,
    bounds: Option<Rect<f64>>,
}
impl IndexedZone {
    fn new(zone: Zone) -> Self {
        let ring = zone
            .polygon
            .iter()
            .map(|l| l.to_geo())
            .collect::<Vec<_>>();
        let polygon = Polygon::new(LineString::from(ring), vec![]);
        let bounds = polygon.bounding_rect();
        Self {
            zone,
            polygon,
            bounds,
        }
    }

    /// Strict containment, points on the boundary don't count.
    fn contains(&self, p: Location) -> bool {
        let Some(bounds) = self.bounds else {
            return false;
        };
        let c = p.to_geo();
        // cheap check before doing the real point-in-polygon
        if c.x < bounds.min().x || c.x > bounds.max().x || c.y < bounds.min().y || c.y > bounds.max().y
        {
            return false;
        }
        self.polygon.contains(&geo::Point::from(c))
    }

    /// Zero if `p` is inside, otherwise the distance to the closest edge.
    fn distance_to(&self, p: Location) -> f64 {
        if self.contains(p) {
            return 0.;
        }
        let ring = &self.zone.polygon;
        match ring.len() {
            0 => f64::INFINITY,
            1 => p.distance_to(ring[0]),
            n => (0..n)
                .map(|i| math::distance_to_segment(p, ring[i], ring[(i + 1) % n]))
                .fold(f64::INFINITY, f64::min),
        }
    }
}

/// In-memory collection of zones, kept in insertion order. Ties between
/// overlapping zones are always broken by that order.
#[derive(Default)]
pub struct GeoIndex {
    zones: FxIndexMap<ZoneId, IndexedZone>,
}

impl GeoIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the contents of the index. If any id is repeated, nothing is
    /// changed.
    pub fn load(&mut self, zones: impl IntoIterator<Item = Zone>) -> Result<(), Error> {
        let mut new_zones = FxIndexMap::default();
        for zone in zones {
            if new_zones.contains_key(&zone.id) {
                return Err(Error::DuplicateZoneId(zone.id));
            }
            new_zones.insert(zone.id.clone(), IndexedZone::new(zone));
        }

        info!(
            "Loaded {} zones ({} blocked)",
            new_zones.len(),
            new_zones.values().filter(|z| z.zone.blocked).count()
        );
        self.zones = new_zones;
        Ok(())
    }

    pub fn set_blocked(&mut self, id: &str, blocked: bool) -> Result<(), Error> {
        let zone = self
            .zones
            .get_mut(id)
            .ok_or_else(|| Error::ZoneNotFound(id.into()))?;
        if zone.zone.blocked != blocked {
            debug!("zone {id} blocked={blocked}");
        }
        zone.zone.blocked = blocked;
        Ok(())
    }

    pub fn is_point_blocked(&self, p: Location) -> Option<ZoneId> {
        self.blocked_zones()
            .find(|z| z.contains(p))
            .map(|z| z.zone.id.clone())
    }

    /// Checks every `sample_stride`th coordinate of the route against the
    /// blocked zones.
    ///
    /// A route can cut through a zone narrower than the gap between two
    /// samples without being caught. Callers pick the stride based on how big
    /// their zones are.
    pub fn route_crosses_blocked(&self, route: &Route, sample_stride: usize) -> Option<ZoneId> {
        let blocked = self.blocked_zones().collect::<Vec<_>>();
        if blocked.is_empty() {
            return None;
        }

        for point in route.coordinates.iter().step_by(sample_stride.max(1)) {
            if let Some(zone) = blocked.iter().find(|z| z.contains(*point)) {
                return Some(zone.zone.id.clone());
            }
        }
        None
    }

    /// Zones within `radius_m` of `p`, closest first.
    pub fn nearest_zones(&self, p: Location, radius_m: f64, limit: usize) -> Vec<(&Zone, f64)> {
        let mut found = self
            .zones
            .values()
            .filter_map(|z| {
                let dist = z.distance_to(p);
                (dist <= radius_m).then_some((&z.zone, dist))
            })
            .collect::<Vec<_>>();

        // stable, so equal distances keep insertion order
        found.sort_by(|a, b| a.1.total_cmp(&b.1));
        found.truncate(limit);
        found
    }

    pub fn zone(&self, id: &str) -> Option<&Zone> {
        self.zones.get(id).map(|z| &z.zone)
    }

    pub fn blocked_ids(&self) -> Vec<ZoneId> {
        self.blocked_zones().map(|z| z.zone.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    fn blocked_zones(&self) -> impl Iterator<Item = &IndexedZone> {
        self.zones.values().filter(|z| z.zone.blocked)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub fn square(id: &str, lat: f64, lng: f64, size: f64) -> Zone {
        Zone::new(
            id,
            vec![
                Location::new(lat, lng),
                Location::new(lat, lng + size),
                Location::new(lat + size, lng + size),
                Location::new(lat + size, lng),
                Location::new(lat, lng),
            ],
        )
    }

    fn straight_route(points: &[(f64, f64)]) -> Route {
        Route {
            coordinates: points.iter().map(|&(lat, lng)| Location::new(lat, lng)).collect(),
            total_distance_m: 0.,
            total_time_s: 0.,
            steps: vec![],
        }
    }

    #[test]
    fn test_duplicate_load_keeps_previous_contents() {
        let mut index = GeoIndex::new();
        index
            .load([square("A", 0., 0., 1.), square("B", 2., 2., 1.)])
            .unwrap();

        let res = index.load([square("C", 0., 0., 1.), square("C", 5., 5., 1.)]);
        assert_eq!(res, Err(Error::DuplicateZoneId("C".into())));
        assert_eq!(index.len(), 2);
        assert!(index.zone("A").is_some());
        assert!(index.zone("C").is_none());
    }

    #[test]
    fn test_set_blocked() {
        let mut index = GeoIndex::new();
        index.load([square("A", 0., 0., 1.)]).unwrap();

        index.set_blocked("A", true).unwrap();
        index.set_blocked("A", true).unwrap();
        assert_eq!(index.blocked_ids(), vec![ZoneId::from("A")]);

        assert_eq!(
            index.set_blocked("nope", true),
            Err(Error::ZoneNotFound("nope".into()))
        );
    }

    #[test]
    fn test_point_blocked_only_inside_blocked_zones() {
        let mut index = GeoIndex::new();
        index
            .load([square("A", 0., 0., 1.).blocked(), square("B", 2., 2., 1.)])
            .unwrap();

        assert_eq!(
            index.is_point_blocked(Location::new(0.5, 0.5)),
            Some("A".into())
        );
        // inside B, but B isn't blocked
        assert_eq!(index.is_point_blocked(Location::new(2.5, 2.5)), None);
        assert_eq!(index.is_point_blocked(Location::new(1.5, 1.5)), None);
        assert_eq!(index.is_point_blocked(Location::new(-0.5, 0.5)), None);
    }

    #[test]
    fn test_point_in_concave_polygon() {
        // an L shape, where the bounding box would give a false positive
        let l_shape = Zone::new(
            "L",
            vec![
                Location::new(0., 0.),
                Location::new(0., 2.),
                Location::new(1., 2.),
                Location::new(1., 1.),
                Location::new(2., 1.),
                Location::new(2., 0.),
            ],
        )
        .blocked();
        let mut index = GeoIndex::new();
        index.load([l_shape]).unwrap();

        assert!(index.is_point_blocked(Location::new(0.5, 1.5)).is_some());
        assert!(index.is_point_blocked(Location::new(1.5, 0.5)).is_some());
        assert!(index.is_point_blocked(Location::new(1.5, 1.5)).is_none());
    }

    #[test]
    fn test_overlapping_zones_use_insertion_order() {
        let mut index = GeoIndex::new();
        index
            .load([
                square("second", 0., 0., 2.).blocked(),
                square("first", 0., 0., 1.).blocked(),
            ])
            .unwrap();
        assert_eq!(
            index.is_point_blocked(Location::new(0.5, 0.5)),
            Some("second".into())
        );
    }

    #[test]
    fn test_route_crossing_uses_sampling() {
        let mut index = GeoIndex::new();
        index.load([square("A", 0., 0.45, 0.1).blocked()]).unwrap();

        // 11 points from lng 0 to 1, only index 5 (lng 0.5) is inside A
        let points = (0..=10).map(|i| (0.05, i as f64 / 10.)).collect::<Vec<_>>();
        let route = straight_route(&points);

        assert_eq!(index.route_crosses_blocked(&route, 1), Some("A".into()));
        assert_eq!(index.route_crosses_blocked(&route, 5), Some("A".into()));
        // samples 0, 3, 6, 9 all miss the zone
        assert_eq!(index.route_crosses_blocked(&route, 3), None);
        // zero is treated as one
        assert_eq!(index.route_crosses_blocked(&route, 0), Some("A".into()));

        index.set_blocked("A", false).unwrap();
        assert_eq!(index.route_crosses_blocked(&route, 1), None);
    }

    #[test]
    fn test_nearest_zones() {
        let mut index = GeoIndex::new();
        index
            .load([
                square("far", 0., 0.1, 0.01),
                square("inside", 0., 0., 0.01),
                square("near", 0., 0.02, 0.01),
            ])
            .unwrap();

        let p = Location::new(0.005, 0.005);
        let found = index.nearest_zones(p, 5_000., 10);
        let ids = found.iter().map(|(z, _)| z.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, ["inside", "near"]);
        assert_eq!(found[0].1, 0.);
        // 0.015 degrees of longitude at the equator
        assert!((found[1].1 - 0.015 * math::LAT_M_PER_DEGREE).abs() < 1.);

        let found = index.nearest_zones(p, 50_000., 1);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0.id, "inside");
    }
}
