use std::{
    fmt::{self, Display},
    num::ParseFloatError,
    str::FromStr,
    sync::Arc,
};

use compact_str::CompactString;
use serde::{Deserialize, Serialize};

use crate::{clock::Timestamp, math};

/// Stable name of a zone, unique within a [`crate::geo_index::GeoIndex`].
pub type ZoneId = CompactString;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// y
    pub lat: f64,
    /// x
    pub lng: f64,
}
impl Location {
    #[inline]
    pub const fn new(lat: f64, lng: f64) -> Self {
        Location { lat, lng }
    }

    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.lat) && (-180.0..=180.0).contains(&self.lng)
    }

    #[inline]
    pub fn lat_rad(self) -> f64 {
        self.lat.to_radians()
    }
    #[inline]
    pub fn lng_rad(self) -> f64 {
        self.lng.to_radians()
    }

    #[inline]
    pub fn distance_to(&self, other: Location) -> f64 {
        math::distance(*self, other)
    }

    /// Returns the derivative of the longitude/degree for the current location
    /// (based on the latitude).
    ///
    /// This is used for calculating approximations of short distances.
    #[inline]
    pub fn calculate_lng_m_per_degree(self) -> f64 {
        math::calculate_lng_m_per_degree(self.lat)
    }

    /// `geo` uses x/y ordering, so this is (lng, lat).
    pub fn to_geo(self) -> geo::Coord<f64> {
        geo::coord! { x: self.lng, y: self.lat }
    }
}
impl Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.lat, self.lng)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseLocationError {
    MissingComma,
    Float(ParseFloatError),
    OutOfRange,
}
impl Display for ParseLocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseLocationError::MissingComma => write!(f, "expected `lat,lng`"),
            ParseLocationError::Float(e) => write!(f, "invalid coordinate: {e}"),
            ParseLocationError::OutOfRange => write!(f, "coordinate out of range"),
        }
    }
}
impl std::error::Error for ParseLocationError {}

impl FromStr for Location {
    type Err = ParseLocationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (lat, lng) = s.split_once(',').ok_or(ParseLocationError::MissingComma)?;
        let lat = lat.trim().parse().map_err(ParseLocationError::Float)?;
        let lng = lng.trim().parse().map_err(ParseLocationError::Float)?;
        let loc = Location::new(lat, lng);
        if !loc.is_valid() {
            return Err(ParseLocationError::OutOfRange);
        }
        Ok(loc)
    }
}

/// A named polygon that can be blocked for routing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Zone {
    pub id: ZoneId,
    /// Exterior ring. Closing the ring is optional.
    pub polygon: Vec<Location>,
    pub blocked: bool,
}
impl Zone {
    pub fn new(id: impl Into<ZoneId>, polygon: Vec<Location>) -> Self {
        Self {
            id: id.into(),
            polygon,
            blocked: false,
        }
    }

    pub fn blocked(mut self) -> Self {
        self.blocked = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManeuverType {
    Depart,
    Turn,
    Continue,
    NewName,
    Merge,
    OnRamp,
    OffRamp,
    Fork,
    EndOfRoad,
    Roundabout,
    Rotary,
    Arrive,
    Other,
}
impl ManeuverType {
    pub fn from_osrm(kind: &str) -> Self {
        match kind {
            "depart" => ManeuverType::Depart,
            "turn" => ManeuverType::Turn,
            "continue" => ManeuverType::Continue,
            "new name" => ManeuverType::NewName,
            "merge" => ManeuverType::Merge,
            "on ramp" => ManeuverType::OnRamp,
            "off ramp" => ManeuverType::OffRamp,
            "fork" => ManeuverType::Fork,
            "end of road" => ManeuverType::EndOfRoad,
            "roundabout" | "roundabout turn" | "exit roundabout" => ManeuverType::Roundabout,
            "rotary" | "exit rotary" => ManeuverType::Rotary,
            "arrive" => ManeuverType::Arrive,
            _ => ManeuverType::Other,
        }
    }

    /// Turns and roundabouts are announced with priority.
    pub fn is_priority(self) -> bool {
        matches!(
            self,
            ManeuverType::Turn
                | ManeuverType::Roundabout
                | ManeuverType::Rotary
                | ManeuverType::Fork
                | ManeuverType::EndOfRoad
        )
    }

    pub(crate) fn to_u8(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        use ManeuverType::*;
        const ALL: [ManeuverType; 13] = [
            Depart, Turn, Continue, NewName, Merge, OnRamp, OffRamp, Fork, EndOfRoad, Roundabout,
            Rotary, Arrive, Other,
        ];
        ALL.get(v as usize).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Instruction {
    pub text: String,
    pub distance_m: f64,
    pub maneuver: ManeuverType,
}

/// A computed path between endpoints. Never mutated once built; shared as
/// `Arc<Route>`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Route {
    pub coordinates: Vec<Location>,
    pub total_distance_m: f64,
    pub total_time_s: f64,
    pub steps: Vec<Instruction>,
}
impl Route {
    pub fn into_shared(self) -> Arc<Route> {
        Arc::new(self)
    }

    /// Length of the geometry itself, which may differ slightly from the
    /// provider's reported distance.
    pub fn geometry_length(&self) -> f64 {
        self.coordinates
            .windows(2)
            .map(|w| math::distance(w[0], w[1]))
            .sum()
    }
}

/// Which endpoint of a request something refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    Origin,
    Destination,
}
impl Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Endpoint::Origin => "origin",
            Endpoint::Destination => "destination",
        })
    }
}

/// A single reading from a position source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PositionFix {
    pub location: Location,
    pub accuracy_m: f64,
    pub timestamp: Timestamp,
}
impl PositionFix {
    pub fn new(location: Location, accuracy_m: f64, timestamp: Timestamp) -> Self {
        Self {
            location,
            accuracy_m,
            timestamp,
        }
    }

    /// 5 is excellent, 1 is poor.
    pub fn signal_strength(&self) -> u8 {
        match self.accuracy_m {
            a if a < 10. => 5,
            a if a < 25. => 4,
            a if a < 50. => 3,
            a if a < 100. => 2,
            _ => 1,
        }
    }
}
