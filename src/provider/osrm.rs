//! OSRM HTTP routing.

use std::{fmt, time::Duration};

use serde::{Deserialize, Deserializer, de};
use tracing::{debug, trace, warn};

use crate::{
    error::ProviderError,
    math::compass_direction,
    model::{Instruction, Location, ManeuverType, Route},
    provider::{RouteOptions, RoutingProvider},
};

pub struct OsrmClient {
    base_url: String,
    client: reqwest::Client,
}

impl OsrmClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::ClientBuilder::new()
            .user_agent(concat!("hacienda-router/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn route_url(&self, waypoints: &[Location], options: &RouteOptions) -> String {
        // osrm wants lng,lat
        let coords = waypoints
            .iter()
            .map(|l| format!("{:.6},{:.6}", l.lng, l.lat))
            .collect::<Vec<_>>()
            .join(";");

        format!(
            "{}/route/v1/{}/{coords}?alternatives={}&steps=true&geometries=geojson&overview=full",
            self.base_url, options.profile, options.alternatives
        )
    }
}

impl RoutingProvider for OsrmClient {
    async fn route(
        &self,
        waypoints: &[Location],
        options: &RouteOptions,
    ) -> Result<Vec<Route>, ProviderError> {
        if waypoints.len() < 2 {
            return Err(ProviderError::Unavailable(
                "at least two waypoints are needed".to_string(),
            ));
        }

        let url = self.route_url(waypoints, options);
        debug!("Requesting {url}");

        let res = self.client.get(&url).send().await?;
        let status = res.status();
        let mut body = res.bytes().await?.to_vec();
        trace!("osrm responded with {status}, {} bytes", body.len());

        // osrm uses 400 for NoRoute, so the body is checked before the status
        match parse_route_response(&mut body) {
            Ok(routes) => Ok(routes),
            Err(err) if status.is_success() => Err(err),
            Err(err) => {
                warn!("osrm responded with {status}: {err}");
                Err(ProviderError::Unavailable(format!("HTTP {status}")))
            }
        }
    }
}

#[derive(Deserialize)]
struct OsrmRouteResponse {
    code: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    routes: Vec<OsrmRoute>,
}

#[derive(Deserialize)]
struct OsrmRoute {
    #[serde(deserialize_with = "number")]
    distance: f64,
    #[serde(deserialize_with = "number")]
    duration: f64,
    geometry: OsrmGeometry,
    #[serde(default)]
    legs: Vec<OsrmLeg>,
}

#[derive(Deserialize)]
struct OsrmGeometry {
    coordinates: Vec<[f64; 2]>,
}

#[derive(Deserialize)]
struct OsrmLeg {
    #[serde(default)]
    steps: Vec<OsrmStep>,
}

#[derive(Deserialize)]
struct OsrmStep {
    #[serde(deserialize_with = "number")]
    distance: f64,
    #[serde(default)]
    name: String,
    maneuver: OsrmManeuver,
}

#[derive(Deserialize)]
struct OsrmManeuver {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    modifier: Option<String>,
    #[serde(default, deserialize_with = "number")]
    bearing_after: f64,
    #[serde(default)]
    exit: Option<u32>,
}

/// OSRM writes whole numbers without a decimal point, so accept any number
/// for fields we treat as floats.
fn number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    struct NumberVisitor;
    impl de::Visitor<'_> for NumberVisitor {
        type Value = f64;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a number")
        }
        fn visit_f64<E: de::Error>(self, v: f64) -> Result<f64, E> {
            Ok(v)
        }
        fn visit_i64<E: de::Error>(self, v: i64) -> Result<f64, E> {
            Ok(v as f64)
        }
        fn visit_u64<E: de::Error>(self, v: u64) -> Result<f64, E> {
            Ok(v as f64)
        }
    }
    deserializer.deserialize_any(NumberVisitor)
}

fn parse_route_response(body: &mut [u8]) -> Result<Vec<Route>, ProviderError> {
    let res = simd_json::from_slice::<OsrmRouteResponse>(body)
        .map_err(|e| ProviderError::Unavailable(format!("invalid osrm response: {e}")))?;

    match res.code.as_str() {
        "Ok" => {}
        // these mean there's no road between the points, not that the
        // service is broken
        "NoRoute" | "NoSegment" => {
            debug!("osrm found no route ({})", res.code);
            return Ok(Vec::new());
        }
        code => {
            return Err(ProviderError::Unavailable(format!(
                "{code}: {}",
                res.message.unwrap_or_default()
            )));
        }
    }

    let routes = res
        .routes
        .into_iter()
        .filter(|r| r.geometry.coordinates.len() >= 2)
        .map(convert_route)
        .collect::<Vec<_>>();
    debug!("osrm returned {} routes", routes.len());
    Ok(routes)
}

fn convert_route(route: OsrmRoute) -> Route {
    let leg_count = route.legs.len();
    let mut steps = Vec::new();
    for (leg_index, leg) in route.legs.into_iter().enumerate() {
        let is_last_leg = leg_index + 1 == leg_count;
        for step in leg.steps {
            let maneuver = ManeuverType::from_osrm(&step.maneuver.kind);
            steps.push(Instruction {
                text: instruction_text(&step, maneuver, is_last_leg),
                distance_m: step.distance,
                maneuver,
            });
        }
    }

    Route {
        coordinates: route
            .geometry
            .coordinates
            .into_iter()
            .map(|[lng, lat]| Location::new(lat, lng))
            .collect(),
        total_distance_m: route.distance,
        total_time_s: route.duration,
        steps,
    }
}

fn instruction_text(step: &OsrmStep, maneuver: ManeuverType, is_last_leg: bool) -> String {
    let onto = |text: String| {
        if step.name.is_empty() {
            text
        } else {
            format!("{text} onto {}", step.name)
        }
    };
    let direction = step.maneuver.modifier.as_deref().unwrap_or("straight");

    match maneuver {
        ManeuverType::Depart => {
            let heading = compass_direction(step.maneuver.bearing_after);
            if step.name.is_empty() {
                format!("Head {heading}")
            } else {
                format!("Head {heading} on {}", step.name)
            }
        }
        ManeuverType::Arrive if is_last_leg => "Destination reached".to_string(),
        ManeuverType::Arrive => "Waypoint reached".to_string(),
        ManeuverType::Continue | ManeuverType::NewName if step.name.is_empty() => {
            "Continue straight".to_string()
        }
        ManeuverType::Continue | ManeuverType::NewName => format!("Continue on {}", step.name),
        ManeuverType::Roundabout | ManeuverType::Rotary => match step.maneuver.exit {
            Some(exit) => onto(format!("Enter the roundabout and take exit {exit}")),
            None => onto("Enter the roundabout".to_string()),
        },
        ManeuverType::Merge => onto(format!("Merge {direction}")),
        ManeuverType::OnRamp => onto(format!("Take the ramp {direction}")),
        ManeuverType::OffRamp => onto(format!("Take the exit {direction}")),
        ManeuverType::Fork => onto(format!("Keep {direction} at the fork")),
        ManeuverType::EndOfRoad => onto(format!("Turn {direction} at the end of the road")),
        ManeuverType::Turn | ManeuverType::Other => match direction {
            "straight" => onto("Go straight".to_string()),
            "uturn" => onto("Make a U-turn".to_string()),
            // "left", "sharp right", "slight left", ...
            direction => onto(format!("Turn {direction}")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "code": "Ok",
        "waypoints": [],
        "routes": [
            {
                "distance": 1520.4,
                "duration": 180,
                "weight": 180,
                "weight_name": "routability",
                "geometry": {
                    "type": "LineString",
                    "coordinates": [[-76.31, 3.62], [-76.305, 3.625], [-76.30, 3.63]]
                },
                "legs": [
                    {
                        "distance": 1520.4,
                        "duration": 180,
                        "summary": "",
                        "steps": [
                            {
                                "distance": 800.2,
                                "duration": 90,
                                "name": "Carrera 5",
                                "mode": "driving",
                                "maneuver": {
                                    "type": "depart",
                                    "bearing_before": 0,
                                    "bearing_after": 44,
                                    "location": [-76.31, 3.62]
                                }
                            },
                            {
                                "distance": 720.2,
                                "duration": 90,
                                "name": "",
                                "mode": "driving",
                                "maneuver": {
                                    "type": "turn",
                                    "modifier": "slight left",
                                    "bearing_before": 44,
                                    "bearing_after": 20,
                                    "location": [-76.305, 3.625]
                                }
                            },
                            {
                                "distance": 0,
                                "duration": 0,
                                "name": "Carrera 5",
                                "mode": "driving",
                                "maneuver": {
                                    "type": "arrive",
                                    "bearing_before": 20,
                                    "bearing_after": 0,
                                    "location": [-76.30, 3.63]
                                }
                            }
                        ]
                    }
                ]
            },
            {
                "distance": 2000,
                "duration": 240.5,
                "geometry": {
                    "type": "LineString",
                    "coordinates": [[-76.31, 3.62], [-76.30, 3.63]]
                },
                "legs": []
            }
        ]
    }"#;

    #[test]
    fn test_parse_routes() {
        let routes = parse_route_response(&mut SAMPLE.as_bytes().to_vec()).unwrap();
        assert_eq!(routes.len(), 2);

        let route = &routes[0];
        assert_eq!(route.coordinates[0], Location::new(3.62, -76.31));
        assert_eq!(route.coordinates.len(), 3);
        assert_eq!(route.total_distance_m, 1520.4);
        assert_eq!(route.total_time_s, 180.);

        let texts = route.steps.iter().map(|s| s.text.as_str()).collect::<Vec<_>>();
        assert_eq!(
            texts,
            ["Head northeast on Carrera 5", "Turn slight left", "Destination reached"]
        );
        assert_eq!(route.steps[1].maneuver, ManeuverType::Turn);
        assert_eq!(route.steps[1].distance_m, 720.2);

        assert!(routes[1].steps.is_empty());
        assert_eq!(routes[1].total_time_s, 240.5);
    }

    #[test]
    fn test_no_route_is_empty() {
        let mut body = br#"{"code": "NoRoute", "message": "Impossible route between points"}"#.to_vec();
        assert_eq!(parse_route_response(&mut body), Ok(vec![]));
    }

    #[test]
    fn test_error_codes_are_unavailable() {
        let mut body = br#"{"code": "TooBig", "message": "Too many coordinates"}"#.to_vec();
        assert_eq!(
            parse_route_response(&mut body),
            Err(ProviderError::Unavailable(
                "TooBig: Too many coordinates".to_string()
            ))
        );

        let mut garbage = b"<html>bad gateway</html>".to_vec();
        assert!(matches!(
            parse_route_response(&mut garbage),
            Err(ProviderError::Unavailable(_))
        ));
    }

    #[test]
    fn test_route_url() {
        let client = OsrmClient::new("https://osrm.example/", Duration::from_secs(1)).unwrap();
        let url = client.route_url(
            &[Location::new(3.62, -76.31), Location::new(3.65, -76.25)],
            &RouteOptions::default(),
        );
        assert_eq!(
            url,
            "https://osrm.example/route/v1/driving/-76.310000,3.620000;-76.250000,3.650000?alternatives=true&steps=true&geometries=geojson&overview=full"
        );
    }
}
