use std::f64::consts::PI;

use crate::model::Location;

#[inline]
pub fn calculate_heading(origin: Location, dest: Location) -> f64 {
    // based on `geo::Haversine.bearing(start, end)`

    let (a_lng, a_lat) = (origin.lng_rad(), origin.lat_rad());
    let (b_lng, b_lat) = (dest.lng_rad(), dest.lat_rad());
    let delta_lng = b_lng - a_lng;

    let (a_lat_sin, a_lat_cos) = a_lat.sin_cos();
    let (b_lat_sin, b_lat_cos) = b_lat.sin_cos();
    let (delta_lng_sin, delta_lng_cos) = delta_lng.sin_cos();

    let s = delta_lng_sin * b_lat_cos;
    let c = a_lat_cos * b_lat_sin - a_lat_sin * b_lat_cos * delta_lng_cos;

    (s.atan2(c).to_degrees() + 360.) % 360.
}

/// Eight-way compass name for a heading in degrees.
pub fn compass_direction(heading: f64) -> &'static str {
    const NAMES: [&str; 8] = [
        "north",
        "northeast",
        "east",
        "southeast",
        "south",
        "southwest",
        "west",
        "northwest",
    ];
    let index = ((heading.rem_euclid(360.) + 22.5) / 45.) as usize % 8;
    NAMES[index]
}

/// In meters, copied from Google Maps's code.
pub const EARTH_RADIUS: f64 = 6_378_137.;

/// Latitude lines are always spaced evenly apart, so this doesn't need to be an
/// approximation.
pub const LAT_M_PER_DEGREE: f64 = EARTH_RADIUS * (PI / 180.);

#[inline]
pub fn calculate_lng_m_per_degree(lat: f64) -> f64 {
    LAT_M_PER_DEGREE * lat.to_radians().cos()
}

#[inline]
pub fn approx_distance_sqr(a: Location, b: Location, approx_lng_m_per_degree: f64) -> f64 {
    let lat_diff = a.lat - b.lat;
    let lng_diff = a.lng - b.lng;

    (lat_diff * LAT_M_PER_DEGREE).powi(2) + (lng_diff * approx_lng_m_per_degree).powi(2)
}

#[inline]
pub fn distance(a: Location, b: Location) -> f64 {
    // based on geo::Haversine.distance(a, b)

    let theta1 = a.lat_rad();
    let theta2 = b.lat_rad();
    let delta_theta = theta2 - theta1;
    let delta_lambda = b.lng_rad() - a.lng_rad();

    let a = (delta_theta / 2.).sin().powi(2)
        + theta1.cos() * theta2.cos() * (delta_lambda / 2.).sin().powi(2);
    let c = 2. * a.sqrt().asin();
    EARTH_RADIUS * c
}

/// Approximate distance from `p` to the segment `a`-`b`, projecting onto a
/// local plane around `p`. Only accurate for segments that are a few
/// kilometers long at most, which is fine for zone edges.
pub fn distance_to_segment(p: Location, a: Location, b: Location) -> f64 {
    let lng_m_per_degree = p.calculate_lng_m_per_degree();
    let to_xy = |l: Location| {
        (
            (l.lng - p.lng) * lng_m_per_degree,
            (l.lat - p.lat) * LAT_M_PER_DEGREE,
        )
    };

    let (ax, ay) = to_xy(a);
    let (bx, by) = to_xy(b);
    let (dx, dy) = (bx - ax, by - ay);
    let len_sqr = dx * dx + dy * dy;

    let t = if len_sqr == 0. {
        0.
    } else {
        (-(ax * dx + ay * dy) / len_sqr).clamp(0., 1.)
    };
    let (cx, cy) = (ax + t * dx, ay + t * dy);

    (cx * cx + cy * cy).sqrt()
}

pub fn point_at_distance(pos: Location, direction: f64, distance: f64) -> Location {
    point_at_distance_radians(pos, direction.to_radians(), distance)
}

pub fn point_at_distance_radians(pos: Location, direction_radians: f64, distance: f64) -> Location {
    let lat = pos.lat_rad();
    let lng = pos.lng_rad();

    let d = distance / EARTH_RADIUS;
    let cos_d = d.cos();
    let sin_d = d.sin();
    let cos_lat = lat.cos();
    let sin_lat = lat.sin();
    let sin_d_cos_lat = sin_d * cos_lat;
    let return_lat = (cos_d * sin_lat + sin_d_cos_lat * direction_radians.cos()).asin();
    let return_lng = lng
        + f64::atan2(
            direction_radians.sin() * sin_d_cos_lat,
            cos_d - sin_lat * return_lat.sin(),
        );

    Location::new(return_lat.to_degrees(), return_lng.to_degrees())
}

#[cfg(test)]
mod tests {
    use geo::Distance as _;

    use super::*;

    #[test]
    fn test_distance_matches_geo() {
        let a = Location::new(3.62, -76.30);
        let b = Location::new(3.65, -76.25);

        let ours = distance(a, b);
        let theirs = geo::Haversine.distance(geo::Point::new(a.lng, a.lat), geo::Point::new(b.lng, b.lat));

        // geo uses the mean earth radius instead of the equatorial one
        assert!((ours - theirs).abs() / theirs < 0.002, "{ours} vs {theirs}");
    }

    #[test]
    fn test_approx_distance_is_close_for_short_distances() {
        for lat in -60..60 {
            let a = Location::new(lat as f64, -76.);
            let b = Location::new(lat as f64 + 0.001, -76.001);
            let approx = approx_distance_sqr(a, b, a.calculate_lng_m_per_degree()).sqrt();
            let actual = distance(a, b);
            assert!((approx - actual).abs() < 0.5, "{approx} vs {actual}");
        }
    }

    #[test]
    fn test_point_at_distance_round_trips_distance() {
        let origin = Location::new(3.62, -76.30);
        for heading in [0., 45., 90., 180., 270.] {
            let moved = point_at_distance(origin, heading, 250.);
            assert!((distance(origin, moved) - 250.).abs() < 0.01);

            let diff = (calculate_heading(origin, moved) - heading).rem_euclid(360.);
            assert!(diff < 0.01 || diff > 359.99, "{heading}: {diff}");
        }
    }

    #[test]
    fn test_distance_to_segment() {
        let a = Location::new(0., 0.);
        let b = Location::new(0., 0.01);
        // 100m north of the middle of the segment
        let p = point_at_distance(Location::new(0., 0.005), 0., 100.);
        assert!((distance_to_segment(p, a, b) - 100.).abs() < 0.1);

        // past the end, so the closest point is b
        let p = Location::new(0., 0.02);
        assert!((distance_to_segment(p, a, b) - distance(p, b)).abs() < 0.5);
    }

    #[test]
    fn test_compass_direction() {
        assert_eq!(compass_direction(0.), "north");
        assert_eq!(compass_direction(359.), "north");
        assert_eq!(compass_direction(90.), "east");
        assert_eq!(compass_direction(200.), "south");
        assert_eq!(compass_direction(310.), "northwest");
    }
}
