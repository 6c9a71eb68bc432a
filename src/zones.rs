use crate::model::{Location, Zone};

/// Where the sample haciendas are, for centering a map on them.
pub const SAMPLE_CENTER: Location = Location::new(3.62, -76.30);

/// A few small haciendas near Palmira, Colombia. Useful for trying things out
/// without a real dataset.
pub fn sample_haciendas() -> Vec<Zone> {
    vec![
        rect("Hacienda Providencia", 3.62, -76.31),
        rect("Hacienda San José", 3.60, -76.28),
        rect("Hacienda La Esperanza", 3.65, -76.25),
    ]
}

/// A 0.01° square with its south-west corner at `lat`, `lng`.
fn rect(name: &str, lat: f64, lng: f64) -> Zone {
    const SIZE: f64 = 0.01;
    Zone::new(
        name,
        vec![
            Location::new(lat, lng),
            Location::new(lat, lng + SIZE),
            Location::new(lat + SIZE, lng + SIZE),
            Location::new(lat + SIZE, lng),
            Location::new(lat, lng),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_index::GeoIndex;

    #[test]
    fn test_sample_haciendas_load() {
        let mut index = GeoIndex::new();
        index.load(sample_haciendas()).unwrap();
        index.set_blocked("Hacienda San José", true).unwrap();

        assert_eq!(
            index.is_point_blocked(Location::new(3.605, -76.275)),
            Some("Hacienda San José".into())
        );
        assert_eq!(index.is_point_blocked(Location::new(3.625, -76.305)), None);

        let nearest = index.nearest_zones(SAMPLE_CENTER, 5_000., 1);
        assert_eq!(nearest[0].0.id, "Hacienda Providencia");
    }
}
