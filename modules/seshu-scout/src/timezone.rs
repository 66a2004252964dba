use chrono_tz::Tz;
use tzf_rs::DefaultFinder;

/// Coordinates to IANA timezone name. An empty string means "unknown"; callers
/// carry on with whatever fields they already have.
pub trait TimezoneResolver: Send + Sync {
    fn timezone_for(&self, lat: f64, lon: f64) -> String;
}

/// Offline polygon lookup backed by the bundled tzf dataset.
pub struct TzfResolver {
    finder: DefaultFinder,
}

impl TzfResolver {
    pub fn new() -> Self {
        Self {
            finder: DefaultFinder::new(),
        }
    }
}

impl Default for TzfResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl TimezoneResolver for TzfResolver {
    fn timezone_for(&self, lat: f64, lon: f64) -> String {
        if !coordinates_usable(lat, lon) {
            return String::new();
        }
        let name = self.finder.get_tz_name(lon, lat);
        if name.parse::<Tz>().is_ok() {
            name.to_string()
        } else {
            String::new()
        }
    }
}

/// (0, 0) and out-of-range values are treated as missing.
pub fn coordinates_usable(lat: f64, lon: f64) -> bool {
    lat.is_finite()
        && lon.is_finite()
        && (-90.0..=90.0).contains(&lat)
        && (-180.0..=180.0).contains(&lon)
        && !(lat == 0.0 && lon == 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_cities() {
        let resolver = TzfResolver::new();
        assert_eq!(resolver.timezone_for(44.9537, -93.0900), "America/Chicago");
        assert_eq!(resolver.timezone_for(40.7128, -74.0060), "America/New_York");
        assert_eq!(resolver.timezone_for(51.5074, -0.1278), "Europe/London");
    }

    #[test]
    fn unusable_coordinates_resolve_to_empty() {
        let resolver = TzfResolver::new();
        assert_eq!(resolver.timezone_for(0.0, 0.0), "");
        assert_eq!(resolver.timezone_for(9e10, 9e10), "");
        assert_eq!(resolver.timezone_for(f64::NAN, 10.0), "");
    }
}
