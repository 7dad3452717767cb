//! Geographic value types.

use crate::error::{CodecError, CodecResult};

/// Mean earth radius in kilometers.
pub const EARTH_MEAN_RADIUS_KM: f64 = 6371.0;

/// Mean earth radius in miles.
pub const EARTH_MEAN_RADIUS_MILE: f64 = 3958.8;

/// A latitude/longitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GeoPoint {
    latitude: f64,
    longitude: f64,
}

impl GeoPoint {
    /// Creates a point, validating both coordinates.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::OutOfRange`] when latitude is outside
    /// `[-90, 90]` or longitude outside `[-180, 180]`.
    pub fn new(latitude: f64, longitude: f64) -> CodecResult<Self> {
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(CodecError::out_of_range(
                "latitude must be within the range (-90.0, 90.0)",
            ));
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(CodecError::out_of_range(
                "longitude must be within the range (-180.0, 180.0)",
            ));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    /// Latitude in degrees.
    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    /// Longitude in degrees.
    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    /// Great-circle distance to `other` in radians (haversine).
    pub fn distance_in_radians_to(&self, other: &GeoPoint) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let delta_lat = (other.latitude - self.latitude).to_radians();
        let delta_lng = (other.longitude - self.longitude).to_radians();

        let sin_half_lat = (delta_lat / 2.0).sin();
        let sin_half_lng = (delta_lng / 2.0).sin();
        let a = sin_half_lat * sin_half_lat + lat1.cos() * lat2.cos() * sin_half_lng * sin_half_lng;
        2.0 * a.sqrt().min(1.0).asin()
    }

    /// Great-circle distance to `other` in kilometers.
    pub fn distance_in_kilometers_to(&self, other: &GeoPoint) -> f64 {
        self.distance_in_radians_to(other) * EARTH_MEAN_RADIUS_KM
    }

    /// Great-circle distance to `other` in miles.
    pub fn distance_in_miles_to(&self, other: &GeoPoint) -> f64 {
        self.distance_in_radians_to(other) * EARTH_MEAN_RADIUS_MILE
    }
}

/// A closed polygon described by its vertices.
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    coordinates: Vec<GeoPoint>,
}

impl Polygon {
    /// Creates a polygon.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::OutOfRange`] with fewer than three vertices.
    pub fn new(coordinates: Vec<GeoPoint>) -> CodecResult<Self> {
        if coordinates.len() < 3 {
            return Err(CodecError::out_of_range("polygon must have at least 3 points"));
        }
        Ok(Self { coordinates })
    }

    /// The vertices in order.
    pub fn coordinates(&self) -> &[GeoPoint] {
        &self.coordinates
    }

    /// Whether `point` lies inside the polygon.
    ///
    /// Uses a bounding-box rejection followed by ray casting.
    pub fn contains_point(&self, point: &GeoPoint) -> bool {
        let (mut min_x, mut max_x) = (f64::MAX, f64::MIN);
        let (mut min_y, mut max_y) = (f64::MAX, f64::MIN);
        for p in &self.coordinates {
            min_x = min_x.min(p.latitude);
            max_x = max_x.max(p.latitude);
            min_y = min_y.min(p.longitude);
            max_y = max_y.max(p.longitude);
        }

        let outside = point.latitude < min_x
            || point.latitude > max_x
            || point.longitude < min_y
            || point.longitude > max_y;
        if outside {
            return false;
        }

        let mut inside = false;
        let n = self.coordinates.len();
        let mut j = n - 1;
        for i in 0..n {
            let start_x = self.coordinates[i].latitude;
            let start_y = self.coordinates[i].longitude;
            let end_x = self.coordinates[j].latitude;
            let end_y = self.coordinates[j].longitude;

            let intersect = ((start_y > point.longitude) != (end_y > point.longitude))
                && point.latitude
                    < (end_x - start_x) * (point.longitude - start_y) / (end_y - start_y) + start_x;
            if intersect {
                inside = !inside;
            }
            j = i;
        }
        inside
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_coordinates() {
        assert!(GeoPoint::new(91.0, 0.0).is_err());
        assert!(GeoPoint::new(0.0, -181.0).is_err());
        assert!(GeoPoint::new(-90.0, 180.0).is_ok());
    }

    #[test]
    fn distance_between_known_cities() {
        let sf = GeoPoint::new(37.7749, -122.4194).unwrap();
        let la = GeoPoint::new(34.0522, -118.2437).unwrap();
        let km = sf.distance_in_kilometers_to(&la);
        assert!((km - 559.0).abs() < 5.0, "got {km}");
        let miles = sf.distance_in_miles_to(&la);
        assert!((miles - km / 1.609).abs() < 3.0, "got {miles}");
        assert_eq!(sf.distance_in_radians_to(&sf), 0.0);
    }

    #[test]
    fn polygon_needs_three_points() {
        let a = GeoPoint::new(0.0, 0.0).unwrap();
        let b = GeoPoint::new(1.0, 1.0).unwrap();
        assert!(Polygon::new(vec![a, b]).is_err());
    }

    #[test]
    fn polygon_contains_point() {
        let square = Polygon::new(vec![
            GeoPoint::new(0.0, 0.0).unwrap(),
            GeoPoint::new(0.0, 10.0).unwrap(),
            GeoPoint::new(10.0, 10.0).unwrap(),
            GeoPoint::new(10.0, 0.0).unwrap(),
        ])
        .unwrap();

        assert!(square.contains_point(&GeoPoint::new(5.0, 5.0).unwrap()));
        assert!(!square.contains_point(&GeoPoint::new(15.0, 5.0).unwrap()));
        assert!(!square.contains_point(&GeoPoint::new(-1.0, -1.0).unwrap()));
    }
}
