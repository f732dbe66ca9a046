pub mod index;

use crate::models::courier::GeoPoint;

const EARTH_RADIUS_KM: f64 = 6_371.0;
// Slightly under the true ~111.19 km so derived boxes err on the large side.
const KM_PER_DEG_LAT: f64 = 111.0;

pub fn haversine_km(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let delta_lat = (b.lat - a.lat).to_radians();
    let delta_lng = (b.lng - a.lng).to_radians();

    let sin_lat = (delta_lat / 2.0).sin();
    let sin_lng = (delta_lng / 2.0).sin();

    let haversine = sin_lat * sin_lat + lat1.cos() * lat2.cos() * sin_lng * sin_lng;
    let central_angle = 2.0 * haversine.min(1.0).sqrt().asin();

    EARTH_RADIUS_KM * central_angle
}

/// Half-extent in degrees (lat, lng) of a box that contains every point within
/// `radius_km` of `center`. The longitude span is 180 when the circle reaches a
/// pole.
pub fn degree_span(center: &GeoPoint, radius_km: f64) -> (f64, f64) {
    let lat_span = radius_km / KM_PER_DEG_LAT;
    if center.lat.abs() + lat_span >= 90.0 {
        return (lat_span, 180.0);
    }

    // Widest longitude offset on a small circle of angular radius `lat_span`.
    let ratio = lat_span.to_radians().sin() / center.lat.to_radians().cos();
    if ratio >= 1.0 {
        return (lat_span, 180.0);
    }
    (lat_span, ratio.asin().to_degrees().min(180.0))
}
