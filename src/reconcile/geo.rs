//! Great-circle helpers

use crate::types::LatLon;

/// Haversine distance in meters on a sphere of `earth_radius_km`.
pub fn haversine_m(a: LatLon, b: LatLon, earth_radius_km: f64) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lon = (b.lon - a.lon).to_radians();
    let h = (d_lat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    earth_radius_km * c * 1000.0
}

/// Arithmetic mean of the points, `None` for an empty set.
pub fn centroid<'a, I>(points: I) -> Option<LatLon>
where
    I: IntoIterator<Item = &'a LatLon>,
{
    let (mut lat, mut lon, mut n) = (0.0, 0.0, 0usize);
    for p in points {
        lat += p.lat;
        lon += p.lon;
        n += 1;
    }
    (n > 0).then(|| LatLon::new(lat / n as f64, lon / n as f64))
}
