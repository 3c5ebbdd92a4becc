use geo::{BoundingRect, Coord, HaversineDistance, LineString, Point, Rect};
use thiserror::Error;

/// (longitude, latitude) in degrees.
pub type Coordinate = Coord<f64>;

#[derive(Debug, Error, PartialEq)]
pub enum GeometryError {
    #[error("polygon has no rings")]
    NoRings,
    #[error("ring {ring} has {points} points, at least 3 are required")]
    TooFewPoints { ring: usize, points: usize },
    #[error("ring {ring} position {index} is not a finite [lon, lat] pair")]
    InvalidPosition { ring: usize, index: usize },
}

/// Municipal boundary. Rings are kept exactly as supplied, so an open ring
/// (first point != last point) stays open.
///
/// Only the first ring is consumed by `centroid` and `contains`. Holes are
/// carried as data and ignored by both operations.
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    rings: Vec<LineString<f64>>,
}

impl Polygon {
    /// Wraps rings without validation.
    pub fn new(rings: Vec<LineString<f64>>) -> Self {
        Self { rings }
    }

    /// Builds a polygon from GeoJSON-style positions, rejecting rings with
    /// fewer than 3 points and positions that are not finite pairs.
    pub fn from_positions(rings: &[Vec<Vec<f64>>]) -> Result<Self, GeometryError> {
        if rings.is_empty() {
            return Err(GeometryError::NoRings);
        }

        let mut converted = Vec::with_capacity(rings.len());
        for (ring_idx, ring) in rings.iter().enumerate() {
            if ring.len() < 3 {
                return Err(GeometryError::TooFewPoints { ring: ring_idx, points: ring.len() });
            }
            let mut coords = Vec::with_capacity(ring.len());
            for (index, position) in ring.iter().enumerate() {
                match position.as_slice() {
                    [x, y, ..] if x.is_finite() && y.is_finite() => {
                        coords.push(Coord { x: *x, y: *y })
                    }
                    _ => return Err(GeometryError::InvalidPosition { ring: ring_idx, index }),
                }
            }
            converted.push(LineString::new(coords));
        }

        Ok(Self::new(converted))
    }

    pub fn outer_ring(&self) -> Option<&LineString<f64>> {
        self.rings.first()
    }

    pub fn holes(&self) -> &[LineString<f64>] {
        self.rings.get(1..).unwrap_or(&[])
    }

    pub fn bounding_rect(&self) -> Option<Rect<f64>> {
        self.outer_ring().and_then(|ring| ring.bounding_rect())
    }
}

/// Unweighted mean of the outer ring's vertices.
///
/// This is not an area centroid for irregular shapes; search radii and mean
/// distances downstream are calibrated against this approximation. A closed
/// ring counts its repeated first vertex twice.
pub fn centroid(polygon: &Polygon) -> Option<Coordinate> {
    let ring = polygon.outer_ring()?;
    if ring.0.is_empty() {
        return None;
    }

    let n = ring.0.len() as f64;
    let (sum_x, sum_y) = ring
        .0
        .iter()
        .fold((0.0, 0.0), |(sx, sy), c| (sx + c.x, sy + c.y));

    Some(Coord { x: sum_x / n, y: sum_y / n })
}

/// Even-odd ray casting against the outer ring.
///
/// Points lying exactly on an edge or vertex may land on either side.
pub fn contains(polygon: &Polygon, point: Coordinate) -> bool {
    let coords = match polygon.outer_ring() {
        Some(ring) if ring.0.len() >= 3 => &ring.0,
        _ => return false,
    };

    let mut inside = false;
    let mut j = coords.len() - 1;
    for i in 0..coords.len() {
        let (xi, yi) = (coords[i].x, coords[i].y);
        let (xj, yj) = (coords[j].x, coords[j].y);

        if (yi > point.y) != (yj > point.y)
            && point.x < (xj - xi) * (point.y - yi) / (yj - yi) + xi
        {
            inside = !inside;
        }
        j = i;
    }

    inside
}

/// Haversine distance in kilometres.
pub fn distance_km(a: Coordinate, b: Coordinate) -> f64 {
    // Canonical argument order keeps the result bit-for-bit symmetric.
    let (from, to) = if (a.x, a.y) <= (b.x, b.y) { (a, b) } else { (b, a) };
    Point::from(from).haversine_distance(&Point::from(to)) / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Polygon {
        Polygon::from_positions(&[vec![
            vec![0.0, 0.0],
            vec![0.0, 2.0],
            vec![2.0, 2.0],
            vec![2.0, 0.0],
        ]])
        .unwrap()
    }

    #[test]
    fn test_centroid_of_square_is_center() {
        let c = centroid(&square()).unwrap();
        assert!((c.x - 1.0).abs() < 1e-12);
        assert!((c.y - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_centroid_is_vertex_mean_not_area_centroid() {
        // Extra vertices along one edge pull the vertex mean towards it.
        let polygon = Polygon::from_positions(&[vec![
            vec![0.0, 0.0],
            vec![0.0, 1.0],
            vec![0.0, 2.0],
            vec![0.0, 3.0],
            vec![0.0, 4.0],
            vec![4.0, 4.0],
            vec![4.0, 0.0],
        ]])
        .unwrap();
        let c = centroid(&polygon).unwrap();
        assert!((c.x - 8.0 / 7.0).abs() < 1e-12);
        assert!((c.y - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_centroid_of_empty_ring_is_none() {
        assert_eq!(centroid(&Polygon::new(vec![LineString::new(vec![])])), None);
        assert_eq!(centroid(&Polygon::new(vec![])), None);
    }

    #[test]
    fn test_contains_inside_and_far_outside() {
        let polygon = square();
        assert!(contains(&polygon, Coord { x: 1.0, y: 1.0 }));
        assert!(contains(&polygon, Coord { x: 0.1, y: 1.9 }));
        assert!(!contains(&polygon, Coord { x: 50.0, y: 50.0 }));
        assert!(!contains(&polygon, Coord { x: -3.0, y: 1.0 }));
    }

    #[test]
    fn test_contains_accepts_open_and_closed_rings() {
        let closed = Polygon::from_positions(&[vec![
            vec![0.0, 0.0],
            vec![0.0, 2.0],
            vec![2.0, 2.0],
            vec![2.0, 0.0],
            vec![0.0, 0.0],
        ]])
        .unwrap();
        let point = Coord { x: 1.5, y: 0.5 };
        assert_eq!(contains(&closed, point), contains(&square(), point));
        assert!(contains(&closed, point));
    }

    #[test]
    fn test_contains_concave_notch() {
        // U shape: the notch between the arms is outside.
        let polygon = Polygon::from_positions(&[vec![
            vec![0.0, 0.0],
            vec![0.0, 3.0],
            vec![1.0, 3.0],
            vec![1.0, 1.0],
            vec![2.0, 1.0],
            vec![2.0, 3.0],
            vec![3.0, 3.0],
            vec![3.0, 0.0],
        ]])
        .unwrap();
        assert!(contains(&polygon, Coord { x: 0.5, y: 2.5 }));
        assert!(!contains(&polygon, Coord { x: 1.5, y: 2.5 }));
        assert!(contains(&polygon, Coord { x: 1.5, y: 0.5 }));
    }

    #[test]
    fn test_holes_are_ignored_by_containment() {
        let polygon = Polygon::from_positions(&[
            vec![vec![0.0, 0.0], vec![0.0, 4.0], vec![4.0, 4.0], vec![4.0, 0.0]],
            vec![vec![1.0, 1.0], vec![1.0, 3.0], vec![3.0, 3.0], vec![3.0, 1.0]],
        ])
        .unwrap();
        assert_eq!(polygon.holes().len(), 1);
        assert!(contains(&polygon, Coord { x: 2.0, y: 2.0 }));
    }

    #[test]
    fn test_from_positions_rejects_malformed_rings() {
        assert_eq!(Polygon::from_positions(&[]), Err(GeometryError::NoRings));
        assert_eq!(
            Polygon::from_positions(&[vec![vec![0.0, 0.0], vec![1.0, 1.0]]]),
            Err(GeometryError::TooFewPoints { ring: 0, points: 2 })
        );
        assert_eq!(
            Polygon::from_positions(&[vec![vec![0.0, 0.0], vec![1.0], vec![1.0, 1.0]]]),
            Err(GeometryError::InvalidPosition { ring: 0, index: 1 })
        );
        assert_eq!(
            Polygon::from_positions(&[vec![vec![0.0, 0.0], vec![f64::NAN, 1.0], vec![1.0, 1.0]]]),
            Err(GeometryError::InvalidPosition { ring: 0, index: 1 })
        );
    }

    #[test]
    fn test_distance_is_symmetric_and_zero_on_self() {
        let pairs = [
            (Coord { x: -99.13, y: 19.43 }, Coord { x: -98.20, y: 19.04 }),
            (Coord { x: 0.0, y: 0.0 }, Coord { x: 179.9, y: -45.0 }),
            (Coord { x: 12.5, y: 41.9 }, Coord { x: 12.5, y: 41.9 }),
        ];
        for (a, b) in pairs {
            assert_eq!(distance_km(a, b), distance_km(b, a));
            assert_eq!(distance_km(a, a), 0.0);
        }
    }

    #[test]
    fn test_distance_one_degree_of_latitude() {
        let d = distance_km(Coord { x: 0.0, y: 0.0 }, Coord { x: 0.0, y: 1.0 });
        assert!((d - 111.19).abs() < 0.1, "got {d}");
    }
}
