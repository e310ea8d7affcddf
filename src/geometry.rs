//! Planar polygon helpers in longitude/latitude degrees.
//!
//! Footprints are small enough (about 110 km across) that a planar treatment
//! of geographic coordinates is accurate for overlap decisions.

/// Intersections smaller than this (in square degrees) count as touching only.
const AREA_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub lon: f64,
    pub lat: f64,
}

impl Point {
    pub fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn width(&self) -> f64 {
        self.max_lon - self.min_lon
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_lon < other.max_lon
            && other.min_lon < self.max_lon
            && self.min_lat < other.max_lat
            && other.min_lat < self.max_lat
    }
}

/// A simple polygon stored as an open ring (the closing vertex is implied).
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    ring: Vec<Point>,
}

impl Polygon {
    /// Builds a polygon, dropping repeated vertices and an explicit closing
    /// vertex. Returns `None` when fewer than three distinct vertices remain.
    pub fn new(points: Vec<Point>) -> Option<Self> {
        let mut ring: Vec<Point> = Vec::with_capacity(points.len());
        for point in points {
            if ring.last() != Some(&point) {
                ring.push(point);
            }
        }
        while ring.len() > 1 && ring.first() == ring.last() {
            ring.pop();
        }
        (ring.len() >= 3).then_some(Self { ring })
    }

    pub fn rectangle(bbox: &BoundingBox) -> Self {
        Self {
            ring: vec![
                Point::new(bbox.min_lon, bbox.min_lat),
                Point::new(bbox.max_lon, bbox.min_lat),
                Point::new(bbox.max_lon, bbox.max_lat),
                Point::new(bbox.min_lon, bbox.max_lat),
            ],
        }
    }

    /// Parses the first ring of a `POLYGON` or `MULTIPOLYGON` WKT string.
    /// A third (height) ordinate is accepted and ignored.
    pub fn from_wkt(wkt: &str) -> Option<Self> {
        let start = wkt.find('(')?;
        let body = wkt[start..].trim_start_matches(|c: char| c == '(' || c.is_whitespace());
        let end = body.find(')')?;

        let points = body[..end]
            .split(',')
            .map(|pair| {
                let mut ordinates = pair.split_whitespace().map(str::parse::<f64>);
                match (ordinates.next(), ordinates.next()) {
                    (Some(Ok(lon)), Some(Ok(lat))) => Some(Point::new(lon, lat)),
                    _ => None,
                }
            })
            .collect::<Option<Vec<_>>>()?;
        Self::new(points)
    }

    /// Parses a KML `<coordinates>` payload: whitespace separated
    /// `lon,lat[,height]` tuples.
    pub fn from_kml_coordinates(text: &str) -> Option<Self> {
        let points = text
            .split_whitespace()
            .map(|tuple| {
                let mut ordinates = tuple.split(',').map(str::parse::<f64>);
                match (ordinates.next(), ordinates.next()) {
                    (Some(Ok(lon)), Some(Ok(lat))) => Some(Point::new(lon, lat)),
                    _ => None,
                }
            })
            .collect::<Option<Vec<_>>>()?;
        Self::new(points)
    }

    pub fn vertices(&self) -> &[Point] {
        &self.ring
    }

    pub fn bounding_box(&self) -> BoundingBox {
        let mut bbox = BoundingBox {
            min_lon: f64::INFINITY,
            min_lat: f64::INFINITY,
            max_lon: f64::NEG_INFINITY,
            max_lat: f64::NEG_INFINITY,
        };
        for p in &self.ring {
            bbox.min_lon = bbox.min_lon.min(p.lon);
            bbox.min_lat = bbox.min_lat.min(p.lat);
            bbox.max_lon = bbox.max_lon.max(p.lon);
            bbox.max_lat = bbox.max_lat.max(p.lat);
        }
        bbox
    }

    /// Shoelace area, positive for counter-clockwise rings.
    fn signed_area(&self) -> f64 {
        let n = self.ring.len();
        (0..n)
            .map(|i| {
                let a = self.ring[i];
                let b = self.ring[(i + 1) % n];
                a.lon * b.lat - b.lon * a.lat
            })
            .sum::<f64>()
            / 2.0
    }

    pub fn area(&self) -> f64 {
        self.signed_area().abs()
    }

    /// True when the longitude span only makes sense across the 180° meridian.
    pub fn spans_antimeridian(&self) -> bool {
        self.bounding_box().width() > 180.0
    }

    /// Shifts western longitudes by +360° so a footprint crossing the 180°
    /// meridian becomes contiguous.
    pub fn unwrap_antimeridian(&self) -> Self {
        Self {
            ring: self
                .ring
                .iter()
                .map(|p| {
                    if p.lon < 0.0 {
                        Point::new(p.lon + 360.0, p.lat)
                    } else {
                        *p
                    }
                })
                .collect(),
        }
    }

    fn counter_clockwise(&self) -> Self {
        let mut ring = self.ring.clone();
        if self.signed_area() < 0.0 {
            ring.reverse();
        }
        Self { ring }
    }

    /// Sutherland-Hodgman clip of `self` against a convex polygon.
    pub fn clip(&self, convex: &Polygon) -> Option<Polygon> {
        let clip = convex.counter_clockwise();
        let n = clip.ring.len();
        let mut output = self.ring.clone();

        for i in 0..n {
            let (a, b) = (clip.ring[i], clip.ring[(i + 1) % n]);
            let input = std::mem::take(&mut output);
            let Some(&last) = input.last() else {
                break;
            };

            let mut previous = last;
            for &current in &input {
                let current_inside = cross(a, b, current) >= 0.0;
                let previous_inside = cross(a, b, previous) >= 0.0;
                if current_inside {
                    if !previous_inside {
                        output.push(edge_crossing(previous, current, a, b));
                    }
                    output.push(current);
                } else if previous_inside {
                    output.push(edge_crossing(previous, current, a, b));
                }
                previous = current;
            }
        }
        Polygon::new(output)
    }

    /// Non-empty intersection area with a convex polygon. Shared edges or
    /// corners do not count.
    pub fn overlaps(&self, convex: &Polygon) -> bool {
        if !self.bounding_box().intersects(&convex.bounding_box()) {
            return false;
        }
        self.clip(convex)
            .is_some_and(|intersection| intersection.area() > AREA_EPSILON)
    }
}

/// Which side of the directed line `a -> b` the point `p` is on (> 0 is left).
fn cross(a: Point, b: Point, p: Point) -> f64 {
    (b.lon - a.lon) * (p.lat - a.lat) - (b.lat - a.lat) * (p.lon - a.lon)
}

/// Point where segment `p -> q` crosses the line through `a` and `b`.
fn edge_crossing(p: Point, q: Point, a: Point, b: Point) -> Point {
    let dp = cross(a, b, p);
    let dq = cross(a, b, q);
    let t = dp / (dp - dq);
    Point::new(p.lon + t * (q.lon - p.lon), p.lat + t * (q.lat - p.lat))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(min_lon: f64, min_lat: f64, size: f64) -> Polygon {
        Polygon::rectangle(&BoundingBox {
            min_lon,
            min_lat,
            max_lon: min_lon + size,
            max_lat: min_lat + size,
        })
    }

    #[test]
    fn test_from_wkt_multipolygon_with_heights() {
        let wkt = "MULTIPOLYGON(((8.99 49.65 0,10.52 49.63 0,10.48 48.65 0,8.99 48.66 0,8.99 49.65 0)))";
        let polygon = Polygon::from_wkt(wkt).unwrap();
        assert_eq!(polygon.vertices().len(), 4);
        assert_eq!(polygon.vertices()[1], Point::new(10.52, 49.63));
    }

    #[test]
    fn test_from_wkt_rejects_garbage() {
        assert!(Polygon::from_wkt("POLYGON((a b, c d, e f))").is_none());
        assert!(Polygon::from_wkt("no geometry here").is_none());
        assert!(Polygon::from_wkt("POLYGON((1 1, 2 2))").is_none());
    }

    #[test]
    fn test_from_kml_coordinates() {
        let polygon =
            Polygon::from_kml_coordinates("9.0,45.0,0 10.0,45.0,0 10.0,46.0,0 9.0,46.0,0 9.0,45.0,0")
                .unwrap();
        assert_eq!(polygon.vertices().len(), 4);
        assert!((polygon.area() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_overlapping_squares() {
        assert!(square(0.0, 0.0, 1.0).overlaps(&square(0.5, 0.5, 1.0)));
    }

    #[test]
    fn test_contained_polygon_overlaps() {
        assert!(square(0.0, 0.0, 3.0).overlaps(&square(1.0, 1.0, 1.0)));
        assert!(square(1.0, 1.0, 1.0).overlaps(&square(0.0, 0.0, 3.0)));
    }

    #[test]
    fn test_shared_edge_is_not_overlap() {
        assert!(!square(0.0, 0.0, 1.0).overlaps(&square(1.0, 0.0, 1.0)));
        assert!(!square(0.0, 0.0, 1.0).overlaps(&square(0.0, 1.0, 1.0)));
    }

    #[test]
    fn test_shared_corner_is_not_overlap() {
        assert!(!square(0.0, 0.0, 1.0).overlaps(&square(1.0, 1.0, 1.0)));
    }

    #[test]
    fn test_disjoint() {
        assert!(!square(0.0, 0.0, 1.0).overlaps(&square(5.0, 5.0, 1.0)));
    }

    #[test]
    fn test_triangle_misses_corner_of_bbox() {
        // The bounding boxes overlap, the shapes do not.
        let triangle = Polygon::new(vec![
            Point::new(0.0, 0.0),
            Point::new(2.0, 0.0),
            Point::new(0.0, 2.0),
        ])
        .unwrap();
        assert!(!triangle.overlaps(&square(1.5, 1.5, 1.0)));
        assert!(triangle.overlaps(&square(0.5, 0.5, 1.0)));
    }

    #[test]
    fn test_clockwise_clip_polygon() {
        let clockwise = Polygon::new(vec![
            Point::new(0.5, 0.5),
            Point::new(0.5, 1.5),
            Point::new(1.5, 1.5),
            Point::new(1.5, 0.5),
        ])
        .unwrap();
        let intersection = square(0.0, 0.0, 1.0).clip(&clockwise).unwrap();
        assert!((intersection.area() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_antimeridian_unwrap() {
        let polygon = Polygon::new(vec![
            Point::new(179.5, 10.0),
            Point::new(-179.5, 10.0),
            Point::new(-179.5, 11.0),
            Point::new(179.5, 11.0),
        ])
        .unwrap();
        assert!(polygon.spans_antimeridian());

        let unwrapped = polygon.unwrap_antimeridian();
        assert!(!unwrapped.spans_antimeridian());
        let bbox = unwrapped.bounding_box();
        assert_eq!(bbox.min_lon, 179.5);
        assert_eq!(bbox.max_lon, 180.5);
    }
}
