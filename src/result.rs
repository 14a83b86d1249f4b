use std::{fmt, marker::PhantomData};

use geo::{Coord, LineString, Polygon};
use serde::{ser::SerializeSeq, Serialize, Serializer};

/// Marker for the frame a [`Quad`] lives in.
pub trait CoordinateSpace: fmt::Debug + Clone + Copy + PartialEq {
    const NAME: &'static str;
}

/// The resized and zero-padded network input frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Padded;

/// The frame of the image handed to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Original;

impl CoordinateSpace for Padded {
    const NAME: &'static str = "padded";
}

impl CoordinateSpace for Original {
    const NAME: &'static str = "original";
}

/// Four-point quadrilateral, clockwise in image coordinates (y down) starting
/// at the top-left-most corner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quad<S: CoordinateSpace> {
    pub points: [Coord<f32>; 4],
    space: PhantomData<S>,
}

impl<S: CoordinateSpace> Quad<S> {
    pub fn new(points: [Coord<f32>; 4]) -> Self {
        Self {
            points,
            space: PhantomData,
        }
    }

    pub fn from_xy(points: [[f32; 2]; 4]) -> Self {
        Self::new(points.map(|[x, y]| Coord { x, y }))
    }

    /// Axis-aligned rectangle from `(left, top)` to `(right, bottom)`.
    pub fn from_bounds(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self::from_xy([[left, top], [right, top], [right, bottom], [left, bottom]])
    }

    pub fn map_points(&self, f: impl Fn(Coord<f32>) -> Coord<f32>) -> [Coord<f32>; 4] {
        self.points.map(f)
    }

    /// `(min_x, min_y, max_x, max_y)`
    pub fn bounds(&self) -> (f32, f32, f32, f32) {
        self.points.iter().fold(
            (f32::MAX, f32::MAX, f32::MIN, f32::MIN),
            |(min_x, min_y, max_x, max_y), p| {
                (min_x.min(p.x), min_y.min(p.y), max_x.max(p.x), max_y.max(p.y))
            },
        )
    }

    pub fn to_polygon(&self) -> Polygon<f32> {
        Polygon::new(LineString::from(self.points.to_vec()), vec![])
    }

    pub fn space(&self) -> &'static str {
        S::NAME
    }
}

impl<S: CoordinateSpace> Serialize for Quad<S> {
    fn serialize<Ser: Serializer>(&self, serializer: Ser) -> Result<Ser::Ok, Ser::Error> {
        let mut seq = serializer.serialize_seq(Some(4))?;
        for point in &self.points {
            seq.serialize_element(&[point.x, point.y])?;
        }
        seq.end()
    }
}

/// Text regions of one image, in the coordinates of that image.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DetectionResult {
    pub boxes: Vec<Quad<Original>>,
    pub polys: Vec<Quad<Original>>,
}

impl DetectionResult {
    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }
}
