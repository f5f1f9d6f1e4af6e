//! Shape model for the shared whiteboard document.
//!
//! A shape is a geometry (one of eight kinds, each with its own
//! required fields), a paint style, and a handful of flags. Every
//! attribute is merged independently at field granularity, so the
//! types here carry no merge logic — see [`crate::store`].

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identity of a shape. Never reused after deletion.
pub type ShapeId = Uuid;

/// Identity of a shape group.
pub type GroupId = Uuid;

/// A point in document coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Geometry union: exactly one variant per supported shape kind.
///
/// Each kind carries its own required fields; there is no generic
/// property bag, so an unknown kind cannot be represented.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Geometry {
    Rect { x: f32, y: f32, width: f32, height: f32 },
    Ellipse { cx: f32, cy: f32, rx: f32, ry: f32 },
    Diamond { x: f32, y: f32, width: f32, height: f32 },
    Triangle { a: Point, b: Point, c: Point },
    Line { start: Point, end: Point },
    Arrow { start: Point, end: Point, head_size: f32 },
    Path { points: Vec<Point>, closed: bool },
    Text { x: f32, y: f32, content: String, font_size: f32 },
}

impl Geometry {
    /// Kind name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Geometry::Rect { .. } => "rect",
            Geometry::Ellipse { .. } => "ellipse",
            Geometry::Diamond { .. } => "diamond",
            Geometry::Triangle { .. } => "triangle",
            Geometry::Line { .. } => "line",
            Geometry::Arrow { .. } => "arrow",
            Geometry::Path { .. } => "path",
            Geometry::Text { .. } => "text",
        }
    }
}

/// Paint style, merged field-by-field like everything else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeStyle {
    /// Fill color, RGBA in [0,1]
    pub fill: [f32; 4],
    /// Fill opacity in [0,1]
    pub fill_opacity: f32,
    /// Stroke color, RGBA in [0,1]
    pub stroke: [f32; 4],
    /// Stroke width, >= 0
    pub stroke_width: f32,
    /// Stroke opacity in [0,1]
    pub stroke_opacity: f32,
}

impl Default for ShapeStyle {
    fn default() -> Self {
        Self {
            fill: [1.0, 1.0, 1.0, 1.0],
            fill_opacity: 1.0,
            stroke: [0.0, 0.0, 0.0, 1.0],
            stroke_width: 1.0,
            stroke_opacity: 1.0,
        }
    }
}

/// Clamp a scalar style field into its legal range.
pub fn clamp_opacity(v: f32) -> f32 {
    v.clamp(0.0, 1.0)
}

/// Stroke width must be non-negative.
pub fn clamp_stroke_width(v: f32) -> f32 {
    v.max(0.0)
}

/// Materialized shape as consumers see it.
///
/// Produced by the document store from its per-field registers; the
/// layer position lives in the derived layer order, not here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeRecord {
    pub id: ShapeId,
    pub geometry: Geometry,
    pub style: ShapeStyle,
    /// Rotation in degrees around the shape's center
    pub rotation: f32,
    pub visible: bool,
    /// Advisory edit lock; enforced by clients, not by merge
    pub locked: bool,
    pub group: Option<GroupId>,
}

impl ShapeRecord {
    /// New record with a fresh id and default style/flags.
    pub fn new(geometry: Geometry) -> Self {
        Self {
            id: Uuid::new_v4(),
            geometry,
            style: ShapeStyle::default(),
            rotation: 0.0,
            visible: true,
            locked: false,
            group: None,
        }
    }
}
