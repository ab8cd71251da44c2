//! Shape model for the shared canvas.
//!
//! Every shape kind is a variant of the closed [`ShapeKind`] enum, so each
//! mutation site has to handle every kind explicitly. Shapes are stored in the
//! replica as JSON, one entry per shape id.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::op::OpError;

/// Stable identifier of a shape inside a document.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShapeId(String);

impl ShapeId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ShapeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ShapeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShapeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ShapeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// 2D point in document coordinates.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    fn offset(self, dx: f32, dy: f32) -> Self {
        Self { x: self.x + dx, y: self.y + dy }
    }
}

/// Axis-aligned bounding box.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Bounds {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Bounds {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    fn enclosing(points: &[Point]) -> Self {
        let Some(first) = points.first() else {
            return Self::default();
        };
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (first.x, first.y, first.x, first.y);
        for p in &points[1..] {
            min_x = min_x.min(p.x);
            min_y = min_y.min(p.y);
            max_x = max_x.max(p.x);
            max_y = max_y.max(p.y);
        }
        Self::new(min_x, min_y, max_x - min_x, max_y - min_y)
    }
}

/// Stroke and fill styling shared by all kinds.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Style {
    /// Stroke color as `#rrggbb`
    pub stroke: String,
    /// Fill color, `None` = transparent
    pub fill: Option<String>,
    pub stroke_width: f32,
    pub opacity: f32,
}

impl Default for Style {
    fn default() -> Self {
        Self {
            stroke: "#1e1e1e".to_string(),
            fill: None,
            stroke_width: 2.0,
            opacity: 1.0,
        }
    }
}

/// Kind-tagged geometry of a shape.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ShapeKind {
    Rectangle {
        bounds: Bounds,
        rotation: f32,
        corner_radius: f32,
    },
    Ellipse {
        bounds: Bounds,
        rotation: f32,
    },
    Line {
        start: Point,
        end: Point,
    },
    Arrow {
        start: Point,
        end: Point,
    },
    Text {
        origin: Point,
        content: String,
        font_size: f32,
    },
    /// Freehand stroke.
    Path {
        points: Vec<Point>,
    },
    Sticky {
        bounds: Bounds,
        content: String,
    },
}

impl ShapeKind {
    pub fn name(&self) -> &'static str {
        match self {
            ShapeKind::Rectangle { .. } => "rectangle",
            ShapeKind::Ellipse { .. } => "ellipse",
            ShapeKind::Line { .. } => "line",
            ShapeKind::Arrow { .. } => "arrow",
            ShapeKind::Text { .. } => "text",
            ShapeKind::Path { .. } => "path",
            ShapeKind::Sticky { .. } => "sticky",
        }
    }

    /// Bounding box of the geometry.
    pub fn bounds(&self) -> Bounds {
        match self {
            ShapeKind::Rectangle { bounds, .. }
            | ShapeKind::Ellipse { bounds, .. }
            | ShapeKind::Sticky { bounds, .. } => *bounds,
            ShapeKind::Line { start, end } | ShapeKind::Arrow { start, end } => {
                Bounds::enclosing(&[*start, *end])
            }
            ShapeKind::Text { origin, content, font_size } => {
                // Rough estimate, the renderer owns real text metrics.
                let width = content.chars().count() as f32 * font_size * 0.6;
                Bounds::new(origin.x, origin.y, width, *font_size * 1.2)
            }
            ShapeKind::Path { points } => Bounds::enclosing(points),
        }
    }

    /// Move the geometry by (dx, dy).
    pub fn translate(&mut self, dx: f32, dy: f32) {
        match self {
            ShapeKind::Rectangle { bounds, .. }
            | ShapeKind::Ellipse { bounds, .. }
            | ShapeKind::Sticky { bounds, .. } => {
                bounds.x += dx;
                bounds.y += dy;
            }
            ShapeKind::Line { start, end } | ShapeKind::Arrow { start, end } => {
                *start = start.offset(dx, dy);
                *end = end.offset(dx, dy);
            }
            ShapeKind::Text { origin, .. } => *origin = origin.offset(dx, dy),
            ShapeKind::Path { points } => {
                for p in points.iter_mut() {
                    *p = p.offset(dx, dy);
                }
            }
        }
    }

    /// Resize to the given extent, keeping the top-left (or start) anchored.
    pub fn resize(&mut self, width: f32, height: f32) -> Result<(), OpError> {
        if !width.is_finite() || !height.is_finite() || width < 0.0 || height < 0.0 {
            return Err(OpError::InvalidGeometry(format!("{width}x{height}")));
        }
        match self {
            ShapeKind::Rectangle { bounds, .. }
            | ShapeKind::Ellipse { bounds, .. }
            | ShapeKind::Sticky { bounds, .. } => {
                bounds.width = width;
                bounds.height = height;
            }
            ShapeKind::Line { start, end } | ShapeKind::Arrow { start, end } => {
                // Keep the direction of the segment, fit it into the new box.
                let sx = if end.x < start.x { -1.0 } else { 1.0 };
                let sy = if end.y < start.y { -1.0 } else { 1.0 };
                *end = Point::new(start.x + sx * width, start.y + sy * height);
            }
            ShapeKind::Path { points } => {
                let old = Bounds::enclosing(points);
                let fx = if old.width > 0.0 { width / old.width } else { 1.0 };
                let fy = if old.height > 0.0 { height / old.height } else { 1.0 };
                for p in points.iter_mut() {
                    p.x = old.x + (p.x - old.x) * fx;
                    p.y = old.y + (p.y - old.y) * fy;
                }
            }
            ShapeKind::Text { .. } => {
                return Err(OpError::Unsupported { op: "resize", kind: self.name() });
            }
        }
        Ok(())
    }

    /// Replace the text content of text-bearing kinds.
    pub fn set_text(&mut self, text: String) -> Result<(), OpError> {
        match self {
            ShapeKind::Text { content, .. } | ShapeKind::Sticky { content, .. } => {
                *content = text;
                Ok(())
            }
            ShapeKind::Rectangle { .. }
            | ShapeKind::Ellipse { .. }
            | ShapeKind::Line { .. }
            | ShapeKind::Arrow { .. }
            | ShapeKind::Path { .. } => Err(OpError::Unsupported { op: "set_text", kind: self.name() }),
        }
    }
}

/// A shape on the canvas.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Shape {
    pub id: ShapeId,
    #[serde(flatten)]
    pub kind: ShapeKind,
    #[serde(default)]
    pub style: Style,
    /// Stack order, higher draws on top
    #[serde(default)]
    pub z_index: i64,
}

impl Shape {
    pub fn new(kind: ShapeKind) -> Self {
        Self {
            id: ShapeId::new(),
            kind,
            style: Style::default(),
            z_index: 0,
        }
    }

    pub fn with_id(id: impl Into<ShapeId>, kind: ShapeKind) -> Self {
        Self { id: id.into(), ..Self::new(kind) }
    }

    pub fn rectangle(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self::new(ShapeKind::Rectangle {
            bounds: Bounds::new(x, y, width, height),
            rotation: 0.0,
            corner_radius: 0.0,
        })
    }

    pub fn ellipse(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self::new(ShapeKind::Ellipse {
            bounds: Bounds::new(x, y, width, height),
            rotation: 0.0,
        })
    }

    pub fn text(x: f32, y: f32, content: impl Into<String>) -> Self {
        Self::new(ShapeKind::Text {
            origin: Point::new(x, y),
            content: content.into(),
            font_size: 16.0,
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
