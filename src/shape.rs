//! Shape model — tagged shape variants and their record/wire codecs.
//!
//! DESIGN
//! ======
//! A shape travels in two encodings: the persisted record (shared columns
//! plus a `shapeData` JSON blob) and the flattened wire DTO (shared fields
//! and payload keys side by side in one object). Both decode through the
//! same payload validator, which checks every key the declared `type`
//! requires. A shape is either fully typed or rejected with the offending
//! field named; partial shapes never reach board state.
//!
//! The validated payload object is kept as received next to its typed view,
//! so encoding re-emits the original numbers and any keys the type does not
//! require.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("shape id is missing")]
    MissingId,
    #[error("shape type is missing")]
    MissingType,
    #[error("unsupported shape type: {0}")]
    UnknownShapeType(String),
    #[error("{shape} missing {field}")]
    MissingField { shape: ShapeType, field: &'static str },
    #[error("{shape} field {field} must be a {expected}")]
    WrongType { shape: ShapeType, field: &'static str, expected: &'static str },
    #[error("{0} must be an object")]
    NotAnObject(&'static str),
    #[error("unknown delta type: {0}")]
    UnknownDeltaType(String),
    #[error("shape {0} already exists on this board")]
    DuplicateShape(String),
    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl crate::frame::ErrorCode for ValidationError {
    fn error_code(&self) -> &'static str {
        "E_VALIDATION"
    }
}

// =============================================================================
// SHAPE TYPE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShapeType {
    Rectangle,
    Circle,
    Line,
    Arrow,
    Scribble,
    Text,
    Note,
}

impl ShapeType {
    pub const ALL: [ShapeType; 7] = [
        ShapeType::Rectangle,
        ShapeType::Circle,
        ShapeType::Line,
        ShapeType::Arrow,
        ShapeType::Scribble,
        ShapeType::Text,
        ShapeType::Note,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rectangle => "rectangle",
            Self::Circle => "circle",
            Self::Line => "line",
            Self::Arrow => "arrow",
            Self::Scribble => "scribble",
            Self::Text => "text",
            Self::Note => "note",
        }
    }
}

impl fmt::Display for ShapeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShapeType {
    type Err = ValidationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == raw)
            .ok_or_else(|| ValidationError::UnknownShapeType(raw.to_owned()))
    }
}

// =============================================================================
// SHAPE
// =============================================================================

/// Variant-specific geometry. One arm per shape type.
#[derive(Debug, Clone, PartialEq)]
pub enum ShapeData {
    Rectangle { x: f64, y: f64, width: f64, height: f64 },
    Circle { x: f64, y: f64, radius: f64 },
    Line { points: Vec<f64> },
    Arrow { points: Vec<f64> },
    Scribble { points: Vec<f64> },
    Text { x: f64, y: f64, text: String, font_size: f64, width: f64, padding: f64 },
    Note { x: f64, y: f64, width: f64, height: f64, padding: f64, font_size: f64, text: String },
}

/// A validated board shape.
///
/// Serializes as the flattened wire DTO (`{ id, type, fillColor, ..., x, y }`)
/// and deserializes through [`Shape::from_value`], so any serde path into a
/// `Shape` is validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Shape {
    pub id: String,
    pub fill_color: String,
    pub stroke_color: String,
    pub stroke_width: f64,
    pub draggable: bool,
    data: ShapeData,
    payload: Map<String, Value>,
}

/// Keys shared by every shape on the wire; everything else is payload.
const SHARED_KEYS: [&str; 6] = ["id", "type", "fillColor", "strokeColor", "strokeWidth", "draggable"];

/// Storage form of a shape: shared columns plus the `shape_data` blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShapeRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub shape_type: String,
    pub fill_color: String,
    pub stroke_color: String,
    pub stroke_width: f64,
    pub draggable: bool,
    pub shape_data: Value,
}

impl Shape {
    /// Build a shape from typed geometry. The payload is derived from `data`.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        fill_color: impl Into<String>,
        stroke_color: impl Into<String>,
        stroke_width: f64,
        draggable: bool,
        data: ShapeData,
    ) -> Self {
        let payload = encode_payload(&data);
        Self {
            id: id.into(),
            fill_color: fill_color.into(),
            stroke_color: stroke_color.into(),
            stroke_width,
            draggable,
            data,
            payload,
        }
    }

    #[must_use]
    pub fn data(&self) -> &ShapeData {
        &self.data
    }

    #[must_use]
    pub fn shape_type(&self) -> ShapeType {
        match self.data {
            ShapeData::Rectangle { .. } => ShapeType::Rectangle,
            ShapeData::Circle { .. } => ShapeType::Circle,
            ShapeData::Line { .. } => ShapeType::Line,
            ShapeData::Arrow { .. } => ShapeType::Arrow,
            ShapeData::Scribble { .. } => ShapeType::Scribble,
            ShapeData::Text { .. } => ShapeType::Text,
            ShapeData::Note { .. } => ShapeType::Note,
        }
    }

    /// Decode a persisted record, validating `shape_data` against `type`.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] naming the first missing or mistyped field.
    pub fn from_record(record: &ShapeRecord) -> Result<Self, ValidationError> {
        if record.id.is_empty() {
            return Err(ValidationError::MissingId);
        }
        if record.shape_type.is_empty() {
            return Err(ValidationError::MissingType);
        }
        let shape_type: ShapeType = record.shape_type.parse()?;
        let Value::Object(payload) = &record.shape_data else {
            return Err(ValidationError::NotAnObject("shapeData"));
        };

        Ok(Self {
            id: record.id.clone(),
            fill_color: record.fill_color.clone(),
            stroke_color: record.stroke_color.clone(),
            stroke_width: record.stroke_width,
            draggable: record.draggable,
            data: decode_payload(shape_type, payload)?,
            payload: payload.clone(),
        })
    }

    /// Encode into the storage form. Inverse of [`Shape::from_record`].
    #[must_use]
    pub fn to_record(&self) -> ShapeRecord {
        ShapeRecord {
            id: self.id.clone(),
            shape_type: self.shape_type().as_str().to_owned(),
            fill_color: self.fill_color.clone(),
            stroke_color: self.stroke_color.clone(),
            stroke_width: self.stroke_width,
            draggable: self.draggable,
            shape_data: Value::Object(self.payload.clone()),
        }
    }

    /// Decode a flattened wire DTO.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] naming the first missing or mistyped field.
    pub fn from_value(value: &Value) -> Result<Self, ValidationError> {
        let Value::Object(map) = value else {
            return Err(ValidationError::NotAnObject("shape"));
        };

        let id = match map.get("id") {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            _ => return Err(ValidationError::MissingId),
        };
        let shape_type: ShapeType = match map.get("type") {
            Some(Value::String(raw)) => raw.parse()?,
            None | Some(Value::Null) => return Err(ValidationError::MissingType),
            Some(other) => return Err(ValidationError::UnknownShapeType(other.to_string())),
        };

        let fields = Fields { shape: shape_type, map };
        let payload = map
            .iter()
            .filter(|(key, _)| !SHARED_KEYS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        Ok(Self {
            id,
            fill_color: fields.string("fillColor")?,
            stroke_color: fields.string("strokeColor")?,
            stroke_width: fields.number("strokeWidth")?,
            draggable: fields.boolean("draggable")?,
            data: decode_payload(shape_type, map)?,
            payload,
        })
    }

    /// Encode as a flattened wire DTO. Inverse of [`Shape::from_value`].
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("id".into(), Value::String(self.id.clone()));
        map.insert("type".into(), Value::String(self.shape_type().as_str().to_owned()));
        map.insert("fillColor".into(), Value::String(self.fill_color.clone()));
        map.insert("strokeColor".into(), Value::String(self.stroke_color.clone()));
        map.insert("strokeWidth".into(), Value::from(self.stroke_width));
        map.insert("draggable".into(), Value::Bool(self.draggable));
        map.extend(self.payload.clone());
        Value::Object(map)
    }
}

impl TryFrom<Value> for Shape {
    type Error = ValidationError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Shape::from_value(&value)
    }
}

impl From<Shape> for Value {
    fn from(shape: Shape) -> Self {
        shape.to_value()
    }
}

// =============================================================================
// PAYLOAD CODEC
// =============================================================================

struct Fields<'a> {
    shape: ShapeType,
    map: &'a Map<String, Value>,
}

impl Fields<'_> {
    fn get(&self, field: &'static str) -> Result<&Value, ValidationError> {
        match self.map.get(field) {
            None | Some(Value::Null) => Err(ValidationError::MissingField { shape: self.shape, field }),
            Some(value) => Ok(value),
        }
    }

    fn wrong(&self, field: &'static str, expected: &'static str) -> ValidationError {
        ValidationError::WrongType { shape: self.shape, field, expected }
    }

    fn number(&self, field: &'static str) -> Result<f64, ValidationError> {
        self.get(field)?
            .as_f64()
            .ok_or_else(|| self.wrong(field, "number"))
    }

    fn string(&self, field: &'static str) -> Result<String, ValidationError> {
        self.get(field)?
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| self.wrong(field, "string"))
    }

    fn boolean(&self, field: &'static str) -> Result<bool, ValidationError> {
        self.get(field)?
            .as_bool()
            .ok_or_else(|| self.wrong(field, "boolean"))
    }

    fn points(&self, field: &'static str) -> Result<Vec<f64>, ValidationError> {
        let Some(items) = self.get(field)?.as_array() else {
            return Err(self.wrong(field, "number array"));
        };
        items
            .iter()
            .map(|v| v.as_f64().ok_or_else(|| self.wrong(field, "number array")))
            .collect()
    }
}

fn decode_payload(shape: ShapeType, map: &Map<String, Value>) -> Result<ShapeData, ValidationError> {
    let f = Fields { shape, map };
    let data = match shape {
        ShapeType::Rectangle => ShapeData::Rectangle {
            x: f.number("x")?,
            y: f.number("y")?,
            width: f.number("width")?,
            height: f.number("height")?,
        },
        ShapeType::Circle => ShapeData::Circle { x: f.number("x")?, y: f.number("y")?, radius: f.number("radius")? },
        ShapeType::Line => ShapeData::Line { points: f.points("points")? },
        ShapeType::Arrow => ShapeData::Arrow { points: f.points("points")? },
        ShapeType::Scribble => ShapeData::Scribble { points: f.points("points")? },
        ShapeType::Text => ShapeData::Text {
            x: f.number("x")?,
            y: f.number("y")?,
            text: f.string("text")?,
            font_size: f.number("fontSize")?,
            width: f.number("width")?,
            padding: f.number("padding")?,
        },
        ShapeType::Note => ShapeData::Note {
            x: f.number("x")?,
            y: f.number("y")?,
            width: f.number("width")?,
            height: f.number("height")?,
            padding: f.number("padding")?,
            font_size: f.number("fontSize")?,
            text: f.string("text")?,
        },
    };
    Ok(data)
}

fn encode_payload(data: &ShapeData) -> Map<String, Value> {
    let mut map = Map::new();
    let mut put = |key: &str, value: Value| {
        map.insert(key.to_owned(), value);
    };
    match data {
        ShapeData::Rectangle { x, y, width, height } => {
            put("x", Value::from(*x));
            put("y", Value::from(*y));
            put("width", Value::from(*width));
            put("height", Value::from(*height));
        }
        ShapeData::Circle { x, y, radius } => {
            put("x", Value::from(*x));
            put("y", Value::from(*y));
            put("radius", Value::from(*radius));
        }
        ShapeData::Line { points } | ShapeData::Arrow { points } | ShapeData::Scribble { points } => {
            put("points", Value::from(points.clone()));
        }
        ShapeData::Text { x, y, text, font_size, width, padding } => {
            put("x", Value::from(*x));
            put("y", Value::from(*y));
            put("text", Value::String(text.clone()));
            put("fontSize", Value::from(*font_size));
            put("width", Value::from(*width));
            put("padding", Value::from(*padding));
        }
        ShapeData::Note { x, y, width, height, padding, font_size, text } => {
            put("x", Value::from(*x));
            put("y", Value::from(*y));
            put("width", Value::from(*width));
            put("height", Value::from(*height));
            put("padding", Value::from(*padding));
            put("fontSize", Value::from(*font_size));
            put("text", Value::String(text.clone()));
        }
    }
    map
}

#[cfg(test)]
#[path = "shape_test.rs"]
mod tests;
