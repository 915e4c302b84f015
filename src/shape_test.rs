use super::*;
use serde_json::json;

fn record(shape_type: &str, shape_data: Value) -> ShapeRecord {
    ShapeRecord {
        id: "s1".into(),
        shape_type: shape_type.into(),
        fill_color: "#ffffff".into(),
        stroke_color: "#000000".into(),
        stroke_width: 1.5,
        draggable: true,
        shape_data,
    }
}

// =============================================================================
// ShapeType
// =============================================================================

#[test]
fn shape_type_parses_every_known_variant() {
    for kind in ShapeType::ALL {
        assert_eq!(kind.as_str().parse::<ShapeType>(), Ok(kind));
    }
}

#[test]
fn shape_type_rejects_unknown_name() {
    assert_eq!(
        "hexagon".parse::<ShapeType>(),
        Err(ValidationError::UnknownShapeType("hexagon".into()))
    );
}

// =============================================================================
// Record decode
// =============================================================================

#[test]
fn rectangle_record_decodes() {
    let shape = Shape::from_record(&record(
        "rectangle",
        json!({"x": 1.5, "y": 2.5, "width": 30.5, "height": 40.5}),
    ))
    .expect("valid rectangle");

    assert_eq!(shape.shape_type(), ShapeType::Rectangle);
    assert_eq!(shape.data, ShapeData::Rectangle { x: 1.5, y: 2.5, width: 30.5, height: 40.5 });
    assert!(shape.draggable);
}

#[test]
fn integer_coordinates_are_accepted_as_numbers() {
    let shape = Shape::from_record(&record("circle", json!({"x": 10, "y": 20, "radius": 5}))).expect("valid circle");
    assert_eq!(shape.data, ShapeData::Circle { x: 10.0, y: 20.0, radius: 5.0 });
}

#[test]
fn missing_field_is_named() {
    let err = Shape::from_record(&record("rectangle", json!({"x": 1.0, "y": 2.0, "width": 3.0}))).unwrap_err();
    assert_eq!(err, ValidationError::MissingField { shape: ShapeType::Rectangle, field: "height" });
    assert_eq!(err.to_string(), "rectangle missing height");
}

#[test]
fn null_field_counts_as_missing() {
    let err = Shape::from_record(&record("circle", json!({"x": 1.0, "y": 2.0, "radius": null}))).unwrap_err();
    assert_eq!(err, ValidationError::MissingField { shape: ShapeType::Circle, field: "radius" });
}

#[test]
fn mistyped_field_is_named() {
    let err = Shape::from_record(&record("circle", json!({"x": "1", "y": 2.0, "radius": 3.0}))).unwrap_err();
    assert_eq!(err, ValidationError::WrongType { shape: ShapeType::Circle, field: "x", expected: "number" });
}

#[test]
fn text_must_be_a_string_on_notes() {
    let err = Shape::from_record(&record(
        "note",
        json!({"x": 0.0, "y": 0.0, "width": 1.0, "height": 1.0, "padding": 1.0, "fontSize": 12.0, "text": 7}),
    ))
    .unwrap_err();
    assert_eq!(err, ValidationError::WrongType { shape: ShapeType::Note, field: "text", expected: "string" });
}

#[test]
fn points_must_all_be_numbers() {
    let err = Shape::from_record(&record("scribble", json!({"points": [1.0, "two", 3.0]}))).unwrap_err();
    assert_eq!(
        err,
        ValidationError::WrongType { shape: ShapeType::Scribble, field: "points", expected: "number array" }
    );

    let ok = Shape::from_record(&record("arrow", json!({"points": [0.0, 0.0, 10.5, 10.5]}))).expect("valid arrow");
    assert_eq!(ok.data, ShapeData::Arrow { points: vec![0.0, 0.0, 10.5, 10.5] });
}

#[test]
fn unknown_type_is_rejected() {
    let err = Shape::from_record(&record("triangle", json!({}))).unwrap_err();
    assert_eq!(err, ValidationError::UnknownShapeType("triangle".into()));
}

#[test]
fn empty_id_and_type_are_rejected() {
    let mut rec = record("line", json!({"points": []}));
    rec.id = String::new();
    assert_eq!(Shape::from_record(&rec), Err(ValidationError::MissingId));

    let mut rec = record("line", json!({"points": []}));
    rec.shape_type = String::new();
    assert_eq!(Shape::from_record(&rec), Err(ValidationError::MissingType));
}

#[test]
fn shape_data_must_be_an_object() {
    let err = Shape::from_record(&record("line", json!([1, 2]))).unwrap_err();
    assert_eq!(err, ValidationError::NotAnObject("shapeData"));
}

// =============================================================================
// Round trips
// =============================================================================

#[test]
fn record_round_trip_is_lossless_for_every_variant() {
    let records = [
        record("rectangle", json!({"x": 1.5, "y": 2.5, "width": 3.5, "height": 4.5})),
        record("circle", json!({"x": 1.5, "y": 2.5, "radius": 9.25})),
        record("line", json!({"points": [0.5, 1.5, 2.5, 3.5]})),
        record("arrow", json!({"points": [0.5, 1.5]})),
        record("scribble", json!({"points": []})),
        record(
            "text",
            json!({"x": 1.5, "y": 2.5, "text": "hello", "fontSize": 14.5, "width": 200.5, "padding": 4.5}),
        ),
        record(
            "note",
            json!({"x": 1.5, "y": 2.5, "width": 150.5, "height": 150.5, "padding": 8.5, "fontSize": 16.5, "text": "todo"}),
        ),
    ];

    for rec in records {
        let shape = Shape::from_record(&rec).expect("valid record");
        assert_eq!(shape.to_record(), rec, "round trip failed for {}", rec.shape_type);
    }
}

#[test]
fn record_round_trip_keeps_integer_numbers() {
    let records = [
        record("circle", json!({"x": 10, "y": 20, "radius": 5})),
        record("rectangle", json!({"x": 0, "y": -4, "width": 120, "height": 80.5})),
        record("line", json!({"points": [0, 0, 100, 50]})),
    ];

    for rec in records {
        let shape = Shape::from_record(&rec).expect("valid record");
        assert_eq!(shape.to_record(), rec, "round trip failed for {}", rec.shape_type);
    }
}

#[test]
fn record_round_trip_keeps_extra_payload_keys() {
    let rec = record(
        "rectangle",
        json!({"x": 1.5, "y": 2.5, "width": 3.5, "height": 4.5, "rotation": 45.5, "label": {"text": "api"}}),
    );
    let shape = Shape::from_record(&rec).expect("valid rectangle");

    assert_eq!(shape.data(), &ShapeData::Rectangle { x: 1.5, y: 2.5, width: 3.5, height: 4.5 });
    assert_eq!(shape.to_record(), rec);
    assert_eq!(shape.to_value()["rotation"], 45.5);
}

#[test]
fn wire_round_trip_keeps_extra_keys_and_integers() {
    let value = json!({
        "id": "c1",
        "type": "circle",
        "fillColor": "#fff",
        "strokeColor": "#000",
        "strokeWidth": 2,
        "draggable": false,
        "x": 10,
        "y": 20,
        "radius": 5,
        "opacity": 0.5,
    });
    let shape = Shape::from_value(&value).expect("valid circle");

    let encoded = shape.to_value();
    assert_eq!(encoded["x"], json!(10));
    assert_eq!(encoded["opacity"], 0.5);
    assert_eq!(shape.to_record().shape_data, json!({"x": 10, "y": 20, "radius": 5, "opacity": 0.5}));
    assert_eq!(Shape::from_value(&encoded), Ok(shape));
}

#[test]
fn constructed_shape_payload_follows_typed_data() {
    let shape = Shape::new("n1", "#fff", "#000", 1.0, true, ShapeData::Circle { x: 1.5, y: 2.5, radius: 3.5 });
    assert_eq!(shape.to_record().shape_data, json!({"x": 1.5, "y": 2.5, "radius": 3.5}));
    assert_eq!(Shape::from_record(&shape.to_record()), Ok(shape));
}

#[test]
fn wire_value_flattens_payload_next_to_shared_fields() {
    let shape = Shape::from_record(&record("circle", json!({"x": 1.5, "y": 2.5, "radius": 3.5}))).expect("valid circle");
    let value = shape.to_value();

    assert_eq!(
        value,
        json!({
            "id": "s1",
            "type": "circle",
            "fillColor": "#ffffff",
            "strokeColor": "#000000",
            "strokeWidth": 1.5,
            "draggable": true,
            "x": 1.5,
            "y": 2.5,
            "radius": 3.5,
        })
    );
    assert_eq!(Shape::from_value(&value), Ok(shape));
}

#[test]
fn wire_value_requires_shared_attributes() {
    let err = Shape::from_value(&json!({
        "id": "s1",
        "type": "line",
        "strokeColor": "#000",
        "strokeWidth": 1.0,
        "draggable": false,
        "points": [],
    }))
    .unwrap_err();
    assert_eq!(err, ValidationError::MissingField { shape: ShapeType::Line, field: "fillColor" });
}

#[test]
fn serde_deserialize_validates() {
    let bad: Result<Shape, _> = serde_json::from_value(json!({"id": "s1", "type": "circle"}));
    let err = bad.unwrap_err().to_string();
    assert!(err.contains("circle missing fillColor"), "unexpected error: {err}");

    let good: Shape = serde_json::from_value(json!({
        "id": "t1",
        "type": "text",
        "fillColor": "#000",
        "strokeColor": "#000",
        "strokeWidth": 0.5,
        "draggable": true,
        "x": 1.5,
        "y": 1.5,
        "text": "hi",
        "fontSize": 12.5,
        "width": 100.5,
        "padding": 2.5,
    }))
    .expect("valid text shape");
    assert_eq!(good.shape_type(), ShapeType::Text);
}
