use chrono::{TimeZone, Utc};
use serde_json::json;

use super::codec;
use super::{FieldValue, Message};

#[test]
fn set_replaces_in_place_and_keeps_order() {
    let mut msg = Message::new();
    msg.set("a", 1i64).set("b", "two").set("a", 3i64);

    let names: Vec<_> = msg.field_names().collect();
    assert_eq!(names, vec!["a", "b"]);
    assert_eq!(msg.get_long("a"), Some(3));
    assert_eq!(msg.len(), 2);
}

#[test]
fn typed_getters_reject_other_types() {
    let msg = Message::new().with("text", "hi").with("flag", true);
    assert_eq!(msg.get_string("text"), Some("hi"));
    assert_eq!(msg.get_long("text"), None);
    assert_eq!(msg.get_bool("flag"), Some(true));
    assert!(msg.get("missing").is_none());
}

#[test]
fn remove_field() {
    let mut msg = Message::new().with("a", 1i64).with("b", 2i64);
    assert_eq!(msg.remove("a"), Some(FieldValue::Long(1)));
    assert!(!msg.contains("a"));
    assert_eq!(msg.remove("a"), None);
}

#[test]
fn destination_uses_reserved_field() {
    let mut msg = Message::new();
    msg.set_destination("orders");
    assert_eq!(msg.destination(), Some("orders"));
    assert_eq!(msg.get_string(super::DESTINATION_FIELD), Some("orders"));
}

#[test]
fn encodes_scalars_as_plain_json() {
    let msg = Message::new()
        .with("type", "hello")
        .with("count", 7i64)
        .with("ok", false);
    assert_eq!(
        codec::encode(&msg),
        json!({"type": "hello", "count": 7, "ok": false})
    );
}

#[test]
fn encodes_tagged_types() {
    let when = Utc.timestamp_millis_opt(1_725_000_000_123).unwrap();
    let msg = Message::new()
        .with("price", 1.5f64)
        .with("when", when)
        .with("blob", vec![1u8, 2, 3]);
    let encoded = codec::encode(&msg);
    assert_eq!(encoded["price"], json!({"_d_": 1.5}));
    assert_eq!(encoded["when"], json!({"_m_": 1_725_000_000_123i64}));
    assert_eq!(encoded["blob"], json!({"_o_": "AQID"}));

    let decoded = codec::decode(&encoded).unwrap();
    assert_eq!(decoded, msg);
}

#[test]
fn non_finite_doubles_survive_the_wire() {
    let msg = Message::new()
        .with("inf", f64::INFINITY)
        .with("ninf", f64::NEG_INFINITY)
        .with("nan", f64::NAN);
    let decoded = codec::decode(&codec::encode(&msg)).unwrap();
    assert_eq!(decoded.get_double("inf"), Some(f64::INFINITY));
    assert_eq!(decoded.get_double("ninf"), Some(f64::NEG_INFINITY));
    assert!(decoded.get_double("nan").unwrap().is_nan());
}

#[test]
fn nested_messages_and_arrays() {
    let inner = Message::new().with("x", 1i64);
    let msg = Message::new()
        .with("inner", inner.clone())
        .with("names", vec!["a".to_string(), "b".to_string()])
        .with("inners", vec![inner.clone(), inner.clone()]);

    let decoded = codec::decode(&codec::encode(&msg)).unwrap();
    assert_eq!(decoded.get_message("inner"), Some(&inner));
    assert_eq!(
        decoded.get("names"),
        Some(&FieldValue::StringArray(vec!["a".into(), "b".into()]))
    );
    match decoded.get("inners") {
        Some(FieldValue::MessageArray(items)) => assert_eq!(items.len(), 2),
        other => panic!("expected message array, got {other:?}"),
    }
}

#[test]
fn field_order_survives_the_wire() {
    let msg = Message::new()
        .with("zeta", 1i64)
        .with("alpha", "a")
        .with("mid", 2.5f64);

    let bytes = codec::to_bytes(&msg).unwrap();
    assert_eq!(
        std::str::from_utf8(&bytes).unwrap(),
        r#"{"zeta":1,"alpha":"a","mid":{"_d_":2.5}}"#
    );
    let decoded = codec::from_slice(&bytes).unwrap();
    let names: Vec<_> = decoded.field_names().collect();
    assert_eq!(names, vec!["zeta", "alpha", "mid"]);
    assert_eq!(decoded, msg);
}

#[test]
fn opaque_arrays() {
    let msg = Message::new().with("blobs", vec![vec![1u8, 2, 3], vec![], vec![255u8]]);
    let encoded = codec::encode(&msg);
    assert_eq!(
        encoded["blobs"],
        json!([{"_o_": "AQID"}, {"_o_": ""}, {"_o_": "/w=="}])
    );
    assert_eq!(codec::decode(&encoded).unwrap(), msg);
    assert_eq!(
        FieldValue::OpaqueArray(vec![]).type_name(),
        "opaque array"
    );
}

#[test]
fn tag_like_field_names_stay_messages() {
    let inner = Message::new().with("_d_", 5i64);
    let msg = Message::new()
        .with("inner", inner.clone())
        .with("__m_", "x")
        .with("_o_", true);

    let encoded = codec::encode(&msg);
    assert_eq!(encoded["inner"], json!({"__d_": 5}));
    assert_eq!(encoded["___m_"], json!("x"));
    assert_eq!(encoded["__o_"], json!(true));

    let decoded = codec::decode(&encoded).unwrap();
    assert_eq!(decoded.get_message("inner"), Some(&inner));
    assert_eq!(decoded.get_string("__m_"), Some("x"));
    assert_eq!(decoded.get_bool("_o_"), Some(true));
    assert_eq!(decoded, msg);

    // ordinary underscore names pass through untouched
    let plain = Message::new().with("_x_", 1i64).with("d_", 2i64);
    assert_eq!(codec::encode(&plain), json!({"_x_": 1, "d_": 2}));
}

#[test]
fn decode_rejects_heterogeneous_arrays() {
    let err = codec::decode(&json!({"mixed": ["a", 1]})).unwrap_err();
    assert!(err.reason().contains("heterogeneous"));
}

#[test]
fn decode_rejects_non_objects_and_nulls() {
    assert!(codec::decode(&json!([1, 2])).is_err());
    assert!(codec::decode(&json!({"a": null})).is_err());
}

#[test]
fn empty_array_decodes_as_string_array() {
    let decoded = codec::decode(&json!({"empty": []})).unwrap();
    assert_eq!(decoded.get("empty"), Some(&FieldValue::StringArray(vec![])));
}

#[test]
fn equality_ignores_delivery_metadata() {
    let mut delivered = Message::new().with("a", 1i64);
    delivered.envelope.reply_to = Some(super::ReplyAddress {
        client_id: "c1".into(),
        request_id: 4,
    });
    assert_eq!(delivered, Message::new().with("a", 1i64));
    assert!(delivered.is_request());
}

#[test]
fn encoded_len_matches_serialized_body() {
    let msg = Message::new().with("k", "v");
    assert_eq!(msg.encoded_len(), r#"{"k":"v"}"#.len());
}
