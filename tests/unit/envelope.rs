use super::*;

#[test]
fn stream_message_has_standard_layout() {
    let envelope = JsonEnvelope::new("tester");
    let parent = json!({ "msg_id": "p1" });
    let content = StreamContent {
        name: "stdout".to_string(),
        text: "hello\n".to_string(),
    };

    let frames = envelope.stream_message(&parent, b"stream.stdout", &content);

    assert_eq!(frames.len(), 7);
    assert_eq!(frames[0], b"stream.stdout");
    assert_eq!(frames[1], DELIMITER);

    let header: Value = serde_json::from_slice(&frames[3]).unwrap();
    assert_eq!(header["msg_type"], "stream");
    assert_eq!(header["session"], envelope.session());
    assert_eq!(header["username"], "tester");

    let parent_header: Value = serde_json::from_slice(&frames[4]).unwrap();
    assert_eq!(parent_header["msg_id"], "p1");

    let body: Value = serde_json::from_slice(&frames[6]).unwrap();
    assert_eq!(body, json!({ "name": "stdout", "text": "hello\n" }));
}

#[test]
fn message_ids_are_unique() {
    let envelope = JsonEnvelope::default();
    let content = StreamContent {
        name: "stderr".to_string(),
        text: "x".to_string(),
    };
    let a = envelope.stream_message(&json!({}), b"t", &content);
    let b = envelope.stream_message(&json!({}), b"t", &content);

    let id = |frames: &[Frame]| {
        let header: Value = serde_json::from_slice(&frames[3]).unwrap();
        header["msg_id"].as_str().unwrap().to_string()
    };
    assert_ne!(id(&a), id(&b));
}

#[test]
fn extract_header_prefers_nested_header() {
    let message = json!({ "header": { "msg_id": "m" }, "content": {} });
    assert_eq!(extract_header(&message), json!({ "msg_id": "m" }));

    let bare = json!({ "msg_id": "n" });
    assert_eq!(extract_header(&bare), bare);

    assert_eq!(extract_header(&Value::Null), json!({}));
}
