//! Integration tests for descriptor serialization.
//!
//! These exercise the short-info and full-info text forms through the
//! public API, the way discovery replies and full-info exchanges use them.

use labstream_core::{
    ChannelFormat, DescriptorError, Query, StreamInfo, IRREGULAR_RATE, STREAM_PROTOCOL_VERSION,
};

fn make_fullinfo() -> StreamInfo {
    let mut info =
        StreamInfo::new("fullinfo", "unittest", 1, 1.0, ChannelFormat::Int8, "fullinfo1234")
            .expect("valid descriptor");
    info.desc_mut()
        .append_child_value("info", "contents\nwith\n\tnewlines");
    info
}

#[test]
fn test_fullinfo_roundtrip_preserves_control_characters() {
    // Arrange
    let original = make_fullinfo();

    // Act
    let text = original.to_fullinfo_message().expect("serialize");
    let parsed = StreamInfo::from_message(&text).expect("parse");

    // Assert
    assert_eq!(parsed, original);
    assert_eq!(
        parsed.desc().child_value("info"),
        Some("contents\nwith\n\tnewlines")
    );
}

#[test]
fn test_shortinfo_omits_description_tree() {
    // Arrange
    let original = make_fullinfo();

    // Act
    let text = original.to_shortinfo_message().expect("serialize");
    let parsed = StreamInfo::from_message(&text).expect("parse");

    // Assert – every field survives, the tree does not
    assert!(parsed.desc().is_empty());
    assert_eq!(parsed.name(), "fullinfo");
    assert_eq!(parsed.content_type(), "unittest");
    assert_eq!(parsed.channel_count(), 1);
    assert_eq!(parsed.nominal_srate(), 1.0);
    assert_eq!(parsed.channel_format(), ChannelFormat::Int8);
    assert_eq!(parsed.source_id(), "fullinfo1234");
    assert_eq!(parsed.uid(), original.uid());
    assert_eq!(parsed.hostname(), original.hostname());
    assert_eq!(parsed.created_at(), original.created_at());
    assert_eq!(parsed.version(), STREAM_PROTOCOL_VERSION);
}

#[test]
fn test_every_channel_format_roundtrips() {
    for format in ChannelFormat::ALL {
        let original =
            StreamInfo::new("fmt", "test", 4, IRREGULAR_RATE, format, "").expect("valid");

        let parsed = StreamInfo::from_message(&original.to_fullinfo_message().expect("serialize"))
            .expect("parse");

        assert_eq!(parsed, original, "{format}");
    }
}

#[test]
fn test_invalid_construction_fails_synchronously() {
    assert_eq!(
        StreamInfo::new("", "t", 1, 1.0, ChannelFormat::Float32, "").err(),
        Some(DescriptorError::EmptyName)
    );
    assert_eq!(
        StreamInfo::new("n", "t", -1, 1.0, ChannelFormat::Float32, "").err(),
        Some(DescriptorError::NegativeChannelCount(-1))
    );
}

#[test]
fn test_garbage_input_is_an_error_not_a_panic() {
    let full = make_fullinfo().to_fullinfo_message().expect("serialize");
    let inputs = [
        "",
        "{",
        "null",
        "{\"info\": 5}",
        "\u{0}\u{1}\u{2}",
        &full[..full.len() / 2],
    ];

    for input in inputs {
        assert!(StreamInfo::from_message(input).is_err(), "{input:?}");
    }
}

#[test]
fn test_clone_isolation_through_public_api() {
    // Arrange
    let original = make_fullinfo();
    let mut copy = original.clone();
    let mut deep = original.deep_clone();

    // Act
    copy.desc_mut().append_child_value("extra", "1");
    deep.desc_mut().remove_child("info");

    // Assert
    assert!(original.desc().child("extra").is_none());
    assert!(original.desc().child("info").is_some());
    assert!(!original.shares_desc_with(&deep));
}

#[test]
fn test_parsed_descriptor_matches_queries() {
    // Arrange
    let info = StreamInfo::from_message(&make_fullinfo().to_shortinfo_message().expect("ser"))
        .expect("parse");

    // Act / Assert
    assert!(info.matches_query(&Query::parse("name='fullinfo' and type='unittest'").expect("q")));
    assert!(info.matches_query(&Query::parse("channel_count=1").expect("q")));
    assert!(!info.matches_query(&Query::parse("source_id='other'").expect("q")));
}
