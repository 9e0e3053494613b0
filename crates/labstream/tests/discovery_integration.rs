//! Integration tests for stream discovery.
//!
//! Real outlets are published on loopback and found through the public
//! resolver API:
//!
//! - one-shot resolves return exactly the matching streams, stamped with
//!   the address they answered from;
//! - short-info replies omit the description tree, which only the info
//!   channel of an inlet delivers;
//! - a continuous resolver picks up new outlets and forgets vanished ones;
//! - malformed predicates fail before anything is sent.

mod common;

use std::time::{Duration, Instant};

use common::{eventually, lab_config, NETWORK_TIMEOUT};
use labstream::{
    session_query, ChannelFormat, ContinuousResolver, InletOptions, OutletOptions, Resolver,
    StreamError, StreamInfo, StreamInlet, StreamOutlet,
};

// ── One-shot resolves ─────────────────────────────────────────────────────────

/// The description tree is not part of discovery replies but survives the
/// info channel byte for byte, control characters included.
#[test]
fn test_fullinfo_round_trip_keeps_description_tree() {
    // Arrange
    let config = lab_config();
    let original = "contents\nwith\n\tnewlines";
    let mut info = StreamInfo::new("fullinfo", "unittest", 1, 1.0, ChannelFormat::Int8, "fullinfo1234")
        .expect("descriptor");
    info.desc_mut().append_child_value("info", original);
    let _outlet = StreamOutlet::with_config(info, OutletOptions::default(), config.clone())
        .expect("outlet");
    let resolver = Resolver::with_config(config.clone()).expect("resolver");

    // Act
    let found = resolver
        .resolve_byprop("name", "fullinfo", 1, NETWORK_TIMEOUT)
        .expect("resolve");

    // Assert
    assert_eq!(found.len(), 1);
    assert!(found[0].desc().is_empty(), "short info must not carry the description");
    assert_eq!(found[0].v4address(), "127.0.0.1");

    let inlet = StreamInlet::with_config(found[0].clone(), InletOptions::default(), config)
        .expect("inlet");
    let full = inlet.info(NETWORK_TIMEOUT).expect("full info");
    assert_eq!(full.desc().child_value("info"), Some(original));
    assert_eq!(full.source_id(), "fullinfo1234");
}

/// N matching outlets give exactly N results, and non-matching outlets of
/// the same session stay out.
#[test]
fn test_resolve_finds_every_matching_outlet() {
    // Arrange
    let config = lab_config();
    let outlets: Vec<StreamOutlet> = (0..3)
        .map(|i| {
            let info = StreamInfo::new(
                &format!("multi-{i}"),
                "multi",
                2,
                50.0,
                ChannelFormat::Float32,
                &format!("multi-src-{i}"),
            )
            .expect("descriptor");
            StreamOutlet::with_config(info, OutletOptions::default(), config.clone()).expect("outlet")
        })
        .collect();
    let other = StreamInfo::new("other", "markers", 1, 0.0, ChannelFormat::String, "other-src")
        .expect("descriptor");
    let _other = StreamOutlet::with_config(other, OutletOptions::default(), config.clone())
        .expect("outlet");
    let resolver = Resolver::with_config(config).expect("resolver");

    // Act
    let found = resolver
        .resolve_bypred("type='multi'", outlets.len(), NETWORK_TIMEOUT)
        .expect("resolve");

    // Assert
    let mut names: Vec<&str> = found.iter().map(StreamInfo::name).collect();
    names.sort_unstable();
    assert_eq!(names, vec!["multi-0", "multi-1", "multi-2"]);
}

/// Outlets of another session are invisible.
#[test]
fn test_resolve_ignores_other_sessions() {
    let publisher = lab_config();
    let info = StreamInfo::new("private", "eeg", 1, 10.0, ChannelFormat::Float32, "private-src")
        .expect("descriptor");
    let _outlet = StreamOutlet::with_config(info, OutletOptions::default(), publisher).expect("outlet");
    let resolver = Resolver::with_config(lab_config()).expect("resolver");

    let found = resolver.resolve_all(Duration::from_secs(2)).expect("resolve");

    assert!(found.is_empty());
}

#[test]
fn test_malformed_predicate_fails_without_waiting() {
    let resolver = Resolver::with_config(lab_config()).expect("resolver");
    let start = Instant::now();

    let result = resolver.resolve_bypred("name=='EEG' and", 1, NETWORK_TIMEOUT);

    assert!(matches!(result, Err(StreamError::QueryParse(_))));
    assert!(start.elapsed() < Duration::from_secs(1));
}

// ── Continuous resolver ───────────────────────────────────────────────────────

/// A continuous resolver converges on a new outlet and forgets it once the
/// outlet stops answering for longer than `forget_after`.
#[test]
fn test_continuous_resolver_tracks_outlet_lifetime() {
    // Arrange
    let config = lab_config();
    let query = session_query(&config, Some("name='watched'")).expect("query");
    let resolver = ContinuousResolver::new(query, Duration::from_secs(2), config.clone())
        .expect("continuous resolver");
    let info = StreamInfo::new("watched", "eeg", 1, 10.0, ChannelFormat::Float32, "watched-src")
        .expect("descriptor");

    // Act
    let outlet = StreamOutlet::with_config(info, OutletOptions::default(), config).expect("outlet");
    let appeared = eventually(NETWORK_TIMEOUT, || resolver.results().len() == 1);
    drop(outlet);
    let forgotten = eventually(NETWORK_TIMEOUT, || resolver.results().is_empty());

    // Assert
    assert!(appeared, "outlet was never discovered");
    assert!(forgotten, "vanished outlet was never evicted");
}
