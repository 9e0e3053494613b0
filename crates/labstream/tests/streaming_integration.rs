//! Integration tests for the data, info and time channels between a real
//! outlet and real inlets on loopback.
//!
//! The inlets are built straight from the outlet's own descriptor (whose
//! empty address means loopback), so these tests do not depend on
//! discovery.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{eventually, lab_config, NETWORK_TIMEOUT};
use labstream::{
    ApiConfig, BufferSize, ChannelFormat, InletOptions, OutletOptions, ProcessingFlags, StreamError,
    StreamInfo, StreamInlet, StreamOutlet,
};

fn float_outlet(name: &str) -> (StreamOutlet, Arc<ApiConfig>) {
    let config = lab_config();
    let info = StreamInfo::new(name, "eeg", 2, 100.0, ChannelFormat::Float32, &format!("{name}-src"))
        .expect("descriptor");
    let outlet = StreamOutlet::with_config(info, OutletOptions::default(), config.clone())
        .expect("outlet");
    (outlet, config)
}

fn raw_inlet(outlet: &StreamOutlet, config: &Arc<ApiConfig>, max_buffered: BufferSize) -> StreamInlet {
    let options = InletOptions {
        max_buffered,
        processing: ProcessingFlags::NONE,
        ..InletOptions::default()
    };
    StreamInlet::with_config(outlet.info().clone(), options, config.clone()).expect("inlet")
}

// ── Data channel ──────────────────────────────────────────────────────────────

/// Samples arrive in push order with their timestamps untouched when no
/// post-processing is enabled.
#[test]
fn test_samples_arrive_in_push_order() {
    // Arrange
    let (outlet, config) = float_outlet("ordered");
    let inlet = raw_inlet(&outlet, &config, BufferSize::default());
    inlet.open_stream(NETWORK_TIMEOUT).expect("open stream");
    assert!(outlet.wait_for_consumers(NETWORK_TIMEOUT));

    // Act
    for i in 0..10 {
        let v = i as f32;
        outlet.push_sample_at(&[v, -v], 1000.0 + f64::from(i) * 0.01, true).expect("push");
    }

    // Assert
    for i in 0..10 {
        let (values, timestamp) = inlet
            .pull_sample::<f32>(NETWORK_TIMEOUT)
            .expect("pull")
            .expect("sample before timeout");
        let v = i as f32;
        assert_eq!(values, vec![v, -v]);
        assert!((timestamp - (1000.0 + f64::from(i) * 0.01)).abs() < 1e-9);
    }
}

/// Each inlet has its own cursor; both see every sample.
#[test]
fn test_two_inlets_each_receive_everything() {
    let (outlet, config) = float_outlet("fanout");
    let first = raw_inlet(&outlet, &config, BufferSize::default());
    let second = raw_inlet(&outlet, &config, BufferSize::default());
    first.open_stream(NETWORK_TIMEOUT).expect("open first");
    second.open_stream(NETWORK_TIMEOUT).expect("open second");

    for i in 0..5 {
        outlet.push_sample(&[i as f32, 0.0]).expect("push");
    }

    for inlet in [&first, &second] {
        for i in 0..5 {
            let (values, _) = inlet
                .pull_sample::<f32>(NETWORK_TIMEOUT)
                .expect("pull")
                .expect("sample before timeout");
            assert_eq!(values[0], i as f32);
        }
    }
}

/// A full inlet buffer keeps the newest samples.
#[test]
fn test_overflowing_inlet_keeps_newest_samples() {
    // Arrange
    let (outlet, config) = float_outlet("overflow");
    let inlet = raw_inlet(&outlet, &config, BufferSize::Samples(5));
    inlet.open_stream(NETWORK_TIMEOUT).expect("open stream");

    // Act
    for i in 0..20 {
        outlet.push_sample(&[i as f32, 0.0]).expect("push");
    }
    let last_arrived = eventually(NETWORK_TIMEOUT, || {
        inlet.samples_available() == 5 && {
            std::thread::sleep(Duration::from_millis(300));
            inlet.samples_available() == 5
        }
    });
    let (chunk, timestamps) = inlet.pull_chunk::<f32>().expect("pull chunk");

    // Assert
    assert!(last_arrived);
    let firsts: Vec<f32> = chunk.iter().map(|values| values[0]).collect();
    assert_eq!(firsts, vec![15.0, 16.0, 17.0, 18.0, 19.0]);
    assert_eq!(timestamps.len(), 5);
}

/// Pulls convert values to the caller's type.
#[test]
fn test_pull_converts_to_requested_type() {
    let (outlet, config) = float_outlet("converted");
    let inlet = raw_inlet(&outlet, &config, BufferSize::default());
    inlet.open_stream(NETWORK_TIMEOUT).expect("open stream");

    outlet.push_sample(&[3.0f32, -7.0]).expect("push");

    let (values, _) = inlet
        .pull_sample::<f64>(NETWORK_TIMEOUT)
        .expect("pull")
        .expect("sample before timeout");
    assert_eq!(values, vec![3.0, -7.0]);
}

#[test]
fn test_pull_times_out_with_no_data() {
    let (outlet, config) = float_outlet("silent");
    let inlet = raw_inlet(&outlet, &config, BufferSize::default());
    inlet.open_stream(NETWORK_TIMEOUT).expect("open stream");

    let pulled = inlet.pull_sample::<f32>(Duration::from_millis(200)).expect("pull");

    assert!(pulled.is_none());
}

/// An outlet whose per-inlet buffer overflows hands a slow inlet only the
/// newest samples; the sequence gap keeps the dejittered timestamps on the
/// stream's regular grid.
#[test]
fn test_outlet_overflow_delivers_newest_samples_after_a_gap() {
    // Arrange
    let config = lab_config();
    let info = StreamInfo::new("backlog", "eeg", 1, 100.0, ChannelFormat::Float32, "backlog-src")
        .expect("descriptor");
    let options = OutletOptions {
        max_buffered: BufferSize::Samples(5),
        ..OutletOptions::default()
    };
    let outlet = StreamOutlet::with_config(info, options, config.clone()).expect("outlet");
    let inlet_options = InletOptions {
        processing: ProcessingFlags {
            dejitter: true,
            ..ProcessingFlags::NONE
        },
        ..InletOptions::default()
    };
    let inlet = StreamInlet::with_config(outlet.info().clone(), inlet_options, config)
        .expect("inlet");
    inlet.open_stream(NETWORK_TIMEOUT).expect("open stream");
    assert!(outlet.wait_for_consumers(NETWORK_TIMEOUT));
    outlet.push_sample_at(&[0.0f32], 1000.0, true).expect("push");
    let (first, _) = inlet
        .pull_sample::<f32>(NETWORK_TIMEOUT)
        .expect("pull")
        .expect("first sample before timeout");
    assert_eq!(first, vec![0.0]);

    // Act – one chunk of 20 lands in the 5-sample outlet queue at once
    let chunk: Vec<Vec<f32>> = (1..=20).map(|i| vec![i as f32]).collect();
    let timestamps: Vec<f64> = (1..=20).map(|i| 1000.0 + f64::from(i) * 0.01).collect();
    outlet
        .push_chunk_with_timestamps(&chunk, &timestamps, true)
        .expect("push chunk");

    // Assert
    for i in 16..=20 {
        let (values, timestamp) = inlet
            .pull_sample::<f32>(NETWORK_TIMEOUT)
            .expect("pull")
            .expect("sample before timeout");
        assert_eq!(values, vec![i as f32]);
        let expected = 1000.0 + f64::from(i) * 0.01;
        assert!(
            (timestamp - expected).abs() < 1e-3,
            "sample {i}: dejittered {timestamp}, sent {expected}"
        );
    }
    assert_eq!(inlet.samples_available(), 0);
}

/// `pull_chunk` does not wait for a feed it has only just opened.
#[test]
fn test_first_pull_chunk_returns_immediately() {
    let (outlet, config) = float_outlet("eager");
    let inlet = raw_inlet(&outlet, &config, BufferSize::default());
    let start = Instant::now();

    let (values, timestamps) = inlet.pull_chunk::<f32>().expect("pull chunk");

    assert!(values.is_empty());
    assert!(timestamps.is_empty());
    assert!(start.elapsed() < Duration::from_secs(1));
    drop(outlet);
}

// ── Time channel ──────────────────────────────────────────────────────────────

/// Outlet and inlet share a clock here, so the offset is about zero.
#[test]
fn test_time_correction_on_one_host_is_near_zero() {
    let (outlet, config) = float_outlet("clock");
    let inlet = raw_inlet(&outlet, &config, BufferSize::default());

    let estimate = inlet.time_correction_ex(NETWORK_TIMEOUT).expect("time correction");

    assert!(estimate.offset.abs() < 0.05, "offset {}", estimate.offset);
    assert!(estimate.uncertainty >= 0.0);
}

/// With clock correction on (the default), pulled timestamps stay within
/// the reported uncertainty of the pushed ones.
#[test]
fn test_corrected_timestamps_stay_within_uncertainty() {
    // Arrange
    let (outlet, config) = float_outlet("corrected");
    let inlet = StreamInlet::with_config(outlet.info().clone(), InletOptions::default(), config)
        .expect("inlet");
    let estimate = inlet.time_correction_ex(NETWORK_TIMEOUT).expect("time correction");
    inlet.open_stream(NETWORK_TIMEOUT).expect("open stream");

    // Act
    let pushed: Vec<f64> = (0..5).map(|i| 500.0 + f64::from(i) * 0.01).collect();
    for &timestamp in &pushed {
        outlet.push_sample_at(&[1.0f32, 2.0], timestamp, true).expect("push");
    }

    // Assert
    let mut previous = f64::MIN;
    for &sent in &pushed {
        let (_, corrected) = inlet
            .pull_sample::<f32>(NETWORK_TIMEOUT)
            .expect("pull")
            .expect("sample before timeout");
        assert!(
            (corrected - sent).abs() <= estimate.uncertainty + 0.005,
            "corrected {corrected} vs sent {sent} (uncertainty {})",
            estimate.uncertainty
        );
        assert!(corrected >= previous);
        previous = corrected;
    }
}

/// The very first corrected sample already carries the clock offset; no
/// explicit `time_correction` call is needed beforehand.
#[test]
fn test_first_pulled_sample_is_corrected_without_warm_up() {
    // Arrange
    let (outlet, config) = float_outlet("cold");
    let inlet = StreamInlet::with_config(outlet.info().clone(), InletOptions::default(), config)
        .expect("inlet");
    inlet.open_stream(NETWORK_TIMEOUT).expect("open stream");
    assert!(outlet.wait_for_consumers(NETWORK_TIMEOUT));

    // Act
    outlet.push_sample_at(&[1.0f32, 2.0], 500.0, true).expect("push");
    let (_, corrected) = inlet
        .pull_sample::<f32>(NETWORK_TIMEOUT)
        .expect("pull")
        .expect("sample before timeout");

    // Assert – the offset used is the one the inlet reports afterwards
    let estimate = inlet.time_correction_ex(Duration::from_millis(100)).expect("estimate");
    assert!(
        (corrected - (500.0 + estimate.offset)).abs() <= estimate.uncertainty + 0.005,
        "corrected {corrected} (offset {}, uncertainty {})",
        estimate.offset,
        estimate.uncertainty
    );
}

// ── Loss ──────────────────────────────────────────────────────────────────────

/// Dropping the outlet wakes a blocked pull with `ConnectionLost` well
/// before its timeout, and every later call fails the same way.
#[test]
fn test_dropping_outlet_fails_inlet_with_connection_lost() {
    // Arrange
    let (outlet, config) = float_outlet("doomed");
    let inlet = raw_inlet(&outlet, &config, BufferSize::default());
    inlet.open_stream(NETWORK_TIMEOUT).expect("open stream");
    let dropper = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(200));
        drop(outlet);
    });
    let start = Instant::now();

    // Act
    let pulled = inlet.pull_sample::<f32>(Duration::from_secs(30));

    // Assert
    dropper.join().expect("dropper panicked");
    assert!(matches!(pulled, Err(StreamError::ConnectionLost(_))), "{pulled:?}");
    assert!(start.elapsed() < Duration::from_secs(10));
    assert!(matches!(
        inlet.time_correction(NETWORK_TIMEOUT),
        Err(StreamError::ConnectionLost(_))
    ));
    assert!(matches!(inlet.info(NETWORK_TIMEOUT), Err(StreamError::ConnectionLost(_))));
}

/// A lazily opened, clock-corrected inlet blocked in `pull_sample` is woken
/// by the outlet going away, and `info` fails the same way afterwards.
#[test]
fn test_dropping_outlet_wakes_lazy_corrected_pull() {
    // Arrange
    let (outlet, config) = float_outlet("vanishing");
    let inlet = StreamInlet::with_config(outlet.info().clone(), InletOptions::default(), config)
        .expect("inlet");
    let dropper = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(300));
        drop(outlet);
    });
    let start = Instant::now();

    // Act
    let pulled = inlet.pull_sample::<f32>(Duration::from_secs(30));

    // Assert
    dropper.join().expect("dropper panicked");
    assert!(matches!(pulled, Err(StreamError::ConnectionLost(_))), "{pulled:?}");
    assert!(start.elapsed() < Duration::from_secs(10));
    assert!(inlet.is_lost());
    assert!(matches!(inlet.info(NETWORK_TIMEOUT), Err(StreamError::ConnectionLost(_))));
}
