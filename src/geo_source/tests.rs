use super::*;
use tokio::sync::mpsc;
use tokio::time::sleep;

fn sample(accuracy: f64) -> PositionSample {
    PositionSample {
        coords: Coordinates::new(9.3068, 123.3033),
        accuracy,
        speed: None,
        heading: None,
        taken_at: Utc::now(),
    }
}

fn feed_later(source: &GeoPositionSource, steps: Vec<(u64, DeviceReading)>) {
    let source = source.clone();
    tokio::spawn(async move {
        for (delay, reading) in steps {
            sleep(Duration::from_secs(delay)).await;
            source.feed(reading);
        }
    });
}

#[tokio::test(start_paused = true)]
async fn high_confidence_resolves_on_first_accurate_sample() {
    let source = GeoPositionSource::new(100.0);
    feed_later(&source, vec![(2, Ok(sample(45.0))), (2, Ok(sample(20.0)))]);

    let started = Instant::now();
    let fix = source
        .current_position(FixPolicy::HighConfidence {
            target_accuracy: 30.0,
            timeout: Duration::from_secs(12),
        })
        .await;

    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(4) && waited < Duration::from_secs(5));
    assert_eq!(fix.sample().map(|s| s.accuracy), Some(20.0));
}

#[tokio::test(start_paused = true)]
async fn high_confidence_falls_back_to_best_seen() {
    let source = GeoPositionSource::new(100.0);
    feed_later(&source, vec![(1, Ok(sample(80.0))), (1, Ok(sample(45.0))), (1, Ok(sample(60.0)))]);

    let started = Instant::now();
    let fix = source
        .current_position(FixPolicy::HighConfidence {
            target_accuracy: 30.0,
            timeout: Duration::from_secs(12),
        })
        .await;

    assert!(started.elapsed() >= Duration::from_secs(12));
    assert_eq!(fix.sample().map(|s| s.accuracy), Some(45.0));
}

#[tokio::test(start_paused = true)]
async fn best_effort_without_samples_is_unavailable() {
    let source = GeoPositionSource::new(100.0);
    feed_later(
        &source,
        vec![(1, Err(PlatformError::PermissionDenied)), (1, Err(PlatformError::Timeout))],
    );

    let fix = source
        .current_position(FixPolicy::BestEffort {
            timeout: Duration::from_secs(5),
        })
        .await;
    assert_eq!(fix, Fix::Unavailable);
}

#[tokio::test(start_paused = true)]
async fn best_effort_keeps_the_most_accurate_sample() {
    let source = GeoPositionSource::new(100.0);
    feed_later(&source, vec![(1, Ok(sample(12.0))), (1, Ok(sample(40.0)))]);

    let fix = source
        .current_position(FixPolicy::BestEffort {
            timeout: Duration::from_secs(5),
        })
        .await;
    assert_eq!(fix.sample().map(|s| s.accuracy), Some(12.0));
}

#[tokio::test(start_paused = true)]
async fn watch_drops_noise_and_stops_for_good() {
    let source = GeoPositionSource::new(100.0);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut handle = source.watch(move |sample| {
        let _ = tx.send(sample.accuracy);
    });
    tokio::task::yield_now().await;

    source.feed(Ok(sample(150.0)));
    source.feed(Err(PlatformError::PositionUnavailable));
    source.feed(Ok(sample(20.0)));
    assert_eq!(rx.recv().await, Some(20.0));

    handle.stop();
    handle.stop();
    GeoPositionSource::stop(None);
    assert!(!handle.is_active());

    source.feed(Ok(sample(10.0)));
    sleep(Duration::from_millis(10)).await;
    assert!(rx.try_recv().is_err());
}

#[test]
fn haversine_matches_known_distance() {
    // Dumaguete center to Sibulan airport, about 3 km
    let city = Coordinates::new(9.3068, 123.3033);
    let airport = Coordinates::new(9.3337, 123.3002);
    let km = haversine_km(city, airport);
    assert!(km > 2.5 && km < 3.5, "got {}", km);
}
