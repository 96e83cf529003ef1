//! Circuit-breaker isolation for the time-series sink: a dead store trips
//! the breaker, later points are dropped without blocking, and a recovered
//! store closes it again via the probe.

use powerd::store::breaker::BreakerState;
use powerd::store::influx::{InfluxSettings, InfluxSink, Point};
use serial_test::serial;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Minimal HTTP stub: answers every request with 500 while `failing` is
/// set, 204 otherwise.
async fn spawn_stub_store(failing: Arc<AtomicBool>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let failing = failing.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                // One request per connection is enough for the client.
                let _ = socket.read(&mut buf).await;
                let response = if failing.load(Ordering::SeqCst) {
                    "HTTP/1.1 500 Internal Server Error\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                } else {
                    "HTTP/1.1 204 No Content\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                };
                let _ = socket.write_all(response.as_bytes()).await;
            });
        }
    });
    format!("http://{addr}")
}

fn point(value: f64) -> Point {
    Point::new("relay_power").tag("relay_id", "relay_1").field("voltage", value)
}

#[tokio::test]
#[serial]
async fn breaker_opens_after_consecutive_failures_and_drops_fast() {
    let failing = Arc::new(AtomicBool::new(true));
    let url = spawn_stub_store(failing.clone()).await;

    let sink = InfluxSink::new(InfluxSettings {
        url,
        org: "org".into(),
        bucket: "bucket".into(),
        token: "token".into(),
    })
    .with_batching(1, Duration::from_millis(50));
    let breaker = sink.breaker();
    let (handle, _task) = sink.spawn();

    // Five failed batch writes trip the breaker.
    for i in 0..5 {
        handle.push(point(f64::from(i)));
    }
    let deadline = Instant::now() + Duration::from_secs(5);
    while breaker.state() != BreakerState::Open && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(breaker.state(), BreakerState::Open);

    // With the breaker open, handing off a point is effectively free.
    let started = Instant::now();
    handle.push(point(99.0));
    assert!(started.elapsed() < Duration::from_millis(1));
}

#[tokio::test]
#[serial]
async fn successful_probe_closes_the_breaker() {
    let failing = Arc::new(AtomicBool::new(true));
    let url = spawn_stub_store(failing.clone()).await;

    let sink = InfluxSink::new(InfluxSettings {
        url,
        org: "org".into(),
        bucket: "bucket".into(),
        token: "token".into(),
    })
    .with_batching(1, Duration::from_millis(50))
    .with_breaker(5, Duration::from_millis(200));
    let breaker = sink.breaker();
    let (handle, _task) = sink.spawn();

    for i in 0..5 {
        handle.push(point(f64::from(i)));
    }
    let deadline = Instant::now() + Duration::from_secs(5);
    while breaker.state() != BreakerState::Open && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(breaker.state(), BreakerState::Open);

    // Store recovers; once the reset window elapses the next batch is the
    // probe and its success closes the breaker.
    failing.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(300)).await;
    handle.push(point(42.0));

    let deadline = Instant::now() + Duration::from_secs(5);
    while breaker.state() != BreakerState::Closed && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(breaker.state(), BreakerState::Closed);
}
