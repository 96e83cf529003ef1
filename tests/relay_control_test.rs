//! Tests for relay authority behavior under concurrency: polarity
//! translation, per-relay serialization, cross-relay parallelism and pulse
//! reversibility.

use powerd::config::RelayConfig;
use powerd::hardware::{Hardware, Level, MockHardware};
use powerd::relay::{Polarity, RelayAuthority, RelayState};
use std::sync::Arc;
use std::time::Duration;

fn relay(id: &str, line: u8, polarity: Polarity) -> RelayConfig {
    RelayConfig {
        id: id.to_string(),
        name: id.to_string(),
        gpio_line: line,
        polarity,
        enabled: true,
        pulse_time: 5,
        boot_state: None,
        schedule: None,
        dashboard: None,
    }
}

async fn authority(relays: &[RelayConfig]) -> (Arc<RelayAuthority>, Arc<MockHardware>) {
    let hw = Arc::new(MockHardware::new());
    let authority = Arc::new(RelayAuthority::new(hw.clone()));
    authority.apply_config(relays).await;
    (authority, hw)
}

#[tokio::test]
async fn turn_on_reads_back_logical_on_for_every_polarity() {
    let (authority, hw) = authority(&[
        relay("no", 17, Polarity::NormallyOpen),
        relay("nc", 22, Polarity::NormallyClosed),
    ])
    .await;

    for id in ["no", "nc"] {
        let outcome = authority.turn_on(id).await.unwrap();
        assert!(outcome.confirmed);
        assert_eq!(authority.get(id).await.unwrap(), RelayState::On);
    }
    // Underlying levels differ even though both read back logical ON.
    assert_eq!(hw.read_line(17).await.unwrap(), Level::High);
    assert_eq!(hw.read_line(22).await.unwrap(), Level::Low);

    for id in ["no", "nc"] {
        authority.turn_off(id).await.unwrap();
        assert_eq!(authority.get(id).await.unwrap(), RelayState::Off);
    }
}

#[tokio::test]
async fn concurrent_commands_against_one_relay_serialize() {
    let (authority, hw) = authority(&[relay("r", 4, Polarity::NormallyOpen)]).await;

    let mut tasks = Vec::new();
    for client in 0..4u32 {
        let authority = authority.clone();
        tasks.push(tokio::spawn(async move {
            for i in 0..25u32 {
                if (client + i) % 2 == 0 {
                    authority.turn_on("r").await.unwrap();
                } else {
                    authority.turn_off("r").await.unwrap();
                }
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    // Whatever interleaving the gate chose, cache and hardware agree.
    let cached = authority.state_cache().get("r").map(|s| *s).unwrap();
    let hardware_level = hw.read_line(4).await.unwrap();
    assert_eq!(Polarity::NormallyOpen.state_for(hardware_level), cached);
    // And every write that happened was a full, ordered transition.
    assert_eq!(hw.line_writes().iter().filter(|w| w.line == 4).count(), 100);
}

#[tokio::test(start_paused = true)]
async fn pulses_on_distinct_relays_run_in_parallel() {
    let (authority, _hw) = authority(&[
        relay("a", 4, Polarity::NormallyOpen),
        relay("b", 24, Polarity::NormallyOpen),
    ])
    .await;

    authority.pulse("a", Some(2)).await.unwrap();
    authority.pulse("b", Some(2)).await.unwrap();
    assert_eq!(authority.get("a").await.unwrap(), RelayState::On);
    assert_eq!(authority.get("b").await.unwrap(), RelayState::On);

    // Both restores land after ~2 s, not 4: the gates are independent.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(authority.get("a").await.unwrap(), RelayState::Off);
    assert_eq!(authority.get("b").await.unwrap(), RelayState::Off);
}

#[tokio::test(start_paused = true)]
async fn pulse_is_reversible_for_both_initial_states() {
    let (authority, _hw) = authority(&[relay("r", 17, Polarity::NormallyClosed)]).await;

    // From OFF.
    let outcome = authority.pulse("r", Some(5)).await.unwrap();
    assert_eq!(outcome.initial_state, RelayState::Off);
    assert_eq!(outcome.duration, 5);
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(authority.get("r").await.unwrap(), RelayState::Off);

    // From ON.
    authority.turn_on("r").await.unwrap();
    let outcome = authority.pulse("r", Some(5)).await.unwrap();
    assert_eq!(outcome.initial_state, RelayState::On);
    assert_eq!(authority.get("r").await.unwrap(), RelayState::Off);
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(authority.get("r").await.unwrap(), RelayState::On);
}

#[tokio::test(start_paused = true)]
async fn pulse_uses_configured_duration_by_default() {
    let mut cfg = relay("r", 17, Polarity::NormallyOpen);
    cfg.pulse_time = 3;
    let (authority, _hw) = authority(&[cfg]).await;

    let outcome = authority.pulse("r", None).await.unwrap();
    assert_eq!(outcome.duration, 3);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(authority.get("r").await.unwrap(), RelayState::On);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(authority.get("r").await.unwrap(), RelayState::Off);
}
