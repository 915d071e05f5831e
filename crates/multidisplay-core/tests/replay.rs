use multidisplay_core::config::EngineConfig;
use multidisplay_core::datalog::{DataStore, ReplayEngine, ReplayError, ReplayStatus};
use multidisplay_core::engine::Engine;
use multidisplay_core::protocol::DataSample;
use multidisplay_core::sink::{EngineEvent, Origin, RecordSink};
use pretty_assertions::assert_eq;
use std::sync::{Arc, Barrier};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

fn source(timestamps: &[u32]) -> Vec<Arc<DataSample>> {
    timestamps
        .iter()
        .map(|&ts| Arc::new(DataSample::new(ts, vec![ts as f64])))
        .collect()
}

fn replay_engine() -> (ReplayEngine, Arc<DataStore>, broadcast::Receiver<EngineEvent>) {
    let store = Arc::new(DataStore::new());
    let sink = RecordSink::new(Arc::clone(&store), 256);
    let events = sink.subscribe();
    (ReplayEngine::new(sink), store, events)
}

/// Next replayed sample timestamp, skipping status events
async fn next_sample(events: &mut broadcast::Receiver<EngineEvent>) -> Option<u32> {
    loop {
        match events.recv().await.ok()? {
            EngineEvent::Sample { sample, origin } => {
                assert_eq!(origin, Origin::Replay);
                return Some(sample.timestamp_ms);
            }
            EngineEvent::Replay(ReplayStatus::Idle) => return None,
            _ => {}
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_delay_is_scaled_by_speed() {
    let (replay, _store, mut events) = replay_engine();
    let started = Instant::now();
    replay.start(source(&[0, 1000]), 0, 2.0).unwrap();

    assert_eq!(next_sample(&mut events).await, Some(0));
    assert!(started.elapsed() < Duration::from_millis(10));

    assert_eq!(next_sample(&mut events).await, Some(1000));
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(500) && elapsed < Duration::from_millis(510),
        "elapsed {:?}",
        elapsed
    );

    assert_eq!(next_sample(&mut events).await, None);
    replay.finished().await;
    assert_eq!(replay.status(), ReplayStatus::Idle);
    assert_eq!(replay.position(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_pause_holds_delivery_without_skipping() {
    let (replay, _store, mut events) = replay_engine();
    replay.start(source(&[0, 1000, 2000]), 0, 1.0).unwrap();

    assert_eq!(next_sample(&mut events).await, Some(0));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(replay.pause());
    assert_eq!(replay.status(), ReplayStatus::Paused);

    // Well past the next record's due time
    tokio::time::sleep(Duration::from_secs(5)).await;
    loop {
        match events.try_recv() {
            Ok(EngineEvent::Sample { .. }) => panic!("sample delivered while paused"),
            Ok(_) => continue,
            Err(_) => break,
        }
    }
    assert_eq!(replay.position(), 1);

    assert!(replay.resume());
    assert_eq!(next_sample(&mut events).await, Some(1000));
    assert_eq!(next_sample(&mut events).await, Some(2000));
    assert_eq!(next_sample(&mut events).await, None);
}

#[tokio::test(start_paused = true)]
async fn test_stop_cancels_pending_wait() {
    let (replay, _store, mut events) = replay_engine();
    replay.start(source(&[0, 60_000]), 0, 1.0).unwrap();
    assert_eq!(next_sample(&mut events).await, Some(0));

    let stopped_at = Instant::now();
    replay.stop();
    replay.finished().await;

    assert!(stopped_at.elapsed() < Duration::from_secs(1));
    assert_eq!(replay.status(), ReplayStatus::Idle);
    assert_eq!(replay.position(), 1);
    assert_eq!(next_sample(&mut events).await, None);
}

#[tokio::test(start_paused = true)]
async fn test_transitions_are_published() {
    let (replay, _store, mut events) = replay_engine();
    replay.start(source(&[0]), 0, 1.0).unwrap();
    replay.finished().await;

    let mut statuses = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::Replay(status) = event {
            statuses.push(status);
        }
    }
    assert_eq!(
        statuses,
        vec![ReplayStatus::Playing, ReplayStatus::Stopped, ReplayStatus::Idle]
    );
}

#[tokio::test(start_paused = true)]
async fn test_replay_does_not_record_samples() {
    let (replay, store, _events) = replay_engine();
    replay.start(source(&[0, 10, 20]), 1, 1.0).unwrap();
    replay.finished().await;
    assert!(store.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_speed_change_applies_to_next_delay() {
    let (replay, _store, mut events) = replay_engine();
    let started = Instant::now();
    replay.start(source(&[0, 1000, 2000]), 0, 1.0).unwrap();

    // The wait for 1000 is already running at 1x; only the one after it speeds up
    assert_eq!(next_sample(&mut events).await, Some(0));
    replay.set_speed(4.0).unwrap();
    assert_eq!(next_sample(&mut events).await, Some(1000));
    assert_eq!(next_sample(&mut events).await, Some(2000));

    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(1250) && elapsed < Duration::from_millis(1260),
        "elapsed {:?}",
        elapsed
    );
}

#[tokio::test]
async fn test_only_one_replay_at_a_time() {
    let (replay, _store, _events) = replay_engine();
    replay.start(source(&[0, 60_000]), 0, 1.0).unwrap();
    assert_eq!(
        replay.start(source(&[0]), 0, 1.0),
        Err(ReplayError::AlreadyActive)
    );
    replay.stop();
    replay.finished().await;
    replay.start(source(&[0]), 0, 1.0).unwrap();
    replay.finished().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_starts_admit_one_replay() {
    for _ in 0..200 {
        let (replay, _store, _events) = replay_engine();
        let replay = Arc::new(replay);
        let barrier = Arc::new(Barrier::new(2));

        let starters: Vec<_> = (0..2)
            .map(|_| {
                let replay = Arc::clone(&replay);
                let barrier = Arc::clone(&barrier);
                tokio::task::spawn_blocking(move || {
                    barrier.wait();
                    replay.start(source(&[0, 60_000]), 0, 1.0)
                })
            })
            .collect();

        let mut results = Vec::new();
        for starter in starters {
            results.push(starter.await.unwrap());
        }
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.contains(&Err(ReplayError::AlreadyActive)));

        replay.stop();
        tokio::time::timeout(Duration::from_secs(5), replay.finished())
            .await
            .expect("replay did not wind down after stop");
        assert_eq!(replay.status(), ReplayStatus::Idle);
    }
}

#[tokio::test(start_paused = true)]
async fn test_engine_replays_from_window() {
    let mut engine = Engine::new(EngineConfig {
        window_size: 10,
        replay_speed: 10.0,
        ..Default::default()
    });
    for ts in 0..100u32 {
        engine.store().append(DataSample::new(ts * 100, vec![]));
    }
    engine.store().resize_window(10);
    engine.store().mark_to_end();
    let mut events = engine.subscribe();

    engine.start_replay(true).unwrap();
    assert_eq!(next_sample(&mut events).await, Some(9000));
    engine.replay().finished().await;
    assert_eq!(engine.replay().position(), 100);
    assert_eq!(engine.store().len(), 100);
}

#[tokio::test]
async fn test_engine_replay_of_empty_store() {
    let mut engine = Engine::new(EngineConfig::default());
    assert_eq!(engine.start_replay(false), Err(ReplayError::EmptySource));
}
