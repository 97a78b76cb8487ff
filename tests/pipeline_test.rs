use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;
use tokio_test::assert_ok;

use sensorhub_ingest::{
    parser::{Parser, TemperatureBounds},
    pipeline::{self, Ingestor, Outcome, PipelineStats},
    queue::{Delivery, DeliveryQueue},
    scheduler::{IntervalScheduler, Intervals, SamplingMode},
    store::Store,
};

// ---

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 26, 18, 45, 0).unwrap()
}

fn message(hub: u32, sensor: u32, offset_secs: i64, humidity: f64) -> Delivery {
    // ---
    let body = json!({
        "sensor_id": format!("S-{sensor}"),
        "hub_id": format!("H-{hub}"),
        "temp": 21.5,
        "humidity": humidity,
        "moisture": 40.0,
        "date": {
            "year": 2025, "month": 3, "day": 26,
            "hour": 18,
            "minute": 45 + offset_secs / 60,
            "second": offset_secs % 60
        }
    });
    Delivery::new(format!("topic/sensor/H-{hub}/S-{sensor}"), body.to_string())
}

async fn ingestor_on(store: Store) -> Result<Arc<Ingestor>> {
    // ---
    let ingestor = Ingestor::open(
        store,
        Parser::new("topic/sensor", TemperatureBounds::default()),
        IntervalScheduler::new(Intervals::default(), SamplingMode::Testing),
        Arc::new(PipelineStats::default()),
    )
    .await?;
    Ok(Arc::new(ingestor))
}

async fn ingestor() -> Result<Arc<Ingestor>> {
    ingestor_on(Store::open_in_memory().await?).await
}

#[tokio::test]
async fn five_seconds_deferred_twelve_seconds_admitted() -> Result<()> {
    // ---
    let ing = ingestor().await?;

    assert_eq!(ing.ingest(&message(0, 0, 0, 50.0)).await, Outcome::Stored);
    assert_eq!(ing.ingest(&message(0, 0, 5, 50.0)).await, Outcome::Deferred);
    assert_eq!(ing.ingest(&message(0, 0, 12, 50.0)).await, Outcome::Stored);

    let stored = ing
        .store()
        .query_range("H-0", "S-0", t0(), t0() + Duration::minutes(1))
        .await?;
    let times: Vec<_> = stored.iter().map(|r| r.observed_at).collect();
    assert_eq!(times, vec![t0(), t0() + Duration::seconds(12)]);
    Ok(())
}

#[tokio::test]
async fn identity_is_stable_across_messages() -> Result<()> {
    // ---
    let ing = ingestor().await?;

    ing.ingest(&message(0, 0, 0, 50.0)).await;
    ing.ingest(&message(0, 0, 30, 50.0)).await;
    ing.ingest(&message(1, 0, 0, 50.0)).await;

    let first = ing.resolver().resolve("H-0", "S-0").await?;
    let again = ing.resolver().resolve("H-0", "S-0").await?;
    assert!(Arc::ptr_eq(&first, &again));

    let sensors = ing.store().list_sensors().await?;
    assert_eq!(sensors.len(), 2, "S-0 under H-0 and H-1 are distinct");
    assert_eq!(ing.store().list_hubs().await?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn malformed_message_never_reaches_storage() -> Result<()> {
    // ---
    let ing = ingestor().await?;

    assert_eq!(ing.ingest(&message(0, 0, 0, 150.0)).await, Outcome::Rejected);
    assert_eq!(
        ing.ingest(&Delivery::new("topic/sensor/H-0/S-0", "{not json")).await,
        Outcome::Rejected
    );
    assert_eq!(
        ing.ingest(&Delivery::new("topic/sensor/H-0", "{}")).await,
        Outcome::Rejected
    );
    assert_eq!(ing.ingest(&message(0, 0, 1, 55.0)).await, Outcome::Stored);

    assert_eq!(ing.store().count_readings().await?, 1);
    let stats = ing.stats().snapshot();
    assert_eq!(stats.rejected, 3);
    assert_eq!(stats.stored, 1);
    Ok(())
}

#[tokio::test]
async fn query_range_returns_exactly_the_window() -> Result<()> {
    // ---
    let ing = ingestor().await?;

    for offset in [0, 10, 20, 30, 40] {
        assert_eq!(ing.ingest(&message(0, 1, offset, 50.0)).await, Outcome::Stored);
    }

    let window = ing
        .store()
        .query_range(
            "H-0",
            "S-1",
            t0() + Duration::seconds(10),
            t0() + Duration::seconds(30),
        )
        .await?;
    assert_eq!(window.len(), 3);
    assert!(window.windows(2).all(|w| w[0].observed_at < w[1].observed_at));
    assert_eq!(window[0].observed_at, t0() + Duration::seconds(10));

    let nothing = ing
        .store()
        .query_range("H-0", "S-9", t0(), t0() + Duration::hours(1))
        .await?;
    assert!(nothing.is_empty());
    Ok(())
}

#[tokio::test]
async fn redelivery_after_reconnect_does_not_double_count() -> Result<()> {
    // ---
    let dir = tempfile::tempdir()?;
    let url = format!("sqlite://{}", dir.path().join("db/node_data.db").display());

    {
        let store = Store::open(&url, 2).await?;
        let ing = ingestor_on(store.clone()).await?;
        assert_eq!(ing.ingest(&message(0, 0, 0, 50.0)).await, Outcome::Stored);

        // Same process, state for the sensor lost mid-flight: upsert absorbs it.
        ing.scheduler().clear();
        assert_eq!(ing.ingest(&message(0, 0, 0, 51.0)).await, Outcome::Stored);
        assert_eq!(store.count_readings().await?, 1);
        store.close().await;
    }

    // Restart: identities and last-accepted timestamps are rehydrated.
    let store = Store::open(&url, 2).await?;
    let ing = ingestor_on(store.clone()).await?;
    assert_eq!(ing.resolver().sensors().await.len(), 1);
    assert_eq!(ing.ingest(&message(0, 0, 0, 52.0)).await, Outcome::Deferred);
    assert_eq!(ing.ingest(&message(0, 0, 10, 50.0)).await, Outcome::Stored);

    assert_eq!(store.count_readings().await?, 2);
    let first = store.query_range("H-0", "S-0", t0(), t0()).await?;
    assert_eq!(first[0].humidity, 51.0, "latest values win");
    Ok(())
}

#[tokio::test]
async fn storage_failure_does_not_advance_interval() -> Result<()> {
    // ---
    let ing = ingestor().await?;
    assert_eq!(ing.ingest(&message(0, 0, 0, 50.0)).await, Outcome::Stored);
    let identity = ing.resolver().resolve("H-0", "S-0").await?;

    ing.store().close().await;
    assert!(ing.store().is_closed());
    assert_eq!(ing.ingest(&message(0, 0, 20, 50.0)).await, Outcome::Failed);

    let state = ing.scheduler().state_of(&identity).expect("state exists");
    assert_eq!(state.last_accepted_at, Some(t0()));
    assert_eq!(ing.stats().snapshot().storage_errors, 1);
    Ok(())
}

#[tokio::test]
async fn mode_switch_applies_without_restart() -> Result<()> {
    // ---
    let ing = ingestor().await?;

    assert_eq!(ing.ingest(&message(0, 0, 0, 50.0)).await, Outcome::Stored);
    ing.scheduler().set_mode(SamplingMode::Normal);
    assert_eq!(ing.ingest(&message(0, 0, 12, 50.0)).await, Outcome::Deferred);

    ing.scheduler().set_mode(SamplingMode::Testing);
    assert_eq!(ing.ingest(&message(0, 0, 24, 50.0)).await, Outcome::Stored);

    // Earlier rows are untouched by either switch
    assert_eq!(ing.store().count_readings().await?, 2);
    Ok(())
}

#[tokio::test]
async fn reset_command_recreates_storage() -> Result<()> {
    // ---
    let ing = ingestor().await?;
    assert_eq!(ing.ingest(&message(0, 0, 0, 50.0)).await, Outcome::Stored);

    assert_ok!(ing.reset_storage().await);

    assert_eq!(ing.store().count_readings().await?, 0);
    assert!(ing.store().list_sensors().await?.is_empty());
    assert!(ing.resolver().sensors().await.is_empty());

    // Same reading is new again after the reset
    assert_eq!(ing.ingest(&message(0, 0, 0, 50.0)).await, Outcome::Stored);
    assert_eq!(ing.store().count_readings().await?, 1);
    Ok(())
}

#[tokio::test]
async fn worker_pool_keeps_per_sensor_order() -> Result<()> {
    // ---
    let dir = tempfile::tempdir()?;
    let url = format!("sqlite://{}", dir.path().join("pool.db").display());
    let store = Store::open(&url, 4).await?;
    let ing = ingestor_on(store.clone()).await?;

    let queue = Arc::new(DeliveryQueue::new(1024));
    // Interleave 2 hubs x 3 sensors x 10 readings, 10s apart per sensor.
    for step in 0..10 {
        for hub in 0..2 {
            for sensor in 0..3 {
                queue.push(message(hub, sensor, step * 10, 50.0));
            }
        }
    }
    queue.close();

    let handle = pipeline::spawn(ing.clone(), queue, 4);
    handle.drain().await;

    // Any reordering within a sensor would have turned a reading into a Defer.
    let stats = ing.stats().snapshot();
    assert_eq!(stats.stored, 60);
    assert_eq!(stats.deferred, 0);
    assert_eq!(store.count_readings().await?, 60);

    for hub in 0..2 {
        for sensor in 0..3 {
            let rows = store
                .query_range(
                    &format!("H-{hub}"),
                    &format!("S-{sensor}"),
                    t0(),
                    t0() + Duration::hours(1),
                )
                .await?;
            assert_eq!(rows.len(), 10);
        }
    }
    Ok(())
}

/// A reading whose temperature names its hub, so misfiled rows stand out.
fn tagged(hub: u32, offset_secs: i64) -> Delivery {
    // ---
    let body = json!({
        "temp": (hub * 10) as f64,
        "humidity": 50.0,
        "moisture": 40.0,
        "date": {
            "year": 2025, "month": 3, "day": 26,
            "hour": 18,
            "minute": 45 + offset_secs / 60,
            "second": offset_secs % 60
        }
    });
    Delivery::new(format!("topic/sensor/H-{hub}/S-{hub}"), body.to_string())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reset_while_messages_are_in_flight_keeps_sensors_apart() -> Result<()> {
    // ---
    let ing = ingestor().await?;

    let feed = |hub: u32| {
        let ing = ing.clone();
        tokio::spawn(async move {
            for step in 0..40 {
                ing.ingest(&tagged(hub, step * 10)).await;
                tokio::task::yield_now().await;
            }
        })
    };
    let first = feed(0);
    let second = feed(7);

    for _ in 0..5 {
        ing.reset_storage().await?;
        tokio::task::yield_now().await;
    }
    first.await?;
    second.await?;

    // No append went through an identity that a reset had already dropped.
    assert_eq!(ing.stats().snapshot().storage_errors, 0);

    for hub in [0u32, 7] {
        let rows = ing
            .store()
            .query_range(
                &format!("H-{hub}"),
                &format!("S-{hub}"),
                t0(),
                t0() + Duration::hours(1),
            )
            .await?;
        assert!(
            rows.iter().all(|r| r.temperature == (hub * 10) as f64),
            "H-{hub}/S-{hub} holds another sensor's readings: {rows:?}"
        );
    }

    let keys: Vec<i64> = ing.store().list_sensors().await?.iter().map(|s| s.key).collect();
    let cached: Vec<i64> = ing.resolver().sensors().await.iter().map(|s| s.key).collect();
    assert_eq!(keys, cached);
    Ok(())
}
