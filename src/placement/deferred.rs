use std::{future::Future, time::Duration};

use data_model::{AppId, DesiredAppState};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::desired_state::DesiredStateStore;

/// Re-reads the app every `poll_interval` and hands it to `operation` until the
/// operation reports it is done, the app disappears, or `time_limit` passes.
/// Returns the time spent.
pub async fn perform_deferred_app_operation<F, Fut>(
    store: &dyn DesiredStateStore,
    app_id: &AppId,
    poll_interval: Duration,
    time_limit: Duration,
    mut operation: F,
) -> Duration
where
    F: FnMut(DesiredAppState) -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    let mut elapsed = Duration::ZERO;
    let mut done = false;
    while !done && elapsed <= time_limit {
        let app = match store.get_app(app_id).await {
            Ok(Some(app)) => app,
            Ok(None) => {
                debug!(app_id = app_id.get(), "app is gone, abandoning deferred operation");
                break;
            }
            Err(err) => {
                warn!(
                    app_id = app_id.get(),
                    "failed to read app for deferred operation: {:?}", err
                );
                break;
            }
        };
        done = operation(app).await;
        elapsed = start.elapsed();
        if !done {
            tokio::time::sleep(poll_interval).await;
        }
    }
    elapsed
}

/// Runs `block` once the app's staging finished, successfully or not.
///
/// Returns the time spent waiting; `block` is not run if the app disappears or
/// staging takes longer than `time_limit`.
pub async fn once_app_is_staged<F, Fut>(
    store: &dyn DesiredStateStore,
    app_id: &AppId,
    poll_interval: Duration,
    time_limit: Duration,
    block: F,
) -> Duration
where
    F: FnOnce(DesiredAppState) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut block = Some(block);
    perform_deferred_app_operation(store, app_id, poll_interval, time_limit, |app| {
        let ready = if app.is_staged() || app.staging_failed() {
            block.take()
        } else {
            None
        };
        async move {
            match ready {
                Some(block) => {
                    block(app).await;
                    true
                }
                None => false,
            }
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use data_model::{test_objects::tests::mock_app, PackageState};

    use super::*;
    use crate::desired_state::InMemoryDesiredStateStore;

    #[tokio::test]
    async fn test_waits_for_staging_then_runs_once() {
        tokio::time::pause();
        let store = Arc::new(InMemoryDesiredStateStore::default());
        let mut app = mock_app("1", 2);
        app.package_state = PackageState::Pending;
        store.upsert(app.clone()).await;

        let runs = Arc::new(AtomicUsize::new(0));
        let task = {
            let store = store.clone();
            let runs = runs.clone();
            let app_id = app.app_id.clone();
            tokio::spawn(async move {
                once_app_is_staged(
                    store.as_ref(),
                    &app_id,
                    Duration::from_millis(500),
                    Duration::from_secs(360),
                    |app| async move {
                        assert!(app.is_staged());
                        runs.fetch_add(1, Ordering::SeqCst);
                    },
                )
                .await
            })
        };

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        app.package_state = PackageState::Staged;
        store.upsert(app).await;
        let elapsed = task.await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(elapsed >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_gives_up_after_time_limit() {
        tokio::time::pause();
        let store = InMemoryDesiredStateStore::default();
        let mut app = mock_app("1", 1);
        app.package_state = PackageState::Pending;
        store.upsert(app.clone()).await;

        let mut ran = false;
        let elapsed = once_app_is_staged(
            &store,
            &app.app_id,
            Duration::from_millis(500),
            Duration::from_secs(3),
            |_| {
                ran = true;
                async {}
            },
        )
        .await;
        assert!(!ran);
        assert!(elapsed > Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_gives_up_when_app_disappears() {
        let store = InMemoryDesiredStateStore::default();
        let mut ran = false;
        let elapsed = once_app_is_staged(
            &store,
            &AppId::from("missing"),
            Duration::from_millis(500),
            Duration::from_secs(3),
            |_| {
                ran = true;
                async {}
            },
        )
        .await;
        assert!(!ran);
        assert_eq!(elapsed, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_failed_staging_still_runs_block() {
        let store = InMemoryDesiredStateStore::default();
        let mut app = mock_app("1", 1);
        app.package_state = PackageState::Failed;
        store.upsert(app.clone()).await;

        let mut seen = None;
        once_app_is_staged(
            &store,
            &app.app_id,
            Duration::from_millis(500),
            Duration::from_secs(3),
            |app| {
                seen = Some(app.package_state);
                async {}
            },
        )
        .await;
        assert_eq!(seen, Some(PackageState::Failed));
    }
}
