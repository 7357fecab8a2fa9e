//! Bus listeners feeding the engine and the dispatch manager.

use std::{future::Future, sync::Arc};

use anyhow::Result;
use bytes::Bytes;
use data_model::messages::{subjects, DeaAdvertisement};
use message_bus::{Message, MessageBus, Subscription};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, warn};

use crate::{
    health_manager::HealthManager,
    placement::{pool::DeaPool, DispatchManager},
};

/// Drives `handler` with every message of `subscription` until shutdown.
fn spawn_listener<F, Fut>(
    mut subscription: Subscription,
    mut shutdown_rx: watch::Receiver<()>,
    mut handler: F,
) -> JoinHandle<()>
where
    F: FnMut(Message) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                message = subscription.next() => match message {
                    Some(message) => handler(message).await,
                    None => break,
                },
                _ = shutdown_rx.changed() => break,
            }
        }
        debug!(subject = %subscription.subject, "listener stopped");
    })
}

/// Subscribes every subject the process listens on. The subscriptions are
/// live when this returns.
pub async fn subscribe_all(
    bus: Arc<dyn MessageBus>,
    health_manager: Arc<HealthManager>,
    dispatch: Arc<DispatchManager>,
    pool: Arc<DeaPool>,
    shutdown_rx: watch::Receiver<()>,
) -> Result<Vec<JoinHandle<()>>> {
    let mut handles = Vec::new();

    let hm = health_manager.clone();
    handles.push(spawn_listener(
        bus.subscribe(subjects::DEA_HEARTBEAT).await?,
        shutdown_rx.clone(),
        move |message| {
            let hm = hm.clone();
            async move {
                hm.process_heartbeat_message(&message.payload).await;
            }
        },
    ));

    let hm = health_manager.clone();
    handles.push(spawn_listener(
        bus.subscribe(subjects::DEA_EXITED).await?,
        shutdown_rx.clone(),
        move |message| {
            let hm = hm.clone();
            async move {
                hm.process_exited_message(&message.payload).await;
            }
        },
    ));

    let hm = health_manager.clone();
    handles.push(spawn_listener(
        bus.subscribe(subjects::ACTIVE_APPS).await?,
        shutdown_rx.clone(),
        move |message| {
            let hm = hm.clone();
            async move {
                hm.process_active_apps_message(&message.payload).await;
            }
        },
    ));

    let hm = health_manager.clone();
    let responder = bus.clone();
    handles.push(spawn_listener(
        bus.subscribe(subjects::HEALTH_STATUS).await?,
        shutdown_rx.clone(),
        move |message| {
            let hm = hm.clone();
            let responder = responder.clone();
            async move {
                match hm.status_report(&message.payload).await {
                    Ok(reply) => {
                        if let Err(err) = responder.respond(&message, reply).await {
                            warn!("failed to answer status request: {:?}", err);
                        }
                    }
                    Err(err) => warn!("ignoring status request: {:?}", err),
                }
            }
        },
    ));

    handles.push(spawn_listener(
        bus.subscribe(subjects::DEA_ADVERTISE).await?,
        shutdown_rx.clone(),
        move |message| {
            let pool = pool.clone();
            async move {
                match serde_json::from_slice::<DeaAdvertisement>(&message.payload) {
                    Ok(advertisement) => pool.process_advertise_message(advertisement).await,
                    Err(err) => warn!("failed parsing dea advertisement: {:?}", err),
                }
            }
        },
    ));

    let requests_subject = subjects::health_requests(health_manager.settings().partition.get());
    handles.push(spawn_listener(
        bus.subscribe(&requests_subject).await?,
        shutdown_rx,
        move |message| {
            let dispatch = dispatch.clone();
            async move {
                // placement may wait on a broadcast, so each request runs on
                // its own task
                tokio::spawn(async move {
                    if let Err(err) = dispatch
                        .handle_health_request_message(&message.payload)
                        .await
                    {
                        error!("failed processing health request: {:?}", err);
                    }
                });
            }
        },
    ));

    // ask the hosts to advertise right away instead of waiting for their
    // next period
    bus.publish(subjects::DEA_LOCATE, Bytes::new()).await?;
    Ok(handles)
}
