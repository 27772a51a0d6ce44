//! Dispatch of container lifecycle events and periodic timers.
//!
//! Each event is handled on its own task so a slow registry never holds
//! up the consumer.  Dispatched tasks report failures only through logs.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::bridge::Bridge;
use crate::config::Config;
use crate::types::{short_id, EventAction, LifecycleEvent};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventLoopError {
    #[error("Docker event loop closed")]
    StreamClosed,
}

pub struct EventLoop {
    bridge: Arc<Bridge>,
    config: Arc<Config>,
    tasks: TaskTracker,
}

impl EventLoop {
    pub fn new(bridge: Arc<Bridge>, config: Arc<Config>) -> Self {
        Self {
            bridge,
            config,
            tasks: TaskTracker::new(),
        }
    }

    /// Consumes events until `shutdown` fires or the stream ends.
    ///
    /// Either way the timers are stopped and in-flight dispatches are
    /// awaited before returning.  A closed stream is an error.
    pub async fn run(
        self,
        mut events: mpsc::Receiver<LifecycleEvent>,
        shutdown: CancellationToken,
    ) -> Result<(), EventLoopError> {
        let timers = shutdown.child_token();
        if let Some(period) = self.config.refresh_period() {
            self.spawn_timer("refresh", period, timers.clone(), |bridge| async move {
                bridge.refresh().await;
            });
        }
        if let Some(period) = self.config.resync_period() {
            self.spawn_timer("resync", period, timers.clone(), |bridge| async move {
                if let Err(e) = bridge.sync(true).await {
                    warn!("resync failed: {}", e);
                }
            });
        }

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, stopping event loop");
                    break Ok(());
                }
                event = events.recv() => match event {
                    Some(event) => self.dispatch(event),
                    None => {
                        error!("Docker event loop closed");
                        break Err(EventLoopError::StreamClosed);
                    }
                },
            }
        };

        timers.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        result
    }

    fn dispatch(&self, event: LifecycleEvent) {
        let LifecycleEvent {
            container_id,
            action,
        } = event;
        match action {
            EventAction::Start | EventAction::Unpause => {
                let bridge = Arc::clone(&self.bridge);
                self.tasks.spawn(async move {
                    if let Err(e) = bridge.add(&container_id).await {
                        warn!("{}: add failed: {}", short_id(&container_id), e);
                    }
                });
            }
            EventAction::Die => self.spawn_remove(container_id),
            EventAction::Kill if self.config.deregister_on_stop => {
                self.spawn_remove(container_id)
            }
            EventAction::Kill => debug!("{}: kill, waiting for die", short_id(&container_id)),
            EventAction::Other(action) => {
                debug!("{}: ignoring {}", short_id(&container_id), action)
            }
        }
    }

    fn spawn_remove(&self, container_id: String) {
        let bridge = Arc::clone(&self.bridge);
        self.tasks.spawn(async move {
            if let Err(e) = bridge.remove_on_exit(&container_id).await {
                warn!("{}: remove failed: {}", short_id(&container_id), e);
            }
        });
    }

    fn spawn_timer<F, Fut>(
        &self,
        name: &'static str,
        period: Duration,
        stop: CancellationToken,
        tick: F,
    ) where
        F: Fn(Arc<Bridge>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let bridge = Arc::clone(&self.bridge);
        self.tasks.spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!("{} timer armed every {:?}", name, period);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => tick(Arc::clone(&bridge)).await,
                }
            }
            debug!("{} timer stopped", name);
        });
    }
}
