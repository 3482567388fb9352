//! Entry point from the persistence layer into webhook delivery.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::DispatchMode;
use crate::entities::WatchedEntity;
use crate::executor::DeliveryExecutor;
use crate::payload::{self, EventKind};
use crate::pool::DispatchPool;
use crate::resolver::{self, SubscriptionSource};

#[derive(Debug)]
struct SwitchState {
    enabled: AtomicBool,
    suspended: AtomicUsize,
}

/// Process-wide "webhook processing enabled" toggle.
///
/// Processing runs only while the switch is on and no [`SuspendGuard`] is
/// alive. Guards nest and may be dropped in any order.
#[derive(Debug, Clone)]
pub struct ProcessingSwitch(Arc<SwitchState>);

impl ProcessingSwitch {
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(SwitchState {
            enabled: AtomicBool::new(enabled),
            suspended: AtomicUsize::new(0),
        }))
    }

    pub fn is_enabled(&self) -> bool {
        self.0.enabled.load(Ordering::Acquire) && self.0.suspended.load(Ordering::Acquire) == 0
    }

    /// Operator setting. Outstanding suspensions still apply.
    pub fn set(&self, enabled: bool) {
        self.0.enabled.store(enabled, Ordering::Release);
    }

    /// Disable processing until the returned guard is dropped, e.g. for a
    /// bulk load.
    pub fn suspend(&self) -> SuspendGuard {
        self.0.suspended.fetch_add(1, Ordering::AcqRel);
        SuspendGuard(self.clone())
    }
}

pub struct SuspendGuard(ProcessingSwitch);

impl Drop for SuspendGuard {
    fn drop(&mut self) {
        (self.0).0.suspended.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct EventTrigger {
    source: Arc<dyn SubscriptionSource>,
    executor: Arc<DeliveryExecutor>,
    pool: DispatchPool,
    switch: ProcessingSwitch,
}

impl EventTrigger {
    pub fn new(
        source: Arc<dyn SubscriptionSource>,
        executor: Arc<DeliveryExecutor>,
        pool: DispatchPool,
        switch: ProcessingSwitch,
    ) -> Self {
        Self {
            source,
            executor,
            pool,
            switch,
        }
    }

    pub fn switch(&self) -> &ProcessingSwitch {
        &self.switch
    }

    pub fn executor(&self) -> &Arc<DeliveryExecutor> {
        &self.executor
    }

    pub fn mode(&self) -> DispatchMode {
        self.pool.mode()
    }

    /// Called after an entity was created or edited. Returns the number of
    /// deliveries submitted. In pooled mode no network I/O happens before
    /// this returns.
    pub async fn on_mutation(&self, entity: &WatchedEntity, was_created: bool) -> usize {
        if !self.switch.is_enabled() {
            tracing::trace!(kind = %entity.kind(), id = entity.id(), "webhook processing disabled");
            return 0;
        }

        let Some((project, subscriptions)) = resolver::resolve(self.source.as_ref(), entity) else {
            tracing::debug!(kind = %entity.kind(), id = entity.id(), "no owning project, skipping");
            return 0;
        };
        if subscriptions.is_empty() {
            return 0;
        }

        let event = EventKind::from_created(was_created);
        let envelope = match payload::prepare(event, entity, &project) {
            Ok(e) => e,
            Err(e) => {
                tracing::error!(kind = %entity.kind(), id = entity.id(), error = %e, "failed to serialize envelope");
                return 0;
            }
        };

        let count = subscriptions.len();
        tracing::debug!(
            kind = %entity.kind(),
            id = entity.id(),
            project_id = project.id,
            subscribers = count,
            ?event,
            "dispatching webhooks"
        );

        for subscription in subscriptions {
            let executor = self.executor.clone();
            let envelope = envelope.clone();
            let kind = envelope.kind;
            self.pool
                .submit(async move {
                    executor.deliver(&subscription, &envelope, kind).await;
                })
                .await;
        }
        count
    }

    /// Called after an entity was deleted. Delivery on deletion is
    /// currently suppressed: nothing is sent.
    pub fn on_delete(&self, entity: &WatchedEntity) {
        tracing::debug!(kind = %entity.kind(), id = entity.id(), "delete event not forwarded");
    }

    pub async fn drain(&self, timeout: Duration) -> bool {
        self.pool.drain(timeout).await
    }
}
