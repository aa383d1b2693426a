mod helpers;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};

use std::sync::Arc;

use subscription_worker::{
    IdempotencyRecord, Invoice, InvoiceId, InvoiceStatus, MemoryStore, NewSubscription, PaymentId,
    Plan, PlanId, RetentionCleanupHandler, Session, SessionId, Store, StoreError, Subscription,
    SubscriptionId, SubscriptionStatus, TicketContext, TicketId, UserId,
};

fn seed_sessions(store: &MemoryStore, expired: usize, live: usize) {
    let now = Utc::now();
    for i in 0..expired {
        store.insert_session(Session {
            id: SessionId::from(format!("sess_expired_{i}")),
            user_id: UserId::from("u_1"),
            expires_at: now - ChronoDuration::minutes(1),
        });
    }
    for i in 0..live {
        store.insert_session(Session {
            id: SessionId::from(format!("sess_live_{i}")),
            user_id: UserId::from("u_1"),
            expires_at: now + ChronoDuration::hours(1),
        });
    }
}

#[tokio::test]
async fn sweeps_exactly_the_expired_sessions() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    seed_sessions(&store, 3, 2);
    let handler = RetentionCleanupHandler::new(store.clone());

    handler.sweep().await.expect("sweep");

    assert_eq!(store.session_count(), 2);
    Ok(())
}

#[tokio::test]
async fn keeps_idempotency_keys_younger_than_ninety_days() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let now = Utc::now();
    store.insert_idempotency_key(IdempotencyRecord {
        key: "old".to_string(),
        created_at: now - ChronoDuration::days(100),
    });
    store.insert_idempotency_key(IdempotencyRecord {
        key: "young".to_string(),
        created_at: now - ChronoDuration::days(10),
    });
    let handler = RetentionCleanupHandler::new(store.clone());

    handler.sweep().await.expect("sweep");

    assert_eq!(store.idempotency_key_count(), 1);
    Ok(())
}

#[tokio::test]
async fn transitions_overdue_subscriptions_and_stale_invoices() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let now = Utc::now();
    let user_id = helpers::seed_user(&store);
    let plan_id = helpers::seed_plan(&store);

    store.insert_subscription(Subscription {
        id: SubscriptionId::from("sub_overdue"),
        user_id: user_id.clone(),
        plan_id: plan_id.clone(),
        status: SubscriptionStatus::Active,
        started_at: now - ChronoDuration::days(40),
        expires_at: now - ChronoDuration::days(1),
    });
    store.insert_subscription(Subscription {
        id: SubscriptionId::from("sub_current"),
        user_id: user_id.clone(),
        plan_id: plan_id.clone(),
        status: SubscriptionStatus::Active,
        started_at: now - ChronoDuration::days(10),
        expires_at: now + ChronoDuration::days(20),
    });
    store.insert_invoice(Invoice {
        id: InvoiceId::from("inv_stale"),
        user_id: user_id.clone(),
        plan_id: plan_id.clone(),
        status: InvoiceStatus::Pending,
        rate_locked_until: now - ChronoDuration::minutes(5),
        created_at: now - ChronoDuration::hours(2),
    });
    let fresh = helpers::seed_pending_invoice(&store, "inv_fresh", &user_id, &plan_id);

    let handler = RetentionCleanupHandler::new(store.clone());
    handler.sweep().await.expect("sweep");

    let subscriptions = store.subscriptions_for_user(&user_id);
    assert_eq!(subscriptions.len(), 2);
    for subscription in subscriptions {
        let expected = if subscription.id == SubscriptionId::from("sub_overdue") {
            SubscriptionStatus::Expired
        } else {
            SubscriptionStatus::Active
        };
        assert_eq!(subscription.status, expected);
    }

    assert_eq!(
        store.invoice(&InvoiceId::from("inv_stale")).unwrap().status,
        InvoiceStatus::Expired
    );
    assert_eq!(store.invoice(&fresh).unwrap().status, InvoiceStatus::Pending);
    Ok(())
}

/// Store wrapper that fails selected sweep operations.
struct FlakyStore {
    inner: MemoryStore,
    fail_sessions: bool,
    fail_keys: bool,
    fail_subscriptions: bool,
    fail_invoices: bool,
}

impl FlakyStore {
    fn failing(
        fail_sessions: bool,
        fail_keys: bool,
        fail_subscriptions: bool,
        fail_invoices: bool,
    ) -> Self {
        Self {
            inner: MemoryStore::new(),
            fail_sessions,
            fail_keys,
            fail_subscriptions,
            fail_invoices,
        }
    }

    fn unavailable() -> StoreError {
        StoreError::Unavailable("connection reset".to_string())
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn find_invoice(&self, id: &InvoiceId) -> Result<Option<Invoice>, StoreError> {
        self.inner.find_invoice(id).await
    }

    async fn payments_for_invoice(
        &self,
        id: &InvoiceId,
    ) -> Result<Vec<subscription_worker::Payment>, StoreError> {
        self.inner.payments_for_invoice(id).await
    }

    async fn find_plan(&self, id: &PlanId) -> Result<Option<Plan>, StoreError> {
        self.inner.find_plan(id).await
    }

    async fn pending_invoices_within_rate_lock(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Invoice>, StoreError> {
        self.inner.pending_invoices_within_rate_lock(now).await
    }

    async fn mark_invoice_paid(&self, id: &InvoiceId) -> Result<bool, StoreError> {
        self.inner.mark_invoice_paid(id).await
    }

    async fn settle_payment(&self, id: &PaymentId) -> Result<bool, StoreError> {
        self.inner.settle_payment(id).await
    }

    async fn find_active_subscription(
        &self,
        user_id: &UserId,
        plan_id: &PlanId,
    ) -> Result<Option<Subscription>, StoreError> {
        self.inner.find_active_subscription(user_id, plan_id).await
    }

    async fn create_subscription(
        &self,
        new_subscription: NewSubscription,
    ) -> Result<Subscription, StoreError> {
        self.inner.create_subscription(new_subscription).await
    }

    async fn update_subscription(&self, subscription: &Subscription) -> Result<(), StoreError> {
        self.inner.update_subscription(subscription).await
    }

    async fn ticket_context(&self, id: &TicketId) -> Result<Option<TicketContext>, StoreError> {
        self.inner.ticket_context(id).await
    }

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        if self.fail_sessions {
            return Err(Self::unavailable());
        }
        self.inner.delete_expired_sessions(now).await
    }

    async fn delete_idempotency_keys_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        if self.fail_keys {
            return Err(Self::unavailable());
        }
        self.inner.delete_idempotency_keys_before(cutoff).await
    }

    async fn expire_overdue_subscriptions(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        if self.fail_subscriptions {
            return Err(Self::unavailable());
        }
        self.inner.expire_overdue_subscriptions(now).await
    }

    async fn expire_stale_invoices(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        if self.fail_invoices {
            return Err(Self::unavailable());
        }
        self.inner.expire_stale_invoices(now).await
    }
}

#[tokio::test]
async fn one_failing_sweep_does_not_block_the_others() -> anyhow::Result<()> {
    let store = Arc::new(FlakyStore::failing(true, false, false, false));
    seed_sessions(&store.inner, 2, 0);
    store.inner.insert_idempotency_key(IdempotencyRecord {
        key: "old".to_string(),
        created_at: Utc::now() - ChronoDuration::days(120),
    });

    let handler = RetentionCleanupHandler::new(store.clone());
    handler.sweep().await.expect("partial failure completes");

    // the session sweep failed but the key sweep still ran
    assert_eq!(store.inner.session_count(), 2);
    assert_eq!(store.inner.idempotency_key_count(), 0);
    Ok(())
}

#[tokio::test]
async fn tick_fails_when_every_sweep_failed() {
    let store = Arc::new(FlakyStore::failing(true, true, true, true));
    let handler = RetentionCleanupHandler::new(store);

    assert!(handler.sweep().await.is_err());
}
