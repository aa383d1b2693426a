//! The data-store seam.
//!
//! Invoice, subscription, user, ticket, session, and idempotency-key
//! records are owned by an external persistence service; handlers reach
//! them through the [`Store`] trait. Single-record updates are atomic and
//! conditional variants (update-if-status-equals) are available wherever
//! a no-op/duplicate-effect invariant depends on current state.
//! [`MemoryStore`] backs the test suite.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::collections::HashMap;
use std::sync::Mutex;

macro_rules! record_id {
    ($name:ident) => {
        #[derive(Clone, Eq, Hash, PartialEq, Debug, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(uuid::Uuid::now_v7().to_string())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

record_id! { UserId }
record_id! { PlanId }
record_id! { InvoiceId }
record_id! { PaymentId }
record_id! { SubscriptionId }
record_id! { TicketId }
record_id! { TicketMessageId }
record_id! { SessionId }

#[derive(Clone, Copy, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    Pending,
    Paid,
    Expired,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Settled,
    Failed,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Active,
    Expired,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub name: String,
    pub duration_days: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Invoice {
    pub id: InvoiceId,
    pub user_id: UserId,
    pub plan_id: PlanId,
    pub status: InvoiceStatus,
    /// End of the window during which the quoted price/address is valid.
    pub rate_locked_until: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub invoice_id: InvoiceId,
    pub status: PaymentStatus,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub user_id: UserId,
    pub plan_id: PlanId,
    pub status: SubscriptionStatus,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewSubscription {
    pub user_id: UserId,
    pub plan_id: PlanId,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Ticket {
    pub id: TicketId,
    pub user_id: Option<UserId>,
    pub subject: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TicketMessage {
    pub id: TicketMessageId,
    pub ticket_id: TicketId,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
/// A ticket joined with its owning user and most recent message.
pub struct TicketContext {
    pub ticket: Ticket,
    pub user: Option<User>,
    pub last_message: Option<TicketMessage>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub user_id: UserId,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("StoreError - Unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
/// CRUD operations handlers are allowed to perform. Records may be
/// mutated concurrently by other handler invocations or by the HTTP
/// layer; conditional updates return whether the transition was applied.
pub trait Store: Send + Sync + 'static {
    async fn find_invoice(&self, id: &InvoiceId) -> Result<Option<Invoice>, StoreError>;

    async fn payments_for_invoice(&self, id: &InvoiceId) -> Result<Vec<Payment>, StoreError>;

    async fn find_plan(&self, id: &PlanId) -> Result<Option<Plan>, StoreError>;

    /// Invoices in PENDING status whose rate lock has not yet expired.
    async fn pending_invoices_within_rate_lock(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Invoice>, StoreError>;

    /// Conditional PENDING → PAID transition. Returns `false` when the
    /// invoice was absent or no longer PENDING.
    async fn mark_invoice_paid(&self, id: &InvoiceId) -> Result<bool, StoreError>;

    /// Conditional PENDING → SETTLED transition on a payment record.
    async fn settle_payment(&self, id: &PaymentId) -> Result<bool, StoreError>;

    /// The ACTIVE subscription for this user and plan, if one exists.
    async fn find_active_subscription(
        &self,
        user_id: &UserId,
        plan_id: &PlanId,
    ) -> Result<Option<Subscription>, StoreError>;

    async fn create_subscription(
        &self,
        new_subscription: NewSubscription,
    ) -> Result<Subscription, StoreError>;

    async fn update_subscription(&self, subscription: &Subscription) -> Result<(), StoreError>;

    async fn ticket_context(&self, id: &TicketId) -> Result<Option<TicketContext>, StoreError>;

    /// Delete sessions with `expires_at < now`. Returns how many went.
    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Delete idempotency-key records created before the cutoff.
    async fn delete_idempotency_keys_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Bulk conditional ACTIVE → EXPIRED on subscriptions past expiry.
    async fn expire_overdue_subscriptions(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Bulk conditional PENDING → EXPIRED on invoices past their rate lock.
    async fn expire_stale_invoices(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// In-memory [`Store`] used by the test suite.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    users: HashMap<UserId, User>,
    plans: HashMap<PlanId, Plan>,
    invoices: HashMap<InvoiceId, Invoice>,
    payments: HashMap<PaymentId, Payment>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    tickets: HashMap<TicketId, Ticket>,
    ticket_messages: Vec<TicketMessage>,
    sessions: HashMap<SessionId, Session>,
    idempotency_keys: Vec<IdempotencyRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock<T>(&self, f: impl FnOnce(&mut StoreInner) -> T) -> T {
        let mut inner = self.inner.lock().expect("Couldn't lock MemoryStore state");
        f(&mut inner)
    }

    pub fn insert_user(&self, user: User) {
        self.lock(|inner| {
            inner.users.insert(user.id.clone(), user);
        })
    }

    pub fn insert_plan(&self, plan: Plan) {
        self.lock(|inner| {
            inner.plans.insert(plan.id.clone(), plan);
        })
    }

    pub fn insert_invoice(&self, invoice: Invoice) {
        self.lock(|inner| {
            inner.invoices.insert(invoice.id.clone(), invoice);
        })
    }

    pub fn insert_payment(&self, payment: Payment) {
        self.lock(|inner| {
            inner.payments.insert(payment.id.clone(), payment);
        })
    }

    pub fn insert_subscription(&self, subscription: Subscription) {
        self.lock(|inner| {
            inner
                .subscriptions
                .insert(subscription.id.clone(), subscription);
        })
    }

    pub fn insert_ticket(&self, ticket: Ticket) {
        self.lock(|inner| {
            inner.tickets.insert(ticket.id.clone(), ticket);
        })
    }

    pub fn insert_ticket_message(&self, message: TicketMessage) {
        self.lock(|inner| inner.ticket_messages.push(message))
    }

    pub fn insert_session(&self, session: Session) {
        self.lock(|inner| {
            inner.sessions.insert(session.id.clone(), session);
        })
    }

    pub fn insert_idempotency_key(&self, record: IdempotencyRecord) {
        self.lock(|inner| inner.idempotency_keys.push(record))
    }

    pub fn invoice(&self, id: &InvoiceId) -> Option<Invoice> {
        self.lock(|inner| inner.invoices.get(id).cloned())
    }

    pub fn payment(&self, id: &PaymentId) -> Option<Payment> {
        self.lock(|inner| inner.payments.get(id).cloned())
    }

    pub fn subscriptions_for_user(&self, user_id: &UserId) -> Vec<Subscription> {
        self.lock(|inner| {
            inner
                .subscriptions
                .values()
                .filter(|s| &s.user_id == user_id)
                .cloned()
                .collect()
        })
    }

    pub fn session_count(&self) -> usize {
        self.lock(|inner| inner.sessions.len())
    }

    pub fn idempotency_key_count(&self) -> usize {
        self.lock(|inner| inner.idempotency_keys.len())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_invoice(&self, id: &InvoiceId) -> Result<Option<Invoice>, StoreError> {
        Ok(self.lock(|inner| inner.invoices.get(id).cloned()))
    }

    async fn payments_for_invoice(&self, id: &InvoiceId) -> Result<Vec<Payment>, StoreError> {
        Ok(self.lock(|inner| {
            inner
                .payments
                .values()
                .filter(|p| &p.invoice_id == id)
                .cloned()
                .collect()
        }))
    }

    async fn find_plan(&self, id: &PlanId) -> Result<Option<Plan>, StoreError> {
        Ok(self.lock(|inner| inner.plans.get(id).cloned()))
    }

    async fn pending_invoices_within_rate_lock(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Invoice>, StoreError> {
        Ok(self.lock(|inner| {
            inner
                .invoices
                .values()
                .filter(|i| i.status == InvoiceStatus::Pending && i.rate_locked_until >= now)
                .cloned()
                .collect()
        }))
    }

    async fn mark_invoice_paid(&self, id: &InvoiceId) -> Result<bool, StoreError> {
        Ok(self.lock(|inner| match inner.invoices.get_mut(id) {
            Some(invoice) if invoice.status == InvoiceStatus::Pending => {
                invoice.status = InvoiceStatus::Paid;
                true
            }
            _ => false,
        }))
    }

    async fn settle_payment(&self, id: &PaymentId) -> Result<bool, StoreError> {
        Ok(self.lock(|inner| match inner.payments.get_mut(id) {
            Some(payment) if payment.status == PaymentStatus::Pending => {
                payment.status = PaymentStatus::Settled;
                true
            }
            _ => false,
        }))
    }

    async fn find_active_subscription(
        &self,
        user_id: &UserId,
        plan_id: &PlanId,
    ) -> Result<Option<Subscription>, StoreError> {
        Ok(self.lock(|inner| {
            inner
                .subscriptions
                .values()
                .find(|s| {
                    &s.user_id == user_id
                        && &s.plan_id == plan_id
                        && s.status == SubscriptionStatus::Active
                })
                .cloned()
        }))
    }

    async fn create_subscription(
        &self,
        new_subscription: NewSubscription,
    ) -> Result<Subscription, StoreError> {
        let subscription = Subscription {
            id: SubscriptionId::new(),
            user_id: new_subscription.user_id,
            plan_id: new_subscription.plan_id,
            status: SubscriptionStatus::Active,
            started_at: new_subscription.started_at,
            expires_at: new_subscription.expires_at,
        };
        self.lock(|inner| {
            inner
                .subscriptions
                .insert(subscription.id.clone(), subscription.clone());
        });
        Ok(subscription)
    }

    async fn update_subscription(&self, subscription: &Subscription) -> Result<(), StoreError> {
        self.lock(|inner| {
            inner
                .subscriptions
                .insert(subscription.id.clone(), subscription.clone());
        });
        Ok(())
    }

    async fn ticket_context(&self, id: &TicketId) -> Result<Option<TicketContext>, StoreError> {
        Ok(self.lock(|inner| {
            let ticket = inner.tickets.get(id).cloned()?;
            let user = ticket
                .user_id
                .as_ref()
                .and_then(|user_id| inner.users.get(user_id).cloned());
            let last_message = inner
                .ticket_messages
                .iter()
                .filter(|m| &m.ticket_id == id)
                .max_by_key(|m| m.created_at)
                .cloned();
            Some(TicketContext {
                ticket,
                user,
                last_message,
            })
        }))
    }

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        Ok(self.lock(|inner| {
            let before = inner.sessions.len();
            inner.sessions.retain(|_, s| s.expires_at >= now);
            (before - inner.sessions.len()) as u64
        }))
    }

    async fn delete_idempotency_keys_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        Ok(self.lock(|inner| {
            let before = inner.idempotency_keys.len();
            inner.idempotency_keys.retain(|k| k.created_at >= cutoff);
            (before - inner.idempotency_keys.len()) as u64
        }))
    }

    async fn expire_overdue_subscriptions(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        Ok(self.lock(|inner| {
            let mut expired = 0;
            for subscription in inner.subscriptions.values_mut() {
                if subscription.status == SubscriptionStatus::Active && subscription.expires_at < now
                {
                    subscription.status = SubscriptionStatus::Expired;
                    expired += 1;
                }
            }
            expired
        }))
    }

    async fn expire_stale_invoices(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        Ok(self.lock(|inner| {
            let mut expired = 0;
            for invoice in inner.invoices.values_mut() {
                if invoice.status == InvoiceStatus::Pending && invoice.rate_locked_until < now {
                    invoice.status = InvoiceStatus::Expired;
                    expired += 1;
                }
            }
            expired
        }))
    }
}
