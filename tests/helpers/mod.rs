#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use subscription_worker::{
    DetectorError, Invoice, InvoiceId, InvoiceStatus, MemoryStore, MessengerError, Payment,
    PaymentDetector, PaymentId, PaymentStatus, Plan, PlanId, Settlement, SupportMessenger, User,
    UserId,
};

pub const PLAN_DURATION_DAYS: u32 = 30;

/// Support messenger that records every delivered message.
#[derive(Default)]
pub struct RecordingMessenger {
    sent: Mutex<Vec<String>>,
}

impl RecordingMessenger {
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl SupportMessenger for RecordingMessenger {
    async fn send(&self, text: &str) -> Result<(), MessengerError> {
        self.sent.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

/// Support messenger whose delivery endpoint always rejects.
pub struct FailingMessenger;

#[async_trait]
impl SupportMessenger for FailingMessenger {
    async fn send(&self, _text: &str) -> Result<(), MessengerError> {
        Err(MessengerError::Delivery {
            status: 502,
            body: "bad gateway".to_string(),
        })
    }
}

/// Payment detector scripted per invoice: settle, fail, or report
/// nothing. Records every invoice it was asked about.
#[derive(Default)]
pub struct ScriptedDetector {
    settlements: Mutex<HashMap<InvoiceId, PaymentId>>,
    failures: Mutex<HashSet<InvoiceId>>,
    checked: Mutex<Vec<InvoiceId>>,
}

impl ScriptedDetector {
    pub fn settle(&self, invoice_id: &InvoiceId, payment_id: &PaymentId) {
        self.settlements
            .lock()
            .unwrap()
            .insert(invoice_id.clone(), payment_id.clone());
    }

    pub fn fail_for(&self, invoice_id: &InvoiceId) {
        self.failures.lock().unwrap().insert(invoice_id.clone());
    }

    pub fn checked(&self) -> Vec<InvoiceId> {
        self.checked.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentDetector for ScriptedDetector {
    async fn check_settlement(&self, invoice: &Invoice) -> Result<Settlement, DetectorError> {
        self.checked.lock().unwrap().push(invoice.id.clone());
        if self.failures.lock().unwrap().contains(&invoice.id) {
            return Err(DetectorError::Unavailable("explorer timeout".to_string()));
        }
        Ok(match self.settlements.lock().unwrap().get(&invoice.id) {
            Some(payment_id) => Settlement::Settled {
                payment_id: payment_id.clone(),
            },
            None => Settlement::Unsettled,
        })
    }
}

pub fn seed_plan(store: &MemoryStore) -> PlanId {
    let id = PlanId::from("plan_basic");
    store.insert_plan(Plan {
        id: id.clone(),
        name: "Basic".to_string(),
        duration_days: PLAN_DURATION_DAYS,
    });
    id
}

pub fn seed_user(store: &MemoryStore) -> UserId {
    let id = UserId::from("u_1");
    store.insert_user(User {
        id: id.clone(),
        email: Some("user@example.com".to_string()),
        phone: None,
    });
    id
}

pub fn seed_pending_invoice(
    store: &MemoryStore,
    id: &str,
    user_id: &UserId,
    plan_id: &PlanId,
) -> InvoiceId {
    let invoice_id = InvoiceId::from(id);
    let now = Utc::now();
    store.insert_invoice(Invoice {
        id: invoice_id.clone(),
        user_id: user_id.clone(),
        plan_id: plan_id.clone(),
        status: InvoiceStatus::Pending,
        rate_locked_until: now + ChronoDuration::minutes(30),
        created_at: now,
    });
    invoice_id
}

pub fn seed_payment(
    store: &MemoryStore,
    id: &str,
    invoice_id: &InvoiceId,
    status: PaymentStatus,
) -> PaymentId {
    let payment_id = PaymentId::from(id);
    store.insert_payment(Payment {
        id: payment_id.clone(),
        invoice_id: invoice_id.clone(),
        status,
    });
    payment_id
}

pub fn approx_eq(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    (a - b).num_seconds().abs() <= 60
}

/// Poll until the predicate holds; panic after two seconds.
pub async fn eventually(mut predicate: impl FnMut() -> bool, what: &str) {
    for _ in 0..200 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
