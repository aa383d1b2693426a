//! Support and user notification handlers.

use async_trait::async_trait;
use tracing::instrument;

use std::sync::Arc;

use crate::current::CurrentJob;
use crate::entity::JobType;
use crate::messenger::{SupportMessenger, UserNotifier};
use crate::producer::{
    NotifySupportPayload, NotifyUserPayload, SupportNotificationKind, NOTIFY_SUPPORT, NOTIFY_USER,
};
use crate::runner::{HandlerError, JobHandler};
use crate::store::{Store, TicketContext};

/// Notifies the support channel about ticket activity.
pub struct NotifySupportHandler {
    store: Arc<dyn Store>,
    messenger: Option<Arc<dyn SupportMessenger>>,
}

impl NotifySupportHandler {
    /// `messenger: None` means the channel is unconfigured; notifications
    /// then complete as no-ops.
    pub fn new(store: Arc<dyn Store>, messenger: Option<Arc<dyn SupportMessenger>>) -> Self {
        Self { store, messenger }
    }

    #[instrument(name = "notify.support", skip(self), fields(ticket_id = %payload.ticket_id), err)]
    pub async fn notify(&self, payload: &NotifySupportPayload) -> Result<(), HandlerError> {
        let Some(context) = self.store.ticket_context(&payload.ticket_id).await? else {
            tracing::info!("ticket not found, nothing to notify");
            return Ok(());
        };

        let text = support_message(payload.kind, &context);

        let Some(messenger) = &self.messenger else {
            tracing::info!("support messenger not configured, skipping");
            return Ok(());
        };
        messenger.send(&text).await?;
        tracing::info!("support notification delivered");
        Ok(())
    }
}

#[async_trait]
impl JobHandler for NotifySupportHandler {
    fn job_type(&self) -> JobType {
        NOTIFY_SUPPORT
    }

    async fn run(&self, current_job: CurrentJob) -> Result<(), HandlerError> {
        let payload: NotifySupportPayload = current_job.payload()?;
        self.notify(&payload).await
    }
}

fn support_message(kind: SupportNotificationKind, context: &TicketContext) -> String {
    let (emoji, heading) = match kind {
        SupportNotificationKind::NewTicket => ("🆕", "New Ticket"),
        SupportNotificationKind::NewMessage => ("💬", "New Message"),
    };
    let user_label = user_label(context);
    let body = context
        .last_message
        .as_ref()
        .map(|m| m.body.as_str())
        .unwrap_or_default();

    format!(
        "{emoji} {heading}\nSubject: {subject}\nUser: {user_label}\n\n{body}\n\nTicketID: {ticket_id}",
        subject = context.ticket.subject,
        ticket_id = context.ticket.id,
    )
}

fn user_label(context: &TicketContext) -> String {
    if let Some(user) = &context.user {
        if let Some(email) = &user.email {
            return email.clone();
        }
        if let Some(phone) = &user.phone {
            return phone.clone();
        }
    }
    context
        .ticket
        .user_id
        .as_ref()
        .map(|id| id.to_string())
        .unwrap_or_else(|| "anonymous".to_string())
}

/// Delivers user-facing notifications. Delivery is best-effort until a
/// channel is wired: with no [`UserNotifier`] configured the handler
/// logs the notification and completes.
pub struct NotifyUserHandler {
    notifier: Option<Arc<dyn UserNotifier>>,
}

impl NotifyUserHandler {
    pub fn new(notifier: Option<Arc<dyn UserNotifier>>) -> Self {
        Self { notifier }
    }

    #[instrument(
        name = "notify.user",
        skip(self, payload),
        fields(user_id = %payload.user_id, kind = %payload.kind),
        err
    )]
    pub async fn notify(&self, payload: &NotifyUserPayload) -> Result<(), HandlerError> {
        match &self.notifier {
            Some(notifier) => {
                notifier
                    .notify(&payload.user_id, &payload.kind, &payload.message)
                    .await?;
                tracing::info!("user notification delivered");
            }
            None => {
                tracing::info!(
                    message = %payload.message,
                    "no user delivery channel configured, notification logged only"
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl JobHandler for NotifyUserHandler {
    fn job_type(&self) -> JobType {
        NOTIFY_USER
    }

    async fn run(&self, current_job: CurrentJob) -> Result<(), HandlerError> {
        let payload: NotifyUserPayload = current_job.payload()?;
        self.notify(&payload).await
    }
}
