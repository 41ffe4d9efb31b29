use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use uuid::Uuid;

use crate::core::mime::escape_markup;
use crate::core::models::{MailMessage, NotifyAction};

const SENDER_COLOR: &str = "#D6A046";
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Opaque identity of one presented notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotificationId(Uuid);

impl NotificationId {
    pub fn new() -> Self {
        NotificationId(Uuid::new_v4())
    }
}

impl Default for NotificationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NotificationRequest {
    pub id: NotificationId,
    pub summary: String,
    /// Already escaped; may contain the server's limited markup.
    pub body: String,
    pub actions: Vec<NotifyAction>,
}

impl NotificationRequest {
    pub fn new_mail(message: &MailMessage) -> Self {
        let body = format!(
            "<span color=\"{}\">{}</span>\n\n{}",
            SENDER_COLOR,
            escape_markup(&message.sender()),
            escape_markup(&message.subject)
        );
        NotificationRequest {
            id: NotificationId::new(),
            summary: "New mail".to_string(),
            body,
            actions: NotifyAction::ALL.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationOutcome {
    Action(NotifyAction),
    /// Closed by the user, expired, or closed by the server.
    Dismissed,
}

/// The desktop's notification facility.
pub trait Presenter: Send + Sync {
    /// Show `request`. The future resolves once the notification is gone.
    fn present(&self, request: NotificationRequest) -> BoxFuture<'static, Result<NotificationOutcome, String>>;

    /// Surface a failure to the user. Best effort.
    fn report(&self, summary: &str, body: &str) -> BoxFuture<'static, ()>;

    /// Take a presented notification down. Its `present` future then
    /// resolves as dismissed. Best effort.
    fn close(&self, id: NotificationId) -> BoxFuture<'static, ()>;
}

/// freedesktop.org notifications through notify-rust.
pub struct DesktopPresenter {
    app_name: String,
    /// Server-assigned ids of the notifications on screen.
    shown: Arc<Mutex<HashMap<NotificationId, u32>>>,
}

impl DesktopPresenter {
    pub fn new(app_name: impl Into<String>) -> Self {
        DesktopPresenter {
            app_name: app_name.into(),
            shown: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// `CloseNotification` on the session bus. notify-rust's handle is consumed
/// by the blocking wait, so this goes around it.
async fn close_on_server(server_id: u32) {
    let closed = async {
        let conn = zbus::Connection::session().await?;
        conn.call_method(
            Some("org.freedesktop.Notifications"),
            "/org/freedesktop/Notifications",
            Some("org.freedesktop.Notifications"),
            "CloseNotification",
            &(server_id,),
        )
        .await?;
        Ok::<(), zbus::Error>(())
    };
    match tokio::time::timeout(CLOSE_TIMEOUT, closed).await {
        Ok(Ok(())) => log::debug!("Closed notification {}", server_id),
        Ok(Err(e)) => log::warn!("Failed to close notification {}: {}", server_id, e),
        Err(_) => log::warn!("Timed out closing notification {}", server_id),
    }
}

impl Presenter for DesktopPresenter {
    fn present(&self, request: NotificationRequest) -> BoxFuture<'static, Result<NotificationOutcome, String>> {
        let app_name = self.app_name.clone();
        let shown = self.shown.clone();
        async move {
            let id = request.id;
            let registry = shown.clone();
            let outcome = tokio::task::spawn_blocking(move || {
                let mut notification = notify_rust::Notification::new();
                notification
                    .appname(&app_name)
                    .summary(&request.summary)
                    .body(&request.body)
                    .icon("mail-message-new");
                for action in &request.actions {
                    notification.action(action.id(), action.label());
                }
                let handle = notification
                    .show()
                    .map_err(|e| format!("show notification {}: {e}", request.id))?;
                lock(&registry).insert(request.id, handle.id());

                let mut outcome = NotificationOutcome::Dismissed;
                handle.wait_for_action(|action| {
                    if let Some(action) = NotifyAction::from_id(action) {
                        outcome = NotificationOutcome::Action(action);
                    }
                });
                Ok::<_, String>(outcome)
            })
            .await
            .map_err(|e| format!("notification task: {e}"))?;

            let server_id = lock(&shown).remove(&id);
            let outcome = outcome?;
            // Resident notifications stay up after an action unless closed.
            if let (NotificationOutcome::Action(_), Some(server_id)) = (outcome, server_id) {
                close_on_server(server_id).await;
            }
            Ok::<_, String>(outcome)
        }
        .boxed()
    }

    fn report(&self, summary: &str, body: &str) -> BoxFuture<'static, ()> {
        let app_name = self.app_name.clone();
        let summary = summary.to_string();
        let body = escape_markup(body);
        async move {
            let result = tokio::task::spawn_blocking(move || {
                notify_rust::Notification::new()
                    .appname(&app_name)
                    .summary(&summary)
                    .body(&body)
                    .icon("dialog-error")
                    .urgency(notify_rust::Urgency::Critical)
                    .show()
                    .map(|_| ())
            })
            .await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!("Failed to show error notification: {}", e),
                Err(e) => log::warn!("Error notification task failed: {}", e),
            }
        }
        .boxed()
    }

    fn close(&self, id: NotificationId) -> BoxFuture<'static, ()> {
        let server_id = lock(&self.shown).get(&id).copied();
        async move {
            match server_id {
                Some(server_id) => close_on_server(server_id).await,
                None => log::debug!("Notification {} is not on screen", id),
            }
        }
        .boxed()
    }
}
