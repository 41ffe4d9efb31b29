use crate::core::error::WatchError;
use crate::core::models::{MailFlag, MailMessage, MessageKey, NotifyAction};
use crate::core::notify::{NotificationOutcome, NotificationRequest};

use super::{Event, LiveNotification, Task, Watcher};

impl Watcher {
    pub(super) fn handle_actions(&mut self, event: Event) -> Task<Event> {
        match event {
            Event::NotificationResolved { key, id, outcome } => {
                if !self.notifications.get(&key).is_some_and(|live| live.id == id) {
                    log::debug!("Notification {} for {} is no longer tracked", id, key);
                    return Task::none();
                }
                let Some(live) = self.notifications.remove(&key) else {
                    return Task::none();
                };
                if self.stopping {
                    return Task::none();
                }

                match outcome {
                    Ok(NotificationOutcome::Action(NotifyAction::MarkRead)) => {
                        return self.mark_read(key);
                    }
                    Ok(NotificationOutcome::Action(NotifyAction::Open)) => {
                        return self.open(live.message);
                    }
                    Ok(NotificationOutcome::Dismissed) => {
                        log::debug!("Notification for {} dismissed", key);
                    }
                    Err(e) => return self.report(WatchError::Presentation(e)),
                }
            }

            Event::FlagOpComplete { key, result } => {
                self.flag_pending.remove(&key);
                match result {
                    Ok(()) => {
                        log::info!("Marked {} as read", key);
                        self.marked_read.insert(key);
                    }
                    Err(e) => {
                        return self.report(WatchError::FlagMutation {
                            key,
                            reason: e.to_string(),
                        });
                    }
                }
            }

            _ => {}
        }
        Task::none()
    }

    /// Show a new-mail notification unless one is already up for this key.
    pub(super) fn present(&mut self, message: MailMessage) -> Task<Event> {
        let key = message.key;
        if self.notifications.contains_key(&key) {
            log::debug!("Notification for {} already showing", key);
            return Task::none();
        }

        let request = NotificationRequest::new_mail(&message);
        let id = request.id;
        let pending = self.presenter.present(request);
        self.notifications.insert(key, LiveNotification { id, message });

        Task::future(async move {
            Event::NotificationResolved {
                key,
                id,
                outcome: pending.await,
            }
        })
    }

    /// Set `\Seen`, at most once per session.
    pub(super) fn mark_read(&mut self, key: MessageKey) -> Task<Event> {
        if self.marked_read.contains(&key) || self.flag_pending.contains(&key) {
            log::debug!("{} already marked read", key);
            return Task::none();
        }
        let Some(conn) = self.live_connection() else {
            return self.report(WatchError::FlagMutation {
                key,
                reason: "not connected".into(),
            });
        };

        self.flag_pending.insert(key);
        let pending = conn.set_flag(key, MailFlag::Seen);
        Task::future(async move {
            Event::FlagOpComplete {
                key,
                result: pending.await,
            }
        })
    }
}
