use tokio::sync::mpsc::UnboundedSender;
use tracing::*;

/// User-visible messages about a submission.
pub trait Notifier: Send + Sync {
    fn success(&self, message: &str);
    fn error(&self, message: &str);
}

pub fn submitted_message(filename: &str) -> String {
    format!("{filename} submitted!")
}

pub fn upload_failed_message(filename: &str) -> String {
    format!("Error uploading file: {filename}. Please try again.")
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn success(&self, message: &str) {
        info!(event = "Notification", message = %message);
    }

    fn error(&self, message: &str) {
        error!(event = "Notification", message = %message);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Success(String),
    Error(String),
}

/// Forwards notifications to whoever owns the receiving end.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    sender: UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn new(sender: UnboundedSender<Notification>) -> Self {
        ChannelNotifier { sender }
    }

    fn send(&self, notification: Notification) {
        // Receiver gone means nobody is listening any more.
        if let Err(err) = self.sender.send(notification) {
            debug!(message = "Dropping notification", notification = ?err.0);
        }
    }
}

impl Notifier for ChannelNotifier {
    fn success(&self, message: &str) {
        self.send(Notification::Success(message.to_string()));
    }

    fn error(&self, message: &str) {
        self.send(Notification::Error(message.to_string()));
    }
}
