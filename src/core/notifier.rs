//! Offline notifier port.
//!
//! The broker never talks to a push gateway directly; sessions that enable
//! offline notifications get their pushes through this trait. The default
//! binding is [`NoopNotifier`]. Calls are best-effort: the publish pipeline
//! bounds them with a deadline and swallows failures.

use async_trait::async_trait;

#[async_trait]
pub trait OfflineNotifier: Send + Sync {
    /// Notifies one offline user of `session` about new traffic.
    ///
    /// `preview` carries only envelope-level context (the topic); payloads
    /// are end-to-end encrypted and never leave the broker in the clear.
    async fn push_offline(&self, session: &str, user_id: &str, preview: &str);
}

/// Default notifier: does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl OfflineNotifier for NoopNotifier {
    async fn push_offline(&self, _session: &str, _user_id: &str, _preview: &str) {}
}
