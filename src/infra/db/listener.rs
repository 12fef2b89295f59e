//! Bridges Postgres `NOTIFY` into the cache trigger.
//!
//! Payloads on [`CHANGE_CHANNEL`] are JSON-encoded [`ChangeTarget`]s, e.g.
//! `{"scope":"node","node_id":1052,"change":"published"}`. Postgres delivers them
//! only after the sending transaction commits.

use std::sync::Arc;

use sqlx::postgres::{PgListener, PgPool};
use tracing::{debug, info, warn};

use crate::cache::{CacheTrigger, ChangeTarget};
use crate::infra::error::InfraError;

pub const CHANGE_CHANNEL: &str = "content_changes";

pub struct ChangeListener {
    listener: PgListener,
    trigger: Arc<CacheTrigger>,
}

impl ChangeListener {
    pub async fn connect(pool: &PgPool, trigger: Arc<CacheTrigger>) -> Result<Self, InfraError> {
        let mut listener = PgListener::connect_with(pool).await?;
        listener.listen(CHANGE_CHANNEL).await?;
        info!(channel = CHANGE_CHANNEL, "Listening for content changes");
        Ok(Self { listener, trigger })
    }

    /// Forward notifications until the listener fails.
    ///
    /// A dropped connection may have lost notifications, so it is answered
    /// with a full refresh once the listener reconnects.
    pub async fn run(mut self) -> Result<(), InfraError> {
        loop {
            let notification = self
                .listener
                .try_recv()
                .await
                .map_err(|err| InfraError::listener(err.to_string()))?;

            let target = match notification {
                Some(notification) => match parse_payload(notification.payload()) {
                    Ok(target) => target,
                    Err(err) => {
                        warn!(
                            payload = notification.payload(),
                            error = %err,
                            "Ignoring malformed change notification"
                        );
                        continue;
                    }
                },
                None => {
                    warn!("Change listener connection lost; scheduling full refresh");
                    ChangeTarget::All
                }
            };

            debug!(target = %target, "Change notification received");
            let consume_now = self.trigger.config().consume_on_trigger;
            if let Err(err) = self.trigger.trigger(target, consume_now).await {
                warn!(error = %err, "Cache refresh after notification failed");
            }
        }
    }
}

pub(crate) fn parse_payload(payload: &str) -> Result<ChangeTarget, serde_json::Error> {
    serde_json::from_str(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::ChangeKind;

    #[test]
    fn parses_node_payload() {
        let target = parse_payload(r#"{"scope":"node","node_id":1052,"change":"published"}"#)
            .expect("payload");
        assert_eq!(target, ChangeTarget::node(1052, ChangeKind::Published));
    }

    #[test]
    fn parses_branch_and_all_payloads() {
        let branch = parse_payload(r#"{"scope":"branch","root_id":7,"change":"moved"}"#)
            .expect("branch");
        assert_eq!(branch, ChangeTarget::branch(7, ChangeKind::Moved));
        assert_eq!(
            parse_payload(r#"{"scope":"all"}"#).expect("all"),
            ChangeTarget::All
        );
    }

    #[test]
    fn rejects_unknown_scope() {
        assert!(parse_payload(r#"{"scope":"tree"}"#).is_err());
    }
}
