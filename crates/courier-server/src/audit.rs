//! Lifecycle audit log.

use courier_core::handler::{
    ConnectEvent, DisconnectEvent, EventHandler, PublishEvent, SubscribeEvent, UnsubscribeEvent,
};
use courier_core::{Result, SubscribeOptions};
use tracing::info;

/// Logs every session lifecycle event and accepts all of them.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuditHandler;

impl EventHandler for AuditHandler {
    fn on_connect(&self, event: &ConnectEvent<'_>) -> Result<()> {
        info!(
            user = %event.user_id,
            client = %event.client_id,
            transport = "websocket",
            "User connected"
        );
        Ok(())
    }

    fn on_subscribe(
        &self,
        event: &SubscribeEvent<'_>,
        defaults: SubscribeOptions,
    ) -> Result<SubscribeOptions> {
        info!(user = %event.user_id, channel = %event.channel, "User subscribes");
        Ok(defaults)
    }

    fn on_unsubscribe(&self, event: &UnsubscribeEvent<'_>) {
        info!(user = %event.user_id, channel = %event.channel, "User unsubscribed");
    }

    fn on_publish(&self, event: &PublishEvent<'_>) -> Result<()> {
        info!(
            user = %event.user_id,
            channel = %event.channel,
            data = %String::from_utf8_lossy(event.data),
            "User publishes"
        );
        Ok(())
    }

    fn on_disconnect(&self, event: &DisconnectEvent<'_>) {
        info!(
            user = %event.user_id,
            client = %event.client_id,
            disconnect = %event.disconnect,
            "User disconnected"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::handler::PresenceEvent;

    #[test]
    fn test_audit_accepts_everything() {
        let handler = AuditHandler;
        let options = SubscribeOptions {
            presence: true,
            join_leave: false,
            recover: true,
        };
        let event = SubscribeEvent {
            client_id: "conn_1",
            user_id: "42",
            channel: "news",
        };
        assert_eq!(handler.on_subscribe(&event, options).unwrap(), options);

        let publish = PublishEvent {
            client_id: "conn_1",
            user_id: "42",
            channel: "news",
            data: br#"{"timestamp":1,"input":"hello"}"#,
        };
        assert!(handler.on_publish(&publish).is_ok());

        let presence = PresenceEvent {
            client_id: "conn_1",
            user_id: "42",
            channel: "news",
        };
        assert!(handler.on_presence(&presence).is_ok());
    }
}
