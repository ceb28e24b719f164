//! Smart bulb command model and the bridge seam.

use serde::{Deserialize, Serialize};

/// State change for one bulb or group. Unset fields are left untouched by
/// the bridge, so they are omitted from the serialised body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightCommand {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on: Option<bool>,
    #[serde(rename = "bri", skip_serializing_if = "Option::is_none")]
    pub brightness: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hue: Option<u16>,
    #[serde(rename = "sat", skip_serializing_if = "Option::is_none")]
    pub saturation: Option<u8>,
    /// Transition length in 100 ms steps.
    #[serde(rename = "transitiontime", skip_serializing_if = "Option::is_none")]
    pub transition_ticks: Option<u16>,
    #[serde(rename = "effect", skip_serializing_if = "Option::is_none")]
    pub effect_name: Option<String>,
    #[serde(rename = "alert", skip_serializing_if = "Option::is_none")]
    pub alert_name: Option<String>,
}

impl LightCommand {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, on: bool) -> Self {
        self.on = Some(on);
        self
    }

    pub fn brightness(mut self, brightness: u8) -> Self {
        self.brightness = Some(brightness);
        self
    }

    pub fn hue(mut self, hue: u16) -> Self {
        self.hue = Some(hue);
        self
    }

    pub fn saturation(mut self, saturation: u8) -> Self {
        self.saturation = Some(saturation);
        self
    }

    pub fn transition(mut self, ticks: u16) -> Self {
        self.transition_ticks = Some(ticks);
        self
    }

    pub fn effect(mut self, effect: impl Into<String>) -> Self {
        self.effect_name = Some(effect.into());
        self
    }

    pub fn alert(mut self, alert: impl Into<String>) -> Self {
        self.alert_name = Some(alert.into());
        self
    }

    /// JSON body in the shape a Hue bridge accepts.
    pub fn to_body(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Fire-and-forget access to a bulb bridge. Implementations are expected to
/// respect the bridge's own rate limit.
pub trait BulbBridge: Send + Sync {
    fn send_light_command(&self, target: usize, command: &LightCommand);

    fn send_group_command(&self, group: u8, command: &LightCommand);

    /// Pushes out queued commands when the bridge has no loop of its own.
    fn update(&self) {}
}

/// Bridge that only logs what it would send.
#[derive(Debug, Default, Clone)]
pub struct LoggingBridge;

impl BulbBridge for LoggingBridge {
    fn send_light_command(&self, target: usize, command: &LightCommand) {
        tracing::info!(target_light = target, body = %command.to_body(), "light command");
    }

    fn send_group_command(&self, group: u8, command: &LightCommand) {
        tracing::info!(group, body = %command.to_body(), "group command");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn omits_unset_fields() {
        let command = LightCommand::new().alert("select");
        assert_eq!(command.to_body(), r#"{"alert":"select"}"#);

        let command = LightCommand::new().on(true).brightness(254).hue(300).transition(1);
        assert_eq!(
            command.to_body(),
            r#"{"on":true,"bri":254,"hue":300,"transitiontime":1}"#
        );
    }

    #[test]
    fn parses_bridge_bodies() {
        let command: LightCommand =
            serde_json::from_str(r#"{"on":false,"effect":"colorloop"}"#).unwrap();
        assert_eq!(command, LightCommand::new().on(false).effect("colorloop"));
    }
}
