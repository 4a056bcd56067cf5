//! Outbound command construction.
//!
//! Every command kind maps to a fixed `(prefix, command)` pair below the
//! namespace. The software update and rollback commands sit directly under the
//! namespace (`bmtl/sw-update/05`) without the `request/` segment the others
//! use; deployed firmware listens on exactly those topics.

use crate::mqtt::codec;
use crate::mqtt::topics::{build_target_topic, Target};
use rumqttc::QoS;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Every command is published exactly-once.
pub const COMMAND_QOS: QoS = QoS::ExactlyOnce;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Reboot,
    Configure,
    WiperPulse,
    CameraPowerToggle,
    CameraPowerStatus,
    SiteName,
    SoftwareUpdate,
    SoftwareRollback,
    SoftwareVersion,
    Status,
    Options,
    Settings,
}

pub const ALL_COMMANDS: &[CommandKind] = &[
    CommandKind::Reboot,
    CommandKind::Configure,
    CommandKind::WiperPulse,
    CommandKind::CameraPowerToggle,
    CommandKind::CameraPowerStatus,
    CommandKind::SiteName,
    CommandKind::SoftwareUpdate,
    CommandKind::SoftwareRollback,
    CommandKind::SoftwareVersion,
    CommandKind::Status,
    CommandKind::Options,
    CommandKind::Settings,
];

impl CommandKind {
    /// Name accepted by [`FromStr`] and shown in logs.
    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::Reboot => "reboot",
            CommandKind::Configure => "configure",
            CommandKind::WiperPulse => "wiper",
            CommandKind::CameraPowerToggle => "camera-on-off",
            CommandKind::CameraPowerStatus => "camera-power-status",
            CommandKind::SiteName => "sitename",
            CommandKind::SoftwareUpdate => "sw-update",
            CommandKind::SoftwareRollback => "sw-rollback",
            CommandKind::SoftwareVersion => "sw-version",
            CommandKind::Status => "status",
            CommandKind::Options => "options",
            CommandKind::Settings => "settings",
        }
    }

    /// `(segment below the namespace, command segment)` of the request topic.
    fn route(&self) -> (&'static str, &'static str) {
        match self {
            CommandKind::Reboot => ("request", "reboot"),
            CommandKind::Configure => ("set", "settings"),
            CommandKind::WiperPulse => ("request", "wiper"),
            CommandKind::CameraPowerToggle => ("request", "camera-on-off"),
            CommandKind::CameraPowerStatus => ("request", "camera-power-status"),
            CommandKind::SiteName => ("set", "sitename"),
            CommandKind::SoftwareUpdate => ("", "sw-update"),
            CommandKind::SoftwareRollback => ("", "sw-rollback"),
            CommandKind::SoftwareVersion => ("request", "sw-version"),
            CommandKind::Status => ("request", "status"),
            CommandKind::Options => ("request", "options"),
            CommandKind::Settings => ("request", "settings"),
        }
    }

    pub fn topic(&self, namespace: &str, target: Target) -> String {
        let (segment, command) = self.route();
        let prefix = if segment.is_empty() {
            namespace.to_string()
        } else {
            format!("{}/{}", namespace, segment)
        };
        build_target_topic(&prefix, command, target)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for CommandKind {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        let alias = match wanted.as_str() {
            "apply-settings" | "set-settings" => "configure",
            "wiper-pulse" => "wiper",
            "camera-power" | "camera-power-toggle" => "camera-on-off",
            "site-name" => "sitename",
            "software-update" => "sw-update",
            "software-rollback" => "sw-rollback",
            "software-version" => "sw-version",
            other => other,
        };
        ALL_COMMANDS
            .iter()
            .copied()
            .find(|kind| kind.name() == alias)
            .ok_or_else(|| DispatchError::UnknownCommand(s.to_string()))
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("unknown command kind '{0}'")]
    UnknownCommand(String),

    #[error("command payload must be a JSON object, got {0}")]
    InvalidPayload(String),
}

/// A command addressed to a device or the fleet.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub target: Target,
    pub kind: CommandKind,
    pub data: Value,
}

impl Command {
    pub fn new(target: Target, kind: CommandKind, data: Value) -> Self {
        Self { target, kind, data }
    }

    pub fn bare(target: Target, kind: CommandKind) -> Self {
        Self::new(target, kind, Value::Object(Default::default()))
    }
}

/// Fully encoded publish ready for the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    pub topic: String,
    pub payload: String,
    pub qos: QoS,
}

/// Builds the topic and wire payload for a command. `null` data is sent as
/// an empty object.
pub fn build_request(namespace: &str, command: &Command) -> Result<OutboundRequest, DispatchError> {
    let data = match &command.data {
        Value::Null => Value::Object(Default::default()),
        Value::Object(_) => command.data.clone(),
        other => return Err(DispatchError::InvalidPayload(other.to_string())),
    };

    Ok(OutboundRequest {
        topic: command.kind.topic(namespace, command.target),
        payload: codec::encode(&data),
        qos: COMMAND_QOS,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_topics_per_kind() {
        let cases = [
            (CommandKind::Reboot, "bmtl/request/reboot/07"),
            (CommandKind::Configure, "bmtl/set/settings/07"),
            (CommandKind::WiperPulse, "bmtl/request/wiper/07"),
            (CommandKind::CameraPowerToggle, "bmtl/request/camera-on-off/07"),
            (CommandKind::CameraPowerStatus, "bmtl/request/camera-power-status/07"),
            (CommandKind::SiteName, "bmtl/set/sitename/07"),
            (CommandKind::SoftwareVersion, "bmtl/request/sw-version/07"),
            (CommandKind::Status, "bmtl/request/status/07"),
            (CommandKind::Options, "bmtl/request/options/07"),
            (CommandKind::Settings, "bmtl/request/settings/07"),
        ];
        for (kind, topic) in cases {
            assert_eq!(kind.topic("bmtl", Target::Device(7)), topic);
        }
    }

    #[test]
    fn software_commands_skip_the_request_segment() {
        assert_eq!(CommandKind::SoftwareUpdate.topic("bmtl", Target::Device(5)), "bmtl/sw-update/05");
        assert_eq!(CommandKind::SoftwareRollback.topic("bmtl", Target::All), "bmtl/sw-rollback/all");
    }

    #[test]
    fn fleet_wide_commands_use_all() {
        assert_eq!(CommandKind::Reboot.topic("bmtl", Target::All), "bmtl/request/reboot/all");
    }

    #[test]
    fn payload_is_snake_cased_and_exactly_once() {
        let command = Command::new(Target::Device(2), CommandKind::SiteName, json!({ "siteName": "ridge" }));
        let request = build_request("bmtl", &command).unwrap();
        assert_eq!(request.topic, "bmtl/set/sitename/02");
        assert_eq!(request.payload, r#"{"site_name":"ridge"}"#);
        assert_eq!(request.qos, QoS::ExactlyOnce);
    }

    #[test]
    fn null_data_becomes_empty_object() {
        let request = build_request("bmtl", &Command::new(Target::All, CommandKind::Status, Value::Null)).unwrap();
        assert_eq!(request.payload, "{}");
    }

    #[test]
    fn non_object_data_is_rejected() {
        let command = Command::new(Target::Device(1), CommandKind::Configure, json!([1, 2]));
        assert!(matches!(build_request("bmtl", &command), Err(DispatchError::InvalidPayload(_))));
    }

    #[test]
    fn command_names_parse_with_aliases() {
        assert_eq!("reboot".parse::<CommandKind>().unwrap(), CommandKind::Reboot);
        assert_eq!("apply-settings".parse::<CommandKind>().unwrap(), CommandKind::Configure);
        assert_eq!("Software-Update".parse::<CommandKind>().unwrap(), CommandKind::SoftwareUpdate);
        assert_eq!(
            "self-destruct".parse::<CommandKind>(),
            Err(DispatchError::UnknownCommand("self-destruct".to_string()))
        );
        for kind in ALL_COMMANDS {
            assert_eq!(kind.name().parse::<CommandKind>().unwrap(), *kind);
        }
    }
}
