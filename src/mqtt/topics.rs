//! Topic addressing for the `{namespace}/{kind}/{command}/{device|all}` scheme.

use std::fmt;
use thiserror::Error;

pub const DEFAULT_NAMESPACE: &str = "bmtl";

/// Addressing mode of a topic: one device or the whole fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    Device(u32),
    All,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Target::Device(id) => write!(f, "{:02}", id),
            Target::All => write!(f, "all"),
        }
    }
}

impl std::str::FromStr for Target {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "all" {
            return Ok(Target::All);
        }
        s.parse::<u32>()
            .map(Target::Device)
            .map_err(|_| TopicError::InvalidDeviceId(s.to_string()))
    }
}

/// Category of an inbound topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicCategory {
    Health,
    Settings,
    SettingsSet,
    Reboot,
    Options,
    Wiper,
    CameraPower,
    CameraPowerStatus,
    SiteNameSet,
    SwUpdate,
    SwVersion,
    SwRollback,
}

/// Known inbound templates, relative to the namespace, without the target segment.
const RESPONSE_TEMPLATES: &[(&str, TopicCategory)] = &[
    ("status/health", TopicCategory::Health),
    ("response/settings", TopicCategory::Settings),
    ("response/set/settings", TopicCategory::SettingsSet),
    ("response/reboot", TopicCategory::Reboot),
    ("response/options", TopicCategory::Options),
    ("response/wiper", TopicCategory::Wiper),
    ("response/camera-on-off", TopicCategory::CameraPower),
    ("response/camera-power-status", TopicCategory::CameraPowerStatus),
    ("response/set/sitename", TopicCategory::SiteNameSet),
    ("response/sw-update", TopicCategory::SwUpdate),
    ("response/sw-version", TopicCategory::SwVersion),
    ("response/sw-rollback", TopicCategory::SwRollback),
];

impl TopicCategory {
    /// Whether responses of this category report the outcome of an action
    /// the operator asked for, rather than telemetry or a query answer.
    pub fn is_action(&self) -> bool {
        !matches!(
            self,
            TopicCategory::Health
                | TopicCategory::Settings
                | TopicCategory::Options
                | TopicCategory::CameraPowerStatus
                | TopicCategory::SwVersion
        )
    }
}

impl fmt::Display for TopicCategory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let template = RESPONSE_TEMPLATES
            .iter()
            .find(|(_, category)| category == self)
            .map(|(template, _)| *template)
            .unwrap_or("unknown");
        write!(f, "{}", template)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTopic {
    pub category: TopicCategory,
    pub target: Target,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("empty topic")]
    Empty,

    #[error("topic '{0}' is outside the namespace")]
    ForeignNamespace(String),

    #[error("no known category for topic '{0}'")]
    UnknownCategory(String),

    #[error("'{0}' is neither a device id nor 'all'")]
    InvalidDeviceId(String),
}

/// Builds `{prefix}/{command}/{id:02}`, or `{prefix}/{command}` without a device.
pub fn build_topic(prefix: &str, command: &str, device_id: Option<u32>) -> String {
    match device_id {
        Some(id) => format!("{}/{}/{:02}", prefix, command, id),
        None => format!("{}/{}", prefix, command),
    }
}

/// Builds the topic for a target, using the `{command}/all` form for the fleet.
pub fn build_target_topic(prefix: &str, command: &str, target: Target) -> String {
    match target {
        Target::Device(id) => build_topic(prefix, command, Some(id)),
        Target::All => build_topic(prefix, &format!("{}/all", command), None),
    }
}

/// Maps an inbound topic to its category and target.
pub fn parse_topic(namespace: &str, topic: &str) -> Result<ParsedTopic, TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }

    let rest = topic
        .strip_prefix(namespace)
        .and_then(|rest| rest.strip_prefix('/'))
        .ok_or_else(|| TopicError::ForeignNamespace(topic.to_string()))?;

    let (template, last) = rest
        .rsplit_once('/')
        .ok_or_else(|| TopicError::UnknownCategory(topic.to_string()))?;

    let category = RESPONSE_TEMPLATES
        .iter()
        .find(|(known, _)| *known == template)
        .map(|(_, category)| *category)
        .ok_or_else(|| TopicError::UnknownCategory(topic.to_string()))?;

    let target = last.parse::<Target>()?;
    Ok(ParsedTopic { category, target })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_ids_are_zero_padded() {
        assert_eq!(build_topic("bmtl/request", "reboot", Some(7)), "bmtl/request/reboot/07");
        assert_eq!(build_topic("bmtl/request", "reboot", Some(123)), "bmtl/request/reboot/123");
    }

    #[test]
    fn fleet_wildcard_is_part_of_the_command() {
        assert_eq!(build_topic("bmtl/request", "reboot/all", None), "bmtl/request/reboot/all");
        assert_eq!(
            build_target_topic("bmtl/request", "reboot", Target::All),
            "bmtl/request/reboot/all"
        );
    }

    #[test]
    fn parses_health_and_responses() {
        let parsed = parse_topic("bmtl", "bmtl/status/health/03").unwrap();
        assert_eq!(parsed.category, TopicCategory::Health);
        assert_eq!(parsed.target, Target::Device(3));

        let parsed = parse_topic("bmtl", "bmtl/response/set/sitename/12").unwrap();
        assert_eq!(parsed.category, TopicCategory::SiteNameSet);
        assert_eq!(parsed.target, Target::Device(12));

        let parsed = parse_topic("bmtl", "bmtl/response/options/all").unwrap();
        assert_eq!(parsed.category, TopicCategory::Options);
        assert_eq!(parsed.target, Target::All);
    }

    #[test]
    fn settings_and_settings_set_are_distinct() {
        assert_eq!(
            parse_topic("bmtl", "bmtl/response/settings/01").unwrap().category,
            TopicCategory::Settings
        );
        assert_eq!(
            parse_topic("bmtl", "bmtl/response/set/settings/01").unwrap().category,
            TopicCategory::SettingsSet
        );
    }

    #[test]
    fn unknown_topics_are_errors_not_panics() {
        assert_eq!(parse_topic("bmtl", ""), Err(TopicError::Empty));
        assert!(matches!(
            parse_topic("bmtl", "other/status/health/01"),
            Err(TopicError::ForeignNamespace(_))
        ));
        assert!(matches!(
            parse_topic("bmtl", "bmtl/response/teleport/01"),
            Err(TopicError::UnknownCategory(_))
        ));
        assert!(matches!(
            parse_topic("bmtl", "bmtl/status/health/cam"),
            Err(TopicError::InvalidDeviceId(_))
        ));
        assert!(matches!(parse_topic("bmtl", "bmtl/"), Err(TopicError::UnknownCategory(_))));
    }
}
