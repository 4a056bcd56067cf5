//! Turns decoded device traffic into registry updates.
//!
//! Every message attributable to a device stamps it Online. Health messages
//! merge telemetry; responses update the fields they own only when the device
//! reports `success: true`. Failures are surfaced as [`Notification`]s and
//! never touch the registry field in question.
//!
//! The reconciler does not publish anything itself. Follow-up requests
//! (settings fetch after the first heartbeat of a session, refreshes after
//! successful actions) are returned to the caller as [`Command`]s.

use super::dispatcher::{Command, CommandKind};
use super::registry::{CameraPowerStatus, DeviceRegistry, HealthReport};
use crate::mqtt::codec::{self, CodecError};
use crate::mqtt::topics::{parse_topic, Target, TopicCategory, TopicError};
use chrono::{DateTime, Duration, Local};
use serde_json::{Map, Value};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Envelope fields that never belong to a settings snapshot or module list.
const ENVELOPE_KEYS: &[&str] = &["success", "message", "timestamp"];

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub namespace: String,
    /// Device-name prefix of module keys in batched responses (`bmotion05`).
    pub module_prefix: String,
    pub liveness_timeout: Duration,
    pub fan_out_batch_settings: bool,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            namespace: crate::mqtt::topics::DEFAULT_NAMESPACE.to_string(),
            module_prefix: "bmotion".to_string(),
            liveness_timeout: Duration::minutes(5),
            fan_out_batch_settings: false,
        }
    }
}

/// A device-reported action outcome meant for the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub target: Target,
    pub category: TopicCategory,
    pub success: bool,
    pub message: Option<String>,
}

impl std::fmt::Display for Notification {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let outcome = if self.success { "succeeded" } else { "failed" };
        write!(f, "{} for {} {}", self.category, self.target, outcome)?;
        if let Some(message) = &self.message {
            write!(f, ": {}", message)?;
        }
        Ok(())
    }
}

/// Why a message produced no registry update at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dropped {
    Protocol(String),
    Addressing(TopicError),
    Unattributable,
}

impl From<CodecError> for Dropped {
    fn from(e: CodecError) -> Self {
        Dropped::Protocol(e.to_string())
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Reconciliation {
    pub follow_ups: Vec<Command>,
    pub notifications: Vec<Notification>,
    /// Devices this message brought from Unknown or Offline to Online.
    pub came_online: Vec<u32>,
    /// Whether any registry value (beyond liveness) changed.
    pub changed: bool,
    /// Module keys of a batched response that could not be mapped to an id.
    pub skipped_modules: Vec<String>,
    pub dropped: Option<Dropped>,
}

#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    settings: ReconcilerSettings,
    registry: DeviceRegistry,
    /// Devices whose one-shot settings fetch already fired this session.
    auto_requested: HashSet<u32>,
}

fn success_of(body: &Map<String, Value>) -> Option<bool> {
    body.get("success").and_then(Value::as_bool)
}

fn message_of(body: &Map<String, Value>) -> Option<String> {
    body.get("message").and_then(Value::as_str).map(str::to_string)
}

fn first_str<'a>(body: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| body.get(*key).and_then(Value::as_str))
}

/// The `settings` sub-object if present, otherwise the body minus its envelope.
fn settings_snapshot(body: &Map<String, Value>) -> Map<String, Value> {
    if let Some(Value::Object(settings)) = body.get("settings") {
        return settings.clone();
    }
    body.iter()
        .filter(|(key, _)| !ENVELOPE_KEYS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

impl Reconciler {
    pub fn new(settings: ReconcilerSettings) -> Self {
        Self {
            settings,
            registry: DeviceRegistry::new(),
            auto_requested: HashSet::new(),
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Forgets which devices already got their auto-fetch. Called on every
    /// successful new connection.
    pub fn reset_session(&mut self) {
        debug!("Clearing {} auto-request entries", self.auto_requested.len());
        self.auto_requested.clear();
    }

    /// Liveness sweep; returns the devices that just went Offline.
    pub fn sweep(&mut self, now: DateTime<Local>) -> Vec<u32> {
        let flipped = self.registry.sweep(now, self.settings.liveness_timeout);
        for id in &flipped {
            info!("Device {:02} went offline", id);
        }
        flipped
    }

    /// Parses a module key such as `bmotion05` into a device id.
    pub fn module_id(&self, key: &str) -> Option<u32> {
        let digits = key.strip_prefix(self.settings.module_prefix.as_str())?;
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }

    /// Single entry point for inbound messages.
    pub fn handle(&mut self, topic: &str, payload: &[u8], now: DateTime<Local>) -> Reconciliation {
        let mut out = Reconciliation::default();

        let parsed = match parse_topic(&self.settings.namespace, topic) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Ignoring message on '{}': {}", topic, e);
                out.dropped = Some(Dropped::Addressing(e));
                return out;
            }
        };

        let body = match codec::decode_bytes(payload) {
            Ok(body) => body,
            Err(e) => {
                warn!("Dropping undecodable payload on '{}': {}", topic, e);
                out.dropped = Some(e.into());
                return out;
            }
        };

        if success_of(&body) == Some(false) {
            out.notifications.push(Notification {
                target: parsed.target,
                category: parsed.category,
                success: false,
                message: message_of(&body),
            });
        } else if parsed.category.is_action() {
            out.notifications.push(Notification {
                target: parsed.target,
                category: parsed.category,
                success: success_of(&body).unwrap_or(false),
                message: message_of(&body),
            });
        }

        match parsed.target {
            Target::Device(id) => self.handle_device(id, parsed.category, &body, now, &mut out),
            Target::All => self.handle_fleet(parsed.category, &body, now, &mut out),
        }
        out
    }

    fn mark_seen(&mut self, id: u32, now: DateTime<Local>, out: &mut Reconciliation) {
        let touch = self.registry.touch(id, now);
        if touch.created {
            info!("First message from device {:02}", id);
        } else if touch.came_online {
            info!("Device {:02} is back online", id);
        }
        if touch.came_online {
            out.came_online.push(id);
        }
    }

    fn handle_device(
        &mut self,
        id: u32,
        category: TopicCategory,
        body: &Map<String, Value>,
        now: DateTime<Local>,
        out: &mut Reconciliation,
    ) {
        self.mark_seen(id, now, out);
        let success = success_of(body) == Some(true);

        if category == TopicCategory::Health {
            let (report, rejected) = HealthReport::from_body(body);
            if !rejected.is_empty() {
                warn!("Device {:02} sent unreadable health fields {:?}, keeping stored values", id, rejected);
            }
            out.changed |= self.registry.merge_health(id, &report);

            if self.auto_requested.insert(id) {
                debug!("First heartbeat from {:02} this session, fetching settings", id);
                out.follow_ups.push(Command::bare(Target::Device(id), CommandKind::Settings));
            }
            return;
        }

        let failed = success_of(body) == Some(false);
        match category {
            TopicCategory::Settings | TopicCategory::Options if failed => {
                debug!("Device {:02} failed {}, keeping stored values", id, category);
            }
            TopicCategory::Settings => {
                self.registry.replace_settings(id, settings_snapshot(body));
                out.changed = true;
            }
            TopicCategory::Options => match codec::extract_options_payload(body) {
                Some(options) => {
                    self.registry.replace_options(id, options);
                    out.changed = true;
                }
                None => debug!("Options response from {:02} carried no options", id),
            },
            TopicCategory::SettingsSet if success => {
                out.follow_ups.push(Command::bare(Target::Device(id), CommandKind::Settings));
            }
            TopicCategory::CameraPower if success => {
                out.follow_ups
                    .push(Command::bare(Target::Device(id), CommandKind::CameraPowerStatus));
            }
            TopicCategory::CameraPowerStatus if success => {
                let status = match body.get("status").or_else(|| body.get("cameraPowerStatus")) {
                    Some(Value::String(raw)) => Some(CameraPowerStatus::parse(raw)),
                    Some(Value::Bool(true)) => Some(CameraPowerStatus::On),
                    Some(Value::Bool(false)) => Some(CameraPowerStatus::Off),
                    _ => None,
                };
                match status {
                    Some(status) => out.changed |= self.registry.set_camera_power(id, status),
                    None => debug!("Camera power response from {:02} carried no status", id),
                }
            }
            TopicCategory::SiteNameSet if success => {
                if let Some(site_name) = first_str(body, &["siteName", "sitename"]) {
                    out.changed |= self.registry.set_site_name(id, site_name);
                }
            }
            TopicCategory::SwUpdate | TopicCategory::SwRollback if success => {
                out.follow_ups
                    .push(Command::bare(Target::Device(id), CommandKind::SoftwareVersion));
            }
            TopicCategory::SwVersion if !failed => {
                if let Some(version) = first_str(body, &["swVersion", "version"]) {
                    out.changed |= self.registry.set_sw_version(id, version);
                }
            }
            _ => {}
        }
    }

    fn handle_fleet(
        &mut self,
        category: TopicCategory,
        body: &Map<String, Value>,
        now: DateTime<Local>,
        out: &mut Reconciliation,
    ) {
        if success_of(body) == Some(false) {
            debug!("Fleet-wide {} reported failure", category);
            return;
        }
        match category {
            TopicCategory::Options => {
                for (id, entry) in self.module_entries(body, out) {
                    let options = codec::extract_options_payload(&entry).unwrap_or(entry);
                    self.mark_seen(id, now, out);
                    self.registry.replace_options(id, options);
                    out.changed = true;
                }
            }
            TopicCategory::Settings if self.settings.fan_out_batch_settings => {
                for (id, entry) in self.module_entries(body, out) {
                    self.mark_seen(id, now, out);
                    self.registry.replace_settings(id, settings_snapshot(&entry));
                    out.changed = true;
                }
            }
            TopicCategory::Settings => {
                debug!("Batched settings response ignored");
                out.dropped = Some(Dropped::Unattributable);
            }
            category if category.is_action() => {
                debug!("Fleet-wide {} response", category);
            }
            category => {
                debug!("Fleet-wide {} message is not attributable to a device", category);
                out.dropped = Some(Dropped::Unattributable);
            }
        }
    }

    /// Per-module entries of a batched response, from `modules` if present,
    /// otherwise from the body itself. Unparsable keys are skipped.
    fn module_entries(
        &self,
        body: &Map<String, Value>,
        out: &mut Reconciliation,
    ) -> Vec<(u32, Map<String, Value>)> {
        let source = match body.get("modules") {
            Some(Value::Object(modules)) => modules,
            _ => body,
        };

        let mut entries = Vec::new();
        for (key, value) in source {
            if ENVELOPE_KEYS.contains(&key.as_str()) {
                continue;
            }
            match (self.module_id(key), value) {
                (Some(id), Value::Object(entry)) => entries.push((id, entry.clone())),
                _ => {
                    warn!("Skipping batched entry '{}': not a module of this fleet", key);
                    out.skipped_modules.push(key.clone());
                }
            }
        }
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reconciler() -> Reconciler {
        Reconciler::new(ReconcilerSettings::default())
    }

    fn send(r: &mut Reconciler, topic: &str, body: Value) -> Reconciliation {
        r.handle(topic, body.to_string().as_bytes(), Local::now())
    }

    #[test]
    fn health_brings_device_online_and_merges_fields() {
        let mut r = reconciler();
        let out = send(
            &mut r,
            "bmtl/status/health/03",
            json!({ "site_name": "quarry", "battery_level": 80, "last_capture_time": "08:00" }),
        );

        assert_eq!(out.came_online, vec![3]);
        assert!(out.changed);
        let record = r.registry().device(3).unwrap();
        assert_eq!(record.is_connected, Some(true));
        assert_eq!(record.site_name.as_deref(), Some("quarry"));
        assert_eq!(record.battery_level, Some(80.0));
    }

    #[test]
    fn mistyped_health_field_only_loses_that_field() {
        let mut r = reconciler();
        let out = send(
            &mut r,
            "bmtl/status/health/03",
            json!({ "site_name": "ridge", "battery_level": 80, "today_total_captures": 12.0 }),
        );
        assert_eq!(out.dropped, None);
        assert_eq!(out.follow_ups, vec![Command::bare(Target::Device(3), CommandKind::Settings)]);
        let record = r.registry().device(3).unwrap();
        assert_eq!(record.site_name.as_deref(), Some("ridge"));
        assert_eq!(record.battery_level, Some(80.0));
        assert_eq!(record.today_total_captures, Some(12));

        let out = send(
            &mut r,
            "bmtl/status/health/07",
            json!({ "site_name": "quarry", "temperature": "21.5", "last_capture_time": "08:00" }),
        );
        assert_eq!(out.follow_ups.len(), 1);
        let record = r.registry().device(7).unwrap();
        assert_eq!(record.site_name.as_deref(), Some("quarry"));
        assert_eq!(record.temperature, Some(21.5));
        assert_eq!(record.last_capture_time.as_deref(), Some("08:00"));

        let out = send(
            &mut r,
            "bmtl/status/health/07",
            json!({ "battery_level": { "pct": 50 }, "missed_captures": 2 }),
        );
        assert!(out.changed);
        let record = r.registry().device(7).unwrap();
        assert_eq!(record.battery_level, None);
        assert_eq!(record.missed_captures, Some(2));
        assert_eq!(record.site_name.as_deref(), Some("quarry"));
    }

    #[test]
    fn settings_fetched_once_per_session() {
        let mut r = reconciler();
        let first = send(&mut r, "bmtl/status/health/03", json!({ "temperature": 20 }));
        assert_eq!(first.follow_ups, vec![Command::bare(Target::Device(3), CommandKind::Settings)]);

        let second = send(&mut r, "bmtl/status/health/03", json!({ "temperature": 21 }));
        assert!(second.follow_ups.is_empty());

        r.reset_session();
        let third = send(&mut r, "bmtl/status/health/03", json!({ "temperature": 21 }));
        assert_eq!(third.follow_ups.len(), 1);
        assert!(!third.changed);
    }

    #[test]
    fn undecodable_payload_is_dropped() {
        let mut r = reconciler();
        let out = r.handle("bmtl/status/health/03", b"not json", Local::now());
        assert!(matches!(out.dropped, Some(Dropped::Protocol(_))));
        assert!(r.registry().device(3).is_none());
    }

    #[test]
    fn unknown_topic_is_ignored() {
        let mut r = reconciler();
        let out = send(&mut r, "bmtl/response/teleport/03", json!({ "success": true }));
        assert!(matches!(out.dropped, Some(Dropped::Addressing(TopicError::UnknownCategory(_)))));
        assert!(r.registry().devices().is_empty());
    }

    #[test]
    fn camera_power_status_updates_only_on_success() {
        let mut r = reconciler();
        send(&mut r, "bmtl/response/camera-power-status/04", json!({ "success": true, "status": "on" }));
        assert_eq!(r.registry().device(4).unwrap().camera_power_status, CameraPowerStatus::On);

        let out = send(
            &mut r,
            "bmtl/response/camera-power-status/04",
            json!({ "success": false, "status": "off", "message": "camera busy" }),
        );
        assert_eq!(r.registry().device(4).unwrap().camera_power_status, CameraPowerStatus::On);
        assert_eq!(out.notifications.len(), 1);
        assert!(!out.notifications[0].success);
        assert_eq!(out.notifications[0].message.as_deref(), Some("camera busy"));
    }

    #[test]
    fn camera_power_response_without_status_keeps_stored_value() {
        let mut r = reconciler();
        send(&mut r, "bmtl/response/camera-power-status/04", json!({ "success": true, "status": "on" }));
        let before = r.registry().device(4).unwrap().last_updated;

        let out = send(
            &mut r,
            "bmtl/response/camera-power-status/04",
            json!({ "success": true, "message": "ok" }),
        );
        assert!(!out.changed);
        let record = r.registry().device(4).unwrap();
        assert_eq!(record.camera_power_status, CameraPowerStatus::On);
        assert!(record.last_updated >= before);
    }

    #[test]
    fn only_liveness_transitions_are_reported_as_came_online() {
        let mut r = reconciler();
        let start = Local::now();
        let out = r.handle("bmtl/response/sw-version/02", br#"{"sw_version": "1.2.0"}"#, start);
        assert_eq!(out.came_online, vec![2]);

        let out = r.handle("bmtl/status/health/02", br#"{"temperature": 20}"#, start);
        assert!(out.came_online.is_empty());

        r.sweep(start + Duration::minutes(5));
        let out = r.handle("bmtl/status/health/02", br#"{"temperature": 20}"#, start + Duration::minutes(6));
        assert_eq!(out.came_online, vec![2]);
    }

    #[test]
    fn sitename_change_applies_on_success_only() {
        let mut r = reconciler();
        send(&mut r, "bmtl/status/health/06", json!({ "site_name": "old" }));

        send(&mut r, "bmtl/response/set/sitename/06", json!({ "success": false, "site_name": "new" }));
        assert_eq!(r.registry().device(6).unwrap().site_name.as_deref(), Some("old"));

        let out = send(&mut r, "bmtl/response/set/sitename/06", json!({ "success": true, "site_name": "new" }));
        assert_eq!(r.registry().device(6).unwrap().site_name.as_deref(), Some("new"));
        assert!(out.notifications[0].success);
    }

    #[test]
    fn successful_actions_trigger_refreshes() {
        let mut r = reconciler();
        let out = send(&mut r, "bmtl/response/set/settings/02", json!({ "success": true }));
        assert_eq!(out.follow_ups, vec![Command::bare(Target::Device(2), CommandKind::Settings)]);

        let out = send(&mut r, "bmtl/response/camera-on-off/02", json!({ "success": true }));
        assert_eq!(
            out.follow_ups,
            vec![Command::bare(Target::Device(2), CommandKind::CameraPowerStatus)]
        );

        let out = send(&mut r, "bmtl/response/sw-rollback/02", json!({ "success": true }));
        assert_eq!(
            out.follow_ups,
            vec![Command::bare(Target::Device(2), CommandKind::SoftwareVersion)]
        );

        let out = send(&mut r, "bmtl/response/sw-update/02", json!({ "success": false }));
        assert!(out.follow_ups.is_empty());
    }

    #[test]
    fn sw_version_response_sets_version() {
        let mut r = reconciler();
        send(&mut r, "bmtl/response/sw-version/08", json!({ "sw_version": "2.4.1" }));
        assert_eq!(r.registry().device(8).unwrap().sw_version.as_deref(), Some("2.4.1"));
    }

    #[test]
    fn settings_response_replaces_snapshot() {
        let mut r = reconciler();
        send(
            &mut r,
            "bmtl/response/settings/01",
            json!({ "success": true, "settings": { "iso_value": 200, "interval_min": 5 } }),
        );
        send(&mut r, "bmtl/response/settings/01", json!({ "iso_value": 400 }));

        let settings = r.registry().settings().get(&1).unwrap();
        assert_eq!(settings.get("isoValue"), Some(&json!(400)));
        assert!(!settings.contains_key("intervalMin"));
    }

    #[test]
    fn failed_settings_response_keeps_previous_snapshot() {
        let mut r = reconciler();
        send(&mut r, "bmtl/response/settings/02", json!({ "success": true, "iso_value": 100 }));
        let out = send(
            &mut r,
            "bmtl/response/settings/02",
            json!({ "success": false, "message": "sd card busy" }),
        );

        assert!(!out.changed);
        assert_eq!(out.notifications.len(), 1);
        assert!(!out.notifications[0].success);
        assert_eq!(r.registry().settings()[&2].get("isoValue"), Some(&json!(100)));
        assert_eq!(r.registry().device(2).unwrap().is_connected, Some(true));
    }

    #[test]
    fn batched_options_fan_out_and_skip_bad_keys() {
        let mut r = reconciler();
        let out = send(
            &mut r,
            "bmtl/response/options/all",
            json!({
                "success": true,
                "modules": {
                    "camera-x": { "options": { "iso": [100] } },
                    "bmotion05": { "options": { "iso": [100, 200] } }
                }
            }),
        );

        assert_eq!(out.skipped_modules, vec!["camera-x".to_string()]);
        assert_eq!(out.came_online, vec![5]);
        assert_eq!(r.registry().options().len(), 1);
        assert_eq!(r.registry().options().get(&5).unwrap().get("iso"), Some(&json!([100, 200])));
    }

    #[test]
    fn batched_settings_are_ignored_by_default() {
        let mut r = reconciler();
        let body = json!({ "bmotion01": { "iso": 100 } });
        let out = send(&mut r, "bmtl/response/settings/all", body.clone());
        assert_eq!(out.dropped, Some(Dropped::Unattributable));
        assert!(r.registry().settings().is_empty());

        let mut r = Reconciler::new(ReconcilerSettings {
            fan_out_batch_settings: true,
            ..Default::default()
        });
        send(&mut r, "bmtl/response/settings/all", body);
        assert_eq!(r.registry().settings().get(&1).unwrap().get("iso"), Some(&json!(100)));
    }

    #[test]
    fn module_ids_need_prefix_and_digits() {
        let r = reconciler();
        assert_eq!(r.module_id("bmotion05"), Some(5));
        assert_eq!(r.module_id("bmotion"), None);
        assert_eq!(r.module_id("bmotion5a"), None);
        assert_eq!(r.module_id("cam05"), None);
    }

    #[test]
    fn sweep_after_timeout_then_revive() {
        let mut r = reconciler();
        let start = Local::now();
        r.handle("bmtl/status/health/03", br#"{"temperature": 20}"#, start);

        assert!(r.sweep(start + Duration::minutes(4)).is_empty());
        assert_eq!(r.sweep(start + Duration::minutes(5)), vec![3]);
        assert_eq!(r.registry().device(3).unwrap().is_connected, Some(false));

        r.handle("bmtl/status/health/03", br#"{"temperature": 20}"#, start + Duration::minutes(6));
        assert_eq!(r.registry().device(3).unwrap().is_connected, Some(true));
    }
}
