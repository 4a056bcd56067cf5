//! Device registry: one record per device id, plus the latest settings and
//! options snapshots each device reported.

use chrono::{DateTime, Duration, Local};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraPowerStatus {
    On,
    Off,
    Error,
    #[default]
    Unknown,
}

impl CameraPowerStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "on" | "true" => CameraPowerStatus::On,
            "off" | "false" => CameraPowerStatus::Off,
            "error" => CameraPowerStatus::Error,
            _ => CameraPowerStatus::Unknown,
        }
    }
}

impl fmt::Display for CameraPowerStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = match self {
            CameraPowerStatus::On => "on",
            CameraPowerStatus::Off => "off",
            CameraPowerStatus::Error => "error",
            CameraPowerStatus::Unknown => "unknown",
        };
        write!(f, "{}", text)
    }
}

/// Telemetry fields of a health message. Absent fields leave the record alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthReport {
    pub site_name: Option<String>,
    pub storage_used: Option<f64>,
    pub temperature: Option<f64>,
    pub battery_level: Option<f64>,
    pub today_total_captures: Option<u64>,
    pub today_captured_count: Option<u64>,
    pub missed_captures: Option<u64>,
    pub last_capture_time: Option<String>,
    pub last_boot_time: Option<String>,
    pub sw_version: Option<String>,
}

impl HealthReport {
    /// Reads each known field of a decoded (camelCase) health body on its own.
    /// Numbers sent as strings and integral floats for counters are accepted.
    /// A field that still does not fit is left out and its key returned.
    pub fn from_body(body: &Map<String, Value>) -> (Self, Vec<String>) {
        let mut rejected = Vec::new();
        let mut text = |key: &str| read_field(body, key, lenient_string, &mut rejected);
        let site_name = text("siteName");
        let last_capture_time = text("lastCaptureTime");
        let last_boot_time = text("lastBootTime");
        let sw_version = text("swVersion");
        let mut number = |key: &str| read_field(body, key, lenient_f64, &mut rejected);
        let storage_used = number("storageUsed");
        let temperature = number("temperature");
        let battery_level = number("batteryLevel");
        let mut counter = |key: &str| read_field(body, key, lenient_u64, &mut rejected);
        let today_total_captures = counter("todayTotalCaptures");
        let today_captured_count = counter("todayCapturedCount");
        let missed_captures = counter("missedCaptures");

        let report = HealthReport {
            site_name,
            storage_used,
            temperature,
            battery_level,
            today_total_captures,
            today_captured_count,
            missed_captures,
            last_capture_time,
            last_boot_time,
            sw_version,
        };
        (report, rejected)
    }
}

fn read_field<T>(
    body: &Map<String, Value>,
    key: &str,
    parse: fn(&Value) -> Option<T>,
    rejected: &mut Vec<String>,
) -> Option<T> {
    match body.get(key) {
        None | Some(Value::Null) => None,
        Some(value) => {
            let parsed = parse(value);
            if parsed.is_none() {
                rejected.push(key.to_string());
            }
            parsed
        }
    }
}

fn lenient_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn lenient_f64(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

fn lenient_u64(value: &Value) -> Option<u64> {
    let whole = |v: f64| (v >= 0.0 && v.fract() == 0.0 && v < u64::MAX as f64).then_some(v as u64);
    match value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().and_then(whole)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<u64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(whole))
        }
        _ => None,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    /// `None` until the first message from this device.
    pub is_connected: Option<bool>,
    pub site_name: Option<String>,
    pub storage_used: Option<f64>,
    pub temperature: Option<f64>,
    pub battery_level: Option<f64>,
    pub today_total_captures: Option<u64>,
    pub today_captured_count: Option<u64>,
    pub missed_captures: Option<u64>,
    pub last_capture_time: Option<String>,
    pub last_boot_time: Option<String>,
    pub sw_version: Option<String>,
    pub camera_power_status: CameraPowerStatus,
    pub last_updated: Option<DateTime<Local>>,
}

macro_rules! merge_fields {
    ($record:expr, $report:expr, $changed:ident, [$($field:ident),* $(,)?]) => {
        $(
            if let Some(value) = &$report.$field {
                if $record.$field.as_ref() != Some(value) {
                    $record.$field = Some(value.clone());
                    $changed = true;
                }
            }
        )*
    };
}

impl DeviceRecord {
    /// Overwrites only the fields present in `report`. Returns whether any
    /// value actually changed.
    pub fn merge(&mut self, report: &HealthReport) -> bool {
        let mut changed = false;
        merge_fields!(
            self,
            report,
            changed,
            [
                site_name,
                storage_used,
                temperature,
                battery_level,
                today_total_captures,
                today_captured_count,
                missed_captures,
                last_capture_time,
                last_boot_time,
                sw_version,
            ]
        );
        changed
    }

    pub fn is_online(&self) -> bool {
        self.is_connected == Some(true)
    }
}

/// Result of stamping a device as seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Touch {
    /// The device was Unknown or Offline before this message.
    pub came_online: bool,
    /// The record did not exist yet.
    pub created: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<u32, DeviceRecord>,
    settings: BTreeMap<u32, Map<String, Value>>,
    options: BTreeMap<u32, Map<String, Value>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device(&self, id: u32) -> Option<&DeviceRecord> {
        self.devices.get(&id)
    }

    pub fn devices(&self) -> &BTreeMap<u32, DeviceRecord> {
        &self.devices
    }

    pub fn settings(&self) -> &BTreeMap<u32, Map<String, Value>> {
        &self.settings
    }

    pub fn options(&self) -> &BTreeMap<u32, Map<String, Value>> {
        &self.options
    }

    /// Marks the device Online and refreshes `last_updated`, creating the
    /// record on first sight.
    pub fn touch(&mut self, id: u32, now: DateTime<Local>) -> Touch {
        let created = !self.devices.contains_key(&id);
        let record = self.devices.entry(id).or_default();
        let came_online = !record.is_online();
        record.is_connected = Some(true);
        record.last_updated = Some(now);
        Touch {
            came_online,
            created,
        }
    }

    /// Merges a health report into the device record. Liveness is left to
    /// `touch`. Returns whether any telemetry field changed.
    pub fn merge_health(&mut self, id: u32, report: &HealthReport) -> bool {
        self.devices.entry(id).or_default().merge(report)
    }

    pub fn set_camera_power(&mut self, id: u32, status: CameraPowerStatus) -> bool {
        let record = self.devices.entry(id).or_default();
        let changed = record.camera_power_status != status;
        record.camera_power_status = status;
        changed
    }

    pub fn set_site_name(&mut self, id: u32, site_name: &str) -> bool {
        let record = self.devices.entry(id).or_default();
        let changed = record.site_name.as_deref() != Some(site_name);
        record.site_name = Some(site_name.to_string());
        changed
    }

    pub fn set_sw_version(&mut self, id: u32, version: &str) -> bool {
        let record = self.devices.entry(id).or_default();
        let changed = record.sw_version.as_deref() != Some(version);
        record.sw_version = Some(version.to_string());
        changed
    }

    /// Settings are a point-in-time snapshot and replace the previous one.
    pub fn replace_settings(&mut self, id: u32, settings: Map<String, Value>) {
        self.settings.insert(id, settings);
    }

    /// Options are a point-in-time snapshot and replace the previous one.
    pub fn replace_options(&mut self, id: u32, options: Map<String, Value>) {
        self.options.insert(id, options);
    }

    /// Flips every Online device silent for longer than `timeout` to Offline.
    /// Unknown and Offline devices are never touched.
    pub fn sweep(&mut self, now: DateTime<Local>, timeout: Duration) -> Vec<u32> {
        let mut flipped = Vec::new();
        for (id, record) in self.devices.iter_mut() {
            if !record.is_online() {
                continue;
            }
            let stale = record
                .last_updated
                .map(|seen| now.signed_duration_since(seen) >= timeout)
                .unwrap_or(true);
            if stale {
                record.is_connected = Some(false);
                flipped.push(*id);
            }
        }
        flipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> HealthReport {
        HealthReport {
            site_name: Some("quarry".to_string()),
            battery_level: Some(87.0),
            last_capture_time: Some("2026-10-19T08:00:00".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn unseen_devices_are_unknown() {
        let mut registry = DeviceRegistry::new();
        assert!(registry.device(4).is_none());

        registry.set_camera_power(4, CameraPowerStatus::On);
        assert_eq!(registry.device(4).unwrap().is_connected, None);
    }

    #[test]
    fn first_touch_creates_and_brings_online() {
        let mut registry = DeviceRegistry::new();
        let now = Local::now();

        let touch = registry.touch(3, now);
        assert!(touch.came_online && touch.created);

        let touch = registry.touch(3, now);
        assert!(!touch.came_online && !touch.created);
        assert_eq!(registry.device(3).unwrap().is_connected, Some(true));
    }

    #[test]
    fn absent_fields_are_not_clobbered() {
        let mut registry = DeviceRegistry::new();
        registry.merge_health(1, &report());

        let partial = HealthReport {
            temperature: Some(21.5),
            ..Default::default()
        };
        assert!(registry.merge_health(1, &partial));

        let record = registry.device(1).unwrap();
        assert_eq!(record.site_name.as_deref(), Some("quarry"));
        assert_eq!(record.battery_level, Some(87.0));
        assert_eq!(record.temperature, Some(21.5));
    }

    #[test]
    fn unchanged_report_still_refreshes_last_updated() {
        let mut registry = DeviceRegistry::new();
        let first = Local::now();
        registry.touch(2, first);
        registry.merge_health(2, &report());

        let later = first + Duration::seconds(45);
        let touch = registry.touch(2, later);
        assert!(!registry.merge_health(2, &report()));
        assert!(!touch.came_online);
        assert_eq!(registry.device(2).unwrap().last_updated, Some(later));
    }

    #[test]
    fn sweep_only_moves_online_to_offline() {
        let mut registry = DeviceRegistry::new();
        let start = Local::now();
        let timeout = Duration::minutes(5);
        registry.touch(1, start);
        registry.touch(2, start + Duration::minutes(4));
        registry.set_site_name(9, "never seen");

        let flipped = registry.sweep(start + Duration::minutes(5), timeout);
        assert_eq!(flipped, vec![1]);
        assert_eq!(registry.device(1).unwrap().is_connected, Some(false));
        assert_eq!(registry.device(2).unwrap().is_connected, Some(true));
        assert_eq!(registry.device(9).unwrap().is_connected, None);

        // Offline devices stay offline until a message arrives.
        assert!(registry.sweep(start + Duration::minutes(30), timeout).contains(&2));
        assert!(registry.sweep(start + Duration::minutes(40), timeout).is_empty());

        let touch = registry.touch(1, start + Duration::minutes(41));
        assert!(touch.came_online);
        assert_eq!(registry.device(1).unwrap().is_connected, Some(true));
    }

    #[test]
    fn settings_are_replaced_not_merged() {
        let mut registry = DeviceRegistry::new();
        let mut first = Map::new();
        first.insert("iso".to_string(), Value::from(100));
        first.insert("quality".to_string(), Value::from("fine"));
        registry.replace_settings(5, first);

        let mut second = Map::new();
        second.insert("iso".to_string(), Value::from(400));
        registry.replace_settings(5, second);

        let settings = registry.settings().get(&5).unwrap();
        assert_eq!(settings.len(), 1);
        assert_eq!(settings.get("iso"), Some(&Value::from(400)));
    }

    #[test]
    fn health_fields_are_read_one_by_one() {
        let body = serde_json::json!({
            "siteName": "ridge",
            "batteryLevel": 80,
            "temperature": "21.5",
            "todayTotalCaptures": 12.0,
            "todayCapturedCount": "7",
            "missedCaptures": 1.5,
            "storageUsed": [1, 2],
            "lastCaptureTime": "08:00",
            "swVersion": 3,
            "lastBootTime": null
        });
        let Value::Object(body) = body else { unreachable!() };

        let (report, mut rejected) = HealthReport::from_body(&body);
        rejected.sort();
        assert_eq!(rejected, vec!["missedCaptures".to_string(), "storageUsed".to_string()]);
        assert_eq!(report.site_name.as_deref(), Some("ridge"));
        assert_eq!(report.battery_level, Some(80.0));
        assert_eq!(report.temperature, Some(21.5));
        assert_eq!(report.today_total_captures, Some(12));
        assert_eq!(report.today_captured_count, Some(7));
        assert_eq!(report.missed_captures, None);
        assert_eq!(report.storage_used, None);
        assert_eq!(report.last_capture_time.as_deref(), Some("08:00"));
        assert_eq!(report.sw_version.as_deref(), Some("3"));
        assert_eq!(report.last_boot_time, None);
    }

    #[test]
    fn camera_power_parsing() {
        assert_eq!(CameraPowerStatus::parse("ON"), CameraPowerStatus::On);
        assert_eq!(CameraPowerStatus::parse("off"), CameraPowerStatus::Off);
        assert_eq!(CameraPowerStatus::parse("error"), CameraPowerStatus::Error);
        assert_eq!(CameraPowerStatus::parse("maybe"), CameraPowerStatus::Unknown);
    }
}
