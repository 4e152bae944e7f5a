//! Per-run test settings and the field-by-field override merge.
//!
//! Settings are resolved once when a session starts and frozen behind an
//! `Arc` for the rest of the session. Overrides arrive as a JSON object whose
//! values may be numbers, booleans or numeric strings. Unknown keys and bad
//! values never fail a start; they become warnings in the session log.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde_json::Value;

use crate::measurement::Direction;

/// Upper bound on concurrent transfer streams per direction.
pub const MAX_STREAMS: usize = 64;

/// Errors produced while applying settings overrides.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SettingsError {
    #[error("Unknown setting ignored: {key}")]
    UnknownKey { key: String },

    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Error parsing custom settings JSON: {reason}")]
    Malformed { reason: String },
}

/// One stage of the test sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    /// Client identification lookup (`I`)
    ClientLookup,
    /// Download throughput (`D`)
    Download,
    /// Upload throughput (`U`)
    Upload,
    /// Ping and jitter (`P`)
    Ping,
    /// One second pause (`_`)
    Delay,
}

impl Phase {
    /// Maps an order token to its phase.
    pub fn from_token(token: char) -> Option<Self> {
        match token {
            'I' => Some(Self::ClientLookup),
            'D' => Some(Self::Download),
            'U' => Some(Self::Upload),
            'P' => Some(Self::Ping),
            '_' => Some(Self::Delay),
            _ => None,
        }
    }

    /// Returns the order token for this phase.
    pub fn token(self) -> char {
        match self {
            Self::ClientLookup => 'I',
            Self::Download => 'D',
            Self::Upload => 'U',
            Self::Ping => 'P',
            Self::Delay => '_',
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientLookup => write!(f, "client lookup"),
            Self::Download => write!(f, "download"),
            Self::Upload => write!(f, "upload"),
            Self::Ping => write!(f, "ping"),
            Self::Delay => write!(f, "delay"),
        }
    }
}

/// Parsed phase order, e.g. `IP_D_U`.
///
/// Parsing is case-insensitive. Characters that are not phase tokens are
/// dropped and remembered so the session can warn about them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestOrder {
    phases: Vec<Phase>,
    skipped: Vec<char>,
}

impl TestOrder {
    /// Parses an order string.
    pub fn parse(raw: &str) -> Self {
        let mut phases = Vec::with_capacity(raw.len());
        let mut skipped = Vec::new();
        for token in raw.chars().flat_map(char::to_uppercase) {
            match Phase::from_token(token) {
                Some(phase) => phases.push(phase),
                None => skipped.push(token),
            }
        }
        Self { phases, skipped }
    }

    /// Phases in execution order, repeats included.
    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    /// Tokens that were not recognised while parsing.
    pub fn skipped(&self) -> &[char] {
        &self.skipped
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn get(&self, position: usize) -> Option<Phase> {
        self.phases.get(position).copied()
    }
}

impl fmt::Display for TestOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for phase in &self.phases {
            write!(f, "{}", phase.token())?;
        }
        Ok(())
    }
}

/// What a phase does when one of its streams fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Any stream error fails the whole phase.
    FailFast,
    /// The failed stream is replaced by a fresh one at the same index.
    RetryStream,
    /// Failures are absorbed; the stream is dropped without replacement.
    IgnoreAll,
}

impl ErrorPolicy {
    fn from_value(value: &Value) -> Option<Self> {
        if let Some(code) = value.as_u64() {
            return Self::from_code(code);
        }
        match value.as_str()?.trim().to_lowercase().as_str() {
            "0" | "fail" | "fail-fast" => Some(Self::FailFast),
            "1" | "retry" | "retry-stream" => Some(Self::RetryStream),
            "2" | "ignore" | "ignore-all" => Some(Self::IgnoreAll),
            _ => None,
        }
    }

    fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(Self::FailFast),
            1 => Some(Self::RetryStream),
            2 => Some(Self::IgnoreAll),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FailFast => write!(f, "fail-fast"),
            Self::RetryStream => write!(f, "retry-stream"),
            Self::IgnoreAll => write!(f, "ignore-all"),
        }
    }
}

/// Unit base used when converting bits per second for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitBase {
    /// Megabits (10^6 bits)
    Decimal,
    /// Mebibits (2^20 bits)
    Binary,
}

impl UnitBase {
    pub fn divisor(self) -> f64 {
        match self {
            Self::Decimal => 1_000_000.0,
            Self::Binary => 1_048_576.0,
        }
    }
}

/// How much is sent to the telemetry collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TelemetryLevel {
    Disabled,
    /// Results only
    Basic,
    /// Results plus the diagnostic log
    Full,
}

impl TelemetryLevel {
    pub fn is_enabled(self) -> bool {
        self > Self::Disabled
    }

    pub fn includes_log(self) -> bool {
        self == Self::Full
    }

    fn from_value(value: &Value) -> Self {
        match value.as_str().map(|s| s.trim().to_lowercase()).as_deref() {
            Some("basic") => Self::Basic,
            Some("full") => Self::Full,
            _ => match value.as_u64() {
                Some(1) => Self::Basic,
                Some(2) => Self::Full,
                _ => Self::Disabled,
            },
        }
    }
}

/// Distance unit requested from the client lookup service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceUnit {
    Kilometers,
    Miles,
}

impl DistanceUnit {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Kilometers => "km",
            Self::Miles => "mi",
        }
    }
}

/// Server paths used by each phase, relative to the transport's base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub download: String,
    pub upload: String,
    pub ping: String,
    pub client_lookup: String,
    pub telemetry: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            download: "garbage".to_string(),
            upload: "empty".to_string(),
            ping: "empty".to_string(),
            client_lookup: "getIP".to_string(),
            telemetry: "telemetry".to_string(),
        }
    }
}

/// Immutable-per-run configuration of a speed test session.
#[derive(Debug, Clone, PartialEq)]
pub struct TestSettings {
    /// Order in which phases run
    pub order: TestOrder,
    /// Measured download time, after the grace period
    pub download_duration: Duration,
    /// Measured upload time, after the grace period
    pub upload_duration: Duration,
    /// Ramp-up time excluded from the download measurement
    pub download_grace: Duration,
    /// Ramp-up time excluded from the upload measurement
    pub upload_grace: Duration,
    /// Number of latency probes, the first one being a warm-up
    pub ping_count: u32,
    /// Concurrent download streams
    pub download_streams: usize,
    /// Concurrent upload streams
    pub upload_streams: usize,
    /// Start offset between consecutive streams
    pub stream_delay: Duration,
    pub error_policy: ErrorPolicy,
    /// Retries allowed per stream index under `RetryStream` (None = unbounded)
    pub max_stream_retries: Option<u32>,
    /// Upload payload size in MiB
    pub upload_blob_mib: u32,
    /// Size requested from the download source per transfer, in MiB
    pub download_chunk_mib: u32,
    /// Let the transport's preferred concurrency replace defaults
    pub enable_quirks: bool,
    /// Prefer transport-supplied ping timing when it is sane
    pub ping_precise_timing: bool,
    /// Multiplier compensating for transport overhead
    pub overhead_compensation: f64,
    pub unit_base: UnitBase,
    pub telemetry_level: TelemetryLevel,
    /// Opaque string forwarded with telemetry
    pub telemetry_extra: String,
    /// Ask the lookup service for ISP details
    pub client_lookup_isp_info: bool,
    /// Ask the lookup service for a distance estimate in this unit
    pub client_lookup_distance: Option<DistanceUnit>,
    pub endpoints: Endpoints,
}

impl Default for TestSettings {
    fn default() -> Self {
        Self {
            order: TestOrder::parse("IP_D_U"),
            download_duration: Duration::from_secs(15),
            upload_duration: Duration::from_secs(15),
            download_grace: Duration::from_millis(1500),
            upload_grace: Duration::from_secs(3),
            ping_count: 35,
            download_streams: 10,
            upload_streams: 3,
            stream_delay: Duration::from_millis(300),
            error_policy: ErrorPolicy::RetryStream,
            max_stream_retries: None,
            upload_blob_mib: 20,
            download_chunk_mib: 20,
            enable_quirks: true,
            ping_precise_timing: true,
            overhead_compensation: 1.06,
            unit_base: UnitBase::Decimal,
            telemetry_level: TelemetryLevel::Disabled,
            telemetry_extra: String::new(),
            client_lookup_isp_info: true,
            client_lookup_distance: Some(DistanceUnit::Kilometers),
            endpoints: Endpoints::default(),
        }
    }
}

/// Outcome of merging overrides over defaults.
#[derive(Debug, Clone)]
pub struct ResolvedSettings {
    pub settings: TestSettings,
    /// Keys the caller set explicitly
    pub overridden: BTreeSet<String>,
    /// Problems to record in the session log
    pub warnings: Vec<String>,
}

impl TestSettings {
    /// Merges a JSON override payload field-by-field over `defaults`.
    ///
    /// Never fails: malformed payloads, unknown keys and invalid values are
    /// reported in `warnings` and the affected fields keep their defaults.
    pub fn resolve(defaults: &TestSettings, overrides: Option<&str>) -> ResolvedSettings {
        let mut settings = defaults.clone();
        let mut overridden = BTreeSet::new();
        let mut warnings = Vec::new();

        if let Some(raw) = overrides.map(str::trim).filter(|raw| !raw.is_empty()) {
            match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(map)) => {
                    for (key, value) in &map {
                        match settings.apply_override(key, value) {
                            Ok(()) => {
                                overridden.insert(key.clone());
                            }
                            Err(e) => warnings.push(e.to_string()),
                        }
                    }
                }
                Ok(other) => warnings.push(
                    SettingsError::Malformed {
                        reason: format!("expected a JSON object, got {other}"),
                    }
                    .to_string(),
                ),
                Err(e) => warnings.push(
                    SettingsError::Malformed {
                        reason: e.to_string(),
                    }
                    .to_string(),
                ),
            }
        }

        for token in settings.order.skipped() {
            warnings.push(format!("Unknown test order token ignored: {token:?}"));
        }

        ResolvedSettings {
            settings,
            overridden,
            warnings,
        }
    }

    /// Applies a single override.
    ///
    /// # Errors
    /// - `SettingsError::UnknownKey` - Key is not a recognised setting
    /// - `SettingsError::InvalidValue` - Value has the wrong type or range
    pub fn apply_override(&mut self, key: &str, value: &Value) -> Result<(), SettingsError> {
        match key {
            "test_order" => self.order = TestOrder::parse(&text(key, value)?),
            "time_dl" => self.download_duration = seconds(key, value, false)?,
            "time_ul" => self.upload_duration = seconds(key, value, false)?,
            "time_dl_grace" => self.download_grace = seconds(key, value, true)?,
            "time_ul_grace" => self.upload_grace = seconds(key, value, true)?,
            "count_ping" => self.ping_count = count(key, value, 1)? as u32,
            "dl_streams" => self.download_streams = streams(key, value)?,
            "ul_streams" => self.upload_streams = streams(key, value)?,
            "stream_delay_ms" => self.stream_delay = Duration::from_millis(count(key, value, 0)?),
            "error_policy" => {
                self.error_policy = ErrorPolicy::from_value(value)
                    .ok_or_else(|| invalid(key, "expected 0, 1, 2, fail, retry or ignore"))?
            }
            "max_stream_retries" => {
                self.max_stream_retries = match value {
                    Value::Null => None,
                    other => Some(count(key, other, 0)? as u32),
                }
            }
            "ul_blob_megabytes" => self.upload_blob_mib = count(key, value, 1)? as u32,
            "dl_chunk_megabytes" => self.download_chunk_mib = count(key, value, 1)? as u32,
            "enable_quirks" => self.enable_quirks = flag(key, value)?,
            "ping_precise_timing" => self.ping_precise_timing = flag(key, value)?,
            "overhead_compensation" => {
                let factor = number(key, value)?;
                if factor <= 0.0 {
                    return Err(invalid(key, "must be positive"));
                }
                self.overhead_compensation = factor;
            }
            "use_mebibits" => {
                self.unit_base = if flag(key, value)? {
                    UnitBase::Binary
                } else {
                    UnitBase::Decimal
                }
            }
            "telemetry_level" => self.telemetry_level = TelemetryLevel::from_value(value),
            "telemetry_extra" => self.telemetry_extra = text(key, value)?,
            "client_lookup_isp_info" => self.client_lookup_isp_info = flag(key, value)?,
            "client_lookup_distance" => {
                self.client_lookup_distance = match value {
                    Value::Bool(false) | Value::Null => None,
                    other => match text(key, other)?.trim().to_lowercase().as_str() {
                        "km" => Some(DistanceUnit::Kilometers),
                        "mi" => Some(DistanceUnit::Miles),
                        "false" | "" => None,
                        _ => return Err(invalid(key, "expected km, mi or false")),
                    },
                }
            }
            "url_dl" => self.endpoints.download = text(key, value)?,
            "url_ul" => self.endpoints.upload = text(key, value)?,
            "url_ping" => self.endpoints.ping = text(key, value)?,
            "url_client_lookup" => self.endpoints.client_lookup = text(key, value)?,
            "url_telemetry" => self.endpoints.telemetry = text(key, value)?,
            _ => {
                return Err(SettingsError::UnknownKey {
                    key: key.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Measured duration for a throughput direction.
    pub fn duration(&self, direction: Direction) -> Duration {
        match direction {
            Direction::Download => self.download_duration,
            Direction::Upload => self.upload_duration,
        }
    }

    /// Grace period for a throughput direction.
    pub fn grace(&self, direction: Direction) -> Duration {
        match direction {
            Direction::Download => self.download_grace,
            Direction::Upload => self.upload_grace,
        }
    }
}

impl fmt::Display for TestSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "order={} dl={:.1}s+{:.1}s/{} streams ul={:.1}s+{:.1}s/{} streams pings={} \
             delay={}ms policy={} blob={}MiB chunk={}MiB overhead={} unit={:?} telemetry={:?}",
            self.order,
            self.download_duration.as_secs_f64(),
            self.download_grace.as_secs_f64(),
            self.download_streams,
            self.upload_duration.as_secs_f64(),
            self.upload_grace.as_secs_f64(),
            self.upload_streams,
            self.ping_count,
            self.stream_delay.as_millis(),
            self.error_policy,
            self.upload_blob_mib,
            self.download_chunk_mib,
            self.overhead_compensation,
            self.unit_base,
            self.telemetry_level,
        )
    }
}

fn invalid(key: &str, reason: &str) -> SettingsError {
    SettingsError::InvalidValue {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn number(key: &str, value: &Value) -> Result<f64, SettingsError> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|n| n.is_finite())
    .ok_or_else(|| invalid(key, "expected a number"))
}

fn seconds(key: &str, value: &Value, allow_zero: bool) -> Result<Duration, SettingsError> {
    let secs = number(key, value)?;
    if secs < 0.0 || (!allow_zero && secs == 0.0) {
        return Err(invalid(key, "out of range"));
    }
    Duration::try_from_secs_f64(secs).map_err(|_| invalid(key, "out of range"))
}

fn streams(key: &str, value: &Value) -> Result<usize, SettingsError> {
    let n = count(key, value, 1)?;
    if n > MAX_STREAMS as u64 {
        return Err(invalid(key, &format!("at most {MAX_STREAMS} streams")));
    }
    Ok(n as usize)
}

fn count(key: &str, value: &Value, min: u64) -> Result<u64, SettingsError> {
    let n = number(key, value)?;
    if n.fract() != 0.0 || n < min as f64 || n > u32::MAX as f64 {
        return Err(invalid(key, &format!("expected a whole number >= {min}")));
    }
    Ok(n as u64)
}

fn flag(key: &str, value: &Value) -> Result<bool, SettingsError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => Ok(n.as_f64().is_some_and(|n| n != 0.0)),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            _ => Err(invalid(key, "expected a boolean")),
        },
        _ => Err(invalid(key, "expected a boolean")),
    }
}

fn text(key: &str, value: &Value) -> Result<String, SettingsError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(invalid(key, "expected a string")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = TestSettings::default();
        assert_eq!(settings.order.to_string(), "IP_D_U");
        assert_eq!(settings.download_duration, Duration::from_secs(15));
        assert_eq!(settings.download_grace, Duration::from_millis(1500));
        assert_eq!(settings.upload_grace, Duration::from_secs(3));
        assert_eq!(settings.ping_count, 35);
        assert_eq!(settings.download_streams, 10);
        assert_eq!(settings.upload_streams, 3);
        assert_eq!(settings.error_policy, ErrorPolicy::RetryStream);
        assert_eq!(settings.overhead_compensation, 1.06);
        assert_eq!(settings.telemetry_level, TelemetryLevel::Disabled);
    }

    #[test]
    fn test_order_parsing_is_case_insensitive_and_skips_unknown() {
        let order = TestOrder::parse("ip_x_d");
        assert_eq!(
            order.phases(),
            &[
                Phase::ClientLookup,
                Phase::Ping,
                Phase::Delay,
                Phase::Delay,
                Phase::Download
            ]
        );
        assert_eq!(order.skipped(), &['X']);
        assert_eq!(order.to_string(), "IP__D");
    }

    #[test]
    fn test_resolve_merges_known_keys() {
        let resolved = TestSettings::resolve(
            &TestSettings::default(),
            Some(r#"{"time_dl": "10", "count_ping": 50, "error_policy": 0, "use_mebibits": true}"#),
        );
        assert!(resolved.warnings.is_empty(), "{:?}", resolved.warnings);
        assert_eq!(resolved.settings.download_duration, Duration::from_secs(10));
        assert_eq!(resolved.settings.ping_count, 50);
        assert_eq!(resolved.settings.error_policy, ErrorPolicy::FailFast);
        assert_eq!(resolved.settings.unit_base, UnitBase::Binary);
        assert!(resolved.overridden.contains("time_dl"));
        assert!(!resolved.overridden.contains("time_ul"));
    }

    #[test]
    fn test_resolve_warns_on_unknown_key() {
        let resolved = TestSettings::resolve(
            &TestSettings::default(),
            Some(r#"{"bogus": 1, "time_ul": 5}"#),
        );
        assert_eq!(resolved.warnings, vec!["Unknown setting ignored: bogus"]);
        assert_eq!(resolved.settings.upload_duration, Duration::from_secs(5));
    }

    #[test]
    fn test_resolve_keeps_defaults_on_malformed_json() {
        let resolved = TestSettings::resolve(&TestSettings::default(), Some("{not json"));
        assert_eq!(resolved.warnings.len(), 1);
        assert!(resolved.warnings[0].starts_with("Error parsing custom settings JSON"));
        assert_eq!(resolved.settings, TestSettings::default());
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let resolved = TestSettings::resolve(
            &TestSettings::default(),
            Some(r#"{"dl_streams": 0, "time_dl": -3, "overhead_compensation": "abc"}"#),
        );
        assert_eq!(resolved.warnings.len(), 3);
        assert_eq!(resolved.settings.download_streams, 10);
        assert_eq!(resolved.settings.download_duration, Duration::from_secs(15));
        assert_eq!(resolved.settings.overhead_compensation, 1.06);
    }

    #[test]
    fn test_telemetry_level_parsing() {
        let mut settings = TestSettings::default();
        settings
            .apply_override("telemetry_level", &Value::from("full"))
            .unwrap();
        assert_eq!(settings.telemetry_level, TelemetryLevel::Full);
        settings
            .apply_override("telemetry_level", &Value::from("nonsense"))
            .unwrap();
        assert_eq!(settings.telemetry_level, TelemetryLevel::Disabled);
    }

    #[test]
    fn test_distance_can_be_disabled() {
        let mut settings = TestSettings::default();
        settings
            .apply_override("client_lookup_distance", &Value::Bool(false))
            .unwrap();
        assert_eq!(settings.client_lookup_distance, None);
        settings
            .apply_override("client_lookup_distance", &Value::from("mi"))
            .unwrap();
        assert_eq!(settings.client_lookup_distance, Some(DistanceUnit::Miles));
    }

    #[test]
    fn test_order_warnings_from_resolve() {
        let resolved =
            TestSettings::resolve(&TestSettings::default(), Some(r#"{"test_order": "D?U"}"#));
        assert_eq!(resolved.settings.order.to_string(), "DU");
        assert_eq!(resolved.warnings.len(), 1);
    }

    #[test]
    fn test_huge_duration_is_rejected() {
        let resolved = TestSettings::resolve(
            &TestSettings::default(),
            Some(r#"{"time_dl": 1e300, "time_ul": "1e20"}"#),
        );
        assert_eq!(resolved.warnings.len(), 2);
        assert_eq!(resolved.warnings[0], "Invalid value for time_dl: out of range");
        assert_eq!(resolved.warnings[1], "Invalid value for time_ul: out of range");
        assert_eq!(resolved.settings.download_duration, Duration::from_secs(15));
        assert_eq!(resolved.settings.upload_duration, Duration::from_secs(15));
    }

    #[test]
    fn test_stream_counts_are_capped() {
        let resolved = TestSettings::resolve(
            &TestSettings::default(),
            Some(r#"{"dl_streams": 1000000, "ul_streams": 64}"#),
        );
        assert_eq!(
            resolved.warnings,
            vec!["Invalid value for dl_streams: at most 64 streams"]
        );
        assert_eq!(resolved.settings.download_streams, 10);
        assert_eq!(resolved.settings.upload_streams, MAX_STREAMS);
    }
}
