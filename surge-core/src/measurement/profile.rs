//! Transfer profile chosen once per session from transport capabilities.

use std::collections::BTreeSet;
use std::fmt;

use crate::measurement::Direction;
use crate::network::TransportCapabilities;
use crate::session::TestSettings;

const MIB: usize = 1024 * 1024;

/// Payload size of the small-chunk upload strategy.
pub const SMALL_CHUNK_BYTES: usize = 256 * 1024;

/// How upload streams feed bytes to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStrategy {
    /// One large payload per transfer with live progress
    Streaming,
    /// Many small payloads, each counted when it completes
    SmallChunks,
}

/// Concurrency and payload choices the samplers run with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProfile {
    pub download_streams: usize,
    pub upload_streams: usize,
    pub upload_strategy: UploadStrategy,
    pub upload_blob_mib: u32,
    /// Use transport ping timings when they are sane
    pub precise_timing: bool,
}

impl TransferProfile {
    /// Resolves the profile for `capabilities` under `settings`.
    ///
    /// Preferred stream counts only apply with quirks enabled and when the
    /// caller did not set the count explicitly. The blob cap always applies.
    pub fn detect(
        capabilities: &TransportCapabilities,
        settings: &TestSettings,
        overridden: &BTreeSet<String>,
    ) -> Self {
        let quirk = |preferred: Option<usize>, key: &str, configured: usize| match preferred {
            Some(count) if settings.enable_quirks && !overridden.contains(key) => count.max(1),
            _ => configured,
        };

        let upload_blob_mib = match capabilities.max_upload_blob_mib {
            Some(cap) => settings.upload_blob_mib.min(cap.max(1)),
            None => settings.upload_blob_mib,
        };

        Self {
            download_streams: quirk(
                capabilities.preferred_download_streams,
                "dl_streams",
                settings.download_streams,
            ),
            upload_streams: quirk(
                capabilities.preferred_upload_streams,
                "ul_streams",
                settings.upload_streams,
            ),
            upload_strategy: if capabilities.upload_progress {
                UploadStrategy::Streaming
            } else {
                UploadStrategy::SmallChunks
            },
            upload_blob_mib,
            precise_timing: capabilities.precise_timing && settings.ping_precise_timing,
        }
    }

    pub fn streams(&self, direction: Direction) -> usize {
        match direction {
            Direction::Download => self.download_streams,
            Direction::Upload => self.upload_streams,
        }
    }

    /// Size of each upload transfer in bytes.
    pub fn upload_payload_bytes(&self) -> usize {
        match self.upload_strategy {
            UploadStrategy::Streaming => self.upload_blob_mib as usize * MIB,
            UploadStrategy::SmallChunks => SMALL_CHUNK_BYTES,
        }
    }
}

impl fmt::Display for TransferProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dl_streams={} ul_streams={} upload={:?} blob={}MiB precise_timing={}",
            self.download_streams,
            self.upload_streams,
            self.upload_strategy,
            self.upload_blob_mib,
            self.precise_timing
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quirky_transport() -> TransportCapabilities {
        TransportCapabilities {
            upload_progress: false,
            precise_timing: true,
            preferred_download_streams: Some(4),
            preferred_upload_streams: Some(1),
            max_upload_blob_mib: Some(4),
        }
    }

    #[test]
    fn test_default_capabilities_keep_settings() {
        let settings = TestSettings::default();
        let profile =
            TransferProfile::detect(&TransportCapabilities::default(), &settings, &BTreeSet::new());

        assert_eq!(profile.download_streams, 10);
        assert_eq!(profile.upload_streams, 3);
        assert_eq!(profile.upload_strategy, UploadStrategy::Streaming);
        assert_eq!(profile.upload_payload_bytes(), 20 * MIB);
        assert!(!profile.precise_timing);
    }

    #[test]
    fn test_quirks_apply_unless_overridden() {
        let settings = TestSettings::default();
        let overridden = BTreeSet::from(["ul_streams".to_string()]);
        let profile = TransferProfile::detect(&quirky_transport(), &settings, &overridden);

        assert_eq!(profile.download_streams, 4);
        assert_eq!(profile.upload_streams, 3);
        assert_eq!(profile.upload_strategy, UploadStrategy::SmallChunks);
        assert_eq!(profile.upload_payload_bytes(), SMALL_CHUNK_BYTES);
        assert_eq!(profile.upload_blob_mib, 4);
        assert!(profile.precise_timing);
    }

    #[test]
    fn test_quirks_disabled_still_caps_blob() {
        let settings = TestSettings {
            enable_quirks: false,
            ping_precise_timing: false,
            ..TestSettings::default()
        };
        let profile = TransferProfile::detect(&quirky_transport(), &settings, &BTreeSet::new());

        assert_eq!(profile.download_streams, 10);
        assert_eq!(profile.upload_streams, 3);
        assert_eq!(profile.upload_blob_mib, 4);
        assert!(!profile.precise_timing);
    }
}
