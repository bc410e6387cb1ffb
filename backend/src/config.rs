use clap::{ArgAction, Parser};
use std::path::PathBuf;

use crate::pipeline::IngestPolicy;

/// Every option can be given as a flag or through its environment variable.
#[derive(Debug, Clone, Parser)]
#[command(name = "fieldlink-ingest", version, about = "FieldLink device telemetry ingestion server")]
pub struct Config {
    /// HTTP listen port
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Postgres URL for the device registry and reading table; in-memory store when unset
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Reject requests without a valid HMAC signature
    #[arg(long, env = "TELEMETRY_REQUIRE_SIGNATURE", default_value_t = true, action = ArgAction::Set)]
    pub require_signature: bool,

    /// Register unknown devices on first contact using X-Device-Secret (bring-up only)
    #[arg(long, env = "TELEMETRY_ALLOW_AUTO_REGISTER", default_value_t = false, action = ArgAction::Set)]
    pub allow_auto_register: bool,

    /// Maximum |server clock - X-Timestamp| in milliseconds
    #[arg(long, env = "TELEMETRY_MAX_SKEW_MS", default_value_t = 300_000)]
    pub max_skew_ms: i64,

    /// How long a (device, nonce) pair blocks reuse, in milliseconds
    #[arg(long, env = "TELEMETRY_NONCE_TTL_MS", default_value_t = 600_000)]
    pub nonce_ttl_ms: i64,

    /// Nonce cache size that triggers an eviction pass
    #[arg(long, env = "TELEMETRY_NONCE_CACHE_MAX", default_value_t = 100_000)]
    pub nonce_cache_max: usize,

    /// Append readings to per-device daily files when the registry can't take them
    #[arg(long, env = "TELEMETRY_FILE_FALLBACK", default_value_t = false, action = ArgAction::Set)]
    pub file_fallback: bool,

    /// Output directory for fallback files
    #[arg(long, env = "TELEMETRY_FALLBACK_DIR", default_value = "./telemetry-fallback")]
    pub fallback_dir: PathBuf,

    /// Maximum envelopes per batch request
    #[arg(long, env = "TELEMETRY_MAX_BATCH", default_value_t = 2000)]
    pub max_batch_items: usize,

    /// Request body limit in bytes
    #[arg(long, env = "TELEMETRY_MAX_BODY_BYTES", default_value_t = 8 * 1024 * 1024)]
    pub max_body_bytes: usize,

    /// Devices to preload into the in-memory registry, as `id=secret`
    #[arg(long, env = "TELEMETRY_SEED_DEVICES", value_delimiter = ',')]
    pub seed_devices: Vec<String>,
}

impl Config {
    pub fn policy(&self) -> IngestPolicy {
        IngestPolicy {
            require_signature: self.require_signature,
            allow_auto_register: self.allow_auto_register,
            max_skew_ms: self.max_skew_ms,
            file_fallback: self.file_fallback,
            fallback_dir: self.fallback_dir.clone(),
            max_batch_items: self.max_batch_items,
        }
    }

    pub fn seeded_devices(&self) -> Result<Vec<(String, String)>, String> {
        self.seed_devices
            .iter()
            .filter(|s| !s.trim().is_empty())
            .map(|s| match s.trim().split_once('=') {
                Some((id, secret)) if !id.is_empty() && !secret.is_empty() => Ok((id.to_string(), secret.to_string())),
                _ => Err(format!("seed device must be id=secret, got {s:?}")),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = Config::try_parse_from(["fieldlink-ingest"]).unwrap();
        assert!(c.require_signature);
        assert!(!c.allow_auto_register);
        assert!(!c.file_fallback);
        assert_eq!(c.max_skew_ms, 300_000);
        assert_eq!(c.policy().max_batch_items, 2000);
    }

    #[test]
    fn test_flags() {
        let c = Config::try_parse_from([
            "fieldlink-ingest",
            "--require-signature", "false",
            "--file-fallback", "true",
            "--fallback-dir", "/var/lib/fieldlink",
            "--seed-devices", "D1=a,D2=b",
        ])
        .unwrap();
        assert!(!c.require_signature);
        assert!(c.policy().file_fallback);
        assert_eq!(c.policy().fallback_dir, PathBuf::from("/var/lib/fieldlink"));
        assert_eq!(c.seeded_devices().unwrap(), vec![("D1".into(), "a".into()), ("D2".into(), "b".into())]);
    }

    #[test]
    fn test_bad_seed() {
        let c = Config::try_parse_from(["fieldlink-ingest", "--seed-devices", "D1"]).unwrap();
        assert!(c.seeded_devices().is_err());
    }
}
