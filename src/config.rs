use crate::{
    models::object::AccessPolicy,
    services::{
        deadline_copy::DEFAULT_TRANSFER_DEADLINE, key_generator::DEFAULT_KEY_RANDOM_BYTES,
        signing::DEFAULT_SIGNED_URL_TTL,
    },
};
use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, fmt::Display, net::IpAddr, path::PathBuf, str::FromStr, time::Duration};

/// Content type recorded when an upload does not declare one.
pub const DEFAULT_CONTENT_TYPE: &str = "image/jpeg";

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub bucket: String,
    pub storage_dir: String,
    pub database_url: String,
    pub public_base_url: String,
    pub access_id_file: Option<PathBuf>,
    pub private_key_file: Option<PathBuf>,
    pub policy: GatewayPolicy,
}

/// Per-request behavior shared by every upload and download.
#[derive(Debug, Clone)]
pub struct GatewayPolicy {
    /// Wall-clock budget for a whole upload body.
    pub transfer_deadline: Duration,
    /// Lifetime of issued download URLs.
    pub signed_url_ttl: Duration,
    /// Random bytes in each generated key prefix.
    pub key_random_bytes: usize,
    pub default_content_type: String,
    /// ACL set on every object at creation. Public read unless configured
    /// otherwise.
    pub access_policy: AccessPolicy,
}

impl Default for GatewayPolicy {
    fn default() -> Self {
        Self {
            transfer_deadline: DEFAULT_TRANSFER_DEADLINE,
            signed_url_ttl: DEFAULT_SIGNED_URL_TTL,
            key_random_bytes: DEFAULT_KEY_RANDOM_BYTES,
            default_content_type: DEFAULT_CONTENT_TYPE.into(),
            access_policy: AccessPolicy::public_read(),
        }
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Upload gateway handing out signed download URLs")]
pub struct Args {
    /// Host to bind to (overrides GAEFILE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides GAEFILE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Bucket objects are written to (overrides GAEFILE_BUCKET)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Directory where objects are stored (overrides GAEFILE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides GAEFILE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Origin signed URLs point at (overrides GAEFILE_PUBLIC_BASE_URL)
    #[arg(long)]
    pub public_base_url: Option<String>,

    /// File holding the signing access id (overrides GAEFILE_ACCESS_ID_FILE)
    #[arg(long)]
    pub access_id_file: Option<PathBuf>,

    /// PKCS#8 PEM P-256 private key (overrides GAEFILE_PRIVATE_KEY_FILE)
    #[arg(long)]
    pub private_key_file: Option<PathBuf>,

    /// Upload deadline in seconds (overrides GAEFILE_TRANSFER_DEADLINE_SECS)
    #[arg(long)]
    pub transfer_deadline_secs: Option<u64>,

    /// Signed URL lifetime in seconds (overrides GAEFILE_SIGNED_URL_TTL_SECS)
    #[arg(long)]
    pub signed_url_ttl_secs: Option<u64>,

    /// Random bytes per key prefix (overrides GAEFILE_KEY_RANDOM_BYTES)
    #[arg(long)]
    pub key_random_bytes: Option<usize>,

    /// Content type for uploads without one (overrides GAEFILE_DEFAULT_CONTENT_TYPE)
    #[arg(long)]
    pub default_content_type: Option<String>,

    /// Do not grant public read on new objects (or set GAEFILE_PRIVATE_OBJECTS)
    #[arg(long)]
    pub private_objects: bool,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        Self::resolve(Args::parse(), |name| env::var(name))
    }

    /// Merge `args` over values looked up with `env`.
    pub fn resolve<F>(args: Args, env: F) -> Result<(Self, bool)>
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        let env_str = |name: &str| -> Result<Option<String>> {
            match env(name) {
                Ok(value) => Ok(Some(value)),
                Err(env::VarError::NotPresent) => Ok(None),
                Err(err) => Err(err).with_context(|| format!("reading {}", name)),
            }
        };

        let host = match args.host {
            Some(host) => host,
            None => env_str("GAEFILE_HOST")?.unwrap_or_else(|| "0.0.0.0".into()),
        };
        let port = match args.port {
            Some(port) => port,
            None => parse_env(&env_str, "GAEFILE_PORT", 3000)?,
        };
        let bucket = match args.bucket {
            Some(bucket) => bucket,
            None => env_str("GAEFILE_BUCKET")?
                .context("bucket name is required (--bucket or GAEFILE_BUCKET)")?,
        };
        if bucket.trim().is_empty() {
            bail!("bucket name must not be empty");
        }
        let storage_dir = match args.storage_dir {
            Some(dir) => dir,
            None => env_str("GAEFILE_STORAGE_DIR")?.unwrap_or_else(|| "./data/objects".into()),
        };
        let database_url = match args.database_url {
            Some(url) => url,
            None => env_str("GAEFILE_DATABASE_URL")?
                .unwrap_or_else(|| "sqlite://./data/meta/gaefile.db?mode=rwc".into()),
        };
        let public_base_url = match args.public_base_url {
            Some(url) => url,
            None => env_str("GAEFILE_PUBLIC_BASE_URL")?
                .unwrap_or_else(|| format!("http://{}:{}", url_host(&host), port)),
        };
        let access_id_file = match args.access_id_file {
            Some(path) => Some(path),
            None => env_str("GAEFILE_ACCESS_ID_FILE")?.map(PathBuf::from),
        };
        let private_key_file = match args.private_key_file {
            Some(path) => Some(path),
            None => env_str("GAEFILE_PRIVATE_KEY_FILE")?.map(PathBuf::from),
        };

        let defaults = GatewayPolicy::default();
        let transfer_deadline = match args.transfer_deadline_secs {
            Some(secs) => Duration::from_secs(secs),
            None => Duration::from_secs(parse_env(
                &env_str,
                "GAEFILE_TRANSFER_DEADLINE_SECS",
                defaults.transfer_deadline.as_secs(),
            )?),
        };
        let signed_url_ttl = match args.signed_url_ttl_secs {
            Some(secs) => Duration::from_secs(secs),
            None => Duration::from_secs(parse_env(
                &env_str,
                "GAEFILE_SIGNED_URL_TTL_SECS",
                defaults.signed_url_ttl.as_secs(),
            )?),
        };
        let key_random_bytes = match args.key_random_bytes {
            Some(n) => n,
            None => parse_env(
                &env_str,
                "GAEFILE_KEY_RANDOM_BYTES",
                defaults.key_random_bytes,
            )?,
        };
        if key_random_bytes == 0 {
            bail!("key random bytes must be at least 1");
        }
        let default_content_type = match args.default_content_type {
            Some(ct) => ct,
            None => env_str("GAEFILE_DEFAULT_CONTENT_TYPE")?
                .unwrap_or(defaults.default_content_type),
        };
        let private_objects = args.private_objects
            || env_str("GAEFILE_PRIVATE_OBJECTS")?
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false);
        let access_policy = if private_objects {
            AccessPolicy::private()
        } else {
            AccessPolicy::public_read()
        };

        let cfg = Self {
            host,
            port,
            bucket,
            storage_dir,
            database_url,
            public_base_url,
            access_id_file,
            private_key_file,
            policy: GatewayPolicy {
                transfer_deadline,
                signed_url_ttl,
                key_random_bytes,
                default_content_type,
                access_policy,
            },
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => format!("[{}]:{}", ip, self.port),
            _ => format!("{}:{}", self.host, self.port),
        }
    }
}

/// Host as it should appear in a URL clients follow. Wildcard bind
/// addresses are not reachable, so they become loopback; IPv6 literals
/// are bracketed.
fn url_host(host: &str) -> String {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) if ip.is_unspecified() => "127.0.0.1".into(),
        Ok(IpAddr::V6(ip)) if ip.is_unspecified() => "[::1]".into(),
        Ok(IpAddr::V6(ip)) => format!("[{}]", ip),
        _ => host.to_string(),
    }
}

fn parse_env<T, F>(env_str: &F, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Result<Option<String>>,
{
    match env_str(name)? {
        Some(value) => value
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("parsing {} value `{}`: {}", name, value, err)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Result<String, env::VarError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned().ok_or(env::VarError::NotPresent)
    }

    #[test]
    fn defaults_apply_when_only_bucket_is_set() {
        let (cfg, migrate) =
            AppConfig::resolve(Args::default(), lookup(&[("GAEFILE_BUCKET", "uploads")])).unwrap();

        assert!(!migrate);
        assert_eq!(cfg.bucket, "uploads");
        assert_eq!(cfg.addr(), "0.0.0.0:3000");
        assert_eq!(cfg.public_base_url, "http://127.0.0.1:3000");
        assert_eq!(cfg.policy.transfer_deadline, Duration::from_secs(28));
        assert_eq!(cfg.policy.signed_url_ttl, Duration::from_secs(300));
        assert_eq!(cfg.policy.key_random_bytes, 10);
        assert_eq!(cfg.policy.default_content_type, "image/jpeg");
        assert!(cfg.policy.access_policy.is_public_read());
        assert!(cfg.access_id_file.is_none());
    }

    #[test]
    fn ipv6_wildcard_host_yields_a_usable_base_url() {
        let env = lookup(&[("GAEFILE_BUCKET", "uploads"), ("GAEFILE_HOST", "::")]);
        let (cfg, _) = AppConfig::resolve(Args::default(), env).unwrap();

        assert_eq!(cfg.addr(), "[::]:3000");
        assert_eq!(cfg.public_base_url, "http://[::1]:3000");

        let key = p256::ecdsa::SigningKey::random(&mut rand::thread_rng());
        let credentials =
            crate::services::signing::SigningCredentials::new("svc@test", key).unwrap();
        let signer =
            crate::services::signing::UrlSigner::new(credentials, &cfg.public_base_url).unwrap();
        let signed = signer
            .sign(
                "uploads",
                "k_a.jpg",
                crate::services::signing::SignedMethod::Get,
                Duration::from_secs(300),
            )
            .unwrap();
        assert!(
            signed
                .url
                .as_str()
                .starts_with("http://[::1]:3000/storage/uploads/k_a.jpg?")
        );
    }

    #[test]
    fn ipv6_literal_host_is_bracketed() {
        let env = lookup(&[("GAEFILE_BUCKET", "uploads"), ("GAEFILE_HOST", "fd00::7")]);
        let (cfg, _) = AppConfig::resolve(Args::default(), env).unwrap();
        assert_eq!(cfg.public_base_url, "http://[fd00::7]:3000");
        assert_eq!(cfg.addr(), "[fd00::7]:3000");
        assert!(url::Url::parse(&cfg.public_base_url).is_ok());
    }

    #[test]
    fn named_host_is_used_as_is() {
        let env = lookup(&[("GAEFILE_BUCKET", "uploads"), ("GAEFILE_HOST", "files.internal")]);
        let (cfg, _) = AppConfig::resolve(Args::default(), env).unwrap();
        assert_eq!(cfg.public_base_url, "http://files.internal:3000");
    }

    #[test]
    fn bucket_is_required() {
        assert!(AppConfig::resolve(Args::default(), lookup(&[])).is_err());
    }

    #[test]
    fn args_override_env() {
        let args = Args {
            port: Some(9000),
            bucket: Some("from-args".into()),
            signed_url_ttl_secs: Some(60),
            private_objects: true,
            migrate: true,
            ..Args::default()
        };
        let env = lookup(&[
            ("GAEFILE_PORT", "8000"),
            ("GAEFILE_BUCKET", "from-env"),
            ("GAEFILE_TRANSFER_DEADLINE_SECS", "5"),
            ("GAEFILE_ACCESS_ID_FILE", "/etc/gaefile/id"),
        ]);
        let (cfg, migrate) = AppConfig::resolve(args, env).unwrap();

        assert!(migrate);
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.bucket, "from-args");
        assert_eq!(cfg.policy.signed_url_ttl, Duration::from_secs(60));
        assert_eq!(cfg.policy.transfer_deadline, Duration::from_secs(5));
        assert_eq!(cfg.access_id_file, Some(PathBuf::from("/etc/gaefile/id")));
        assert!(!cfg.policy.access_policy.is_public_read());
    }

    #[test]
    fn unparsable_numbers_are_errors() {
        let env = lookup(&[("GAEFILE_BUCKET", "uploads"), ("GAEFILE_PORT", "http")]);
        let err = AppConfig::resolve(Args::default(), env).unwrap_err();
        assert!(err.to_string().contains("GAEFILE_PORT"));
    }

    #[test]
    fn private_objects_from_env() {
        let env = lookup(&[("GAEFILE_BUCKET", "uploads"), ("GAEFILE_PRIVATE_OBJECTS", "TRUE")]);
        let (cfg, _) = AppConfig::resolve(Args::default(), env).unwrap();
        assert!(cfg.policy.access_policy.rules.is_empty());
    }
}
