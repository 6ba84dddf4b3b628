use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

#[derive(Parser, Clone, Debug, PartialEq)]
#[command(author, version, about = "Converts queued CAD uploads to STL meshes")]
pub struct WorkerConfig {
    #[arg(
        long = "database-url",
        env = "DATABASE_URL",
        help = "PostgreSQL connection URL of the job store, credentials included"
    )]
    pub database_url: String,

    #[arg(
        long = "storage-url",
        env = "SUPABASE_URL",
        required_unless_present = "storage_dir",
        help = "Base URL of the storage service"
    )]
    pub storage_url: Option<String>,

    #[arg(
        long = "service-key",
        env = "SUPABASE_SERVICE_ROLE_KEY",
        hide_env_values = true,
        help = "Storage service credential"
    )]
    pub service_key: Option<String>,

    #[arg(
        long = "storage-dir",
        env = "STORAGE_DIR",
        help = "Serve buckets from sub-directories of this path instead of the storage service"
    )]
    pub storage_dir: Option<PathBuf>,

    #[arg(
        long = "poll-interval",
        env = "POLL_INTERVAL_SECONDS",
        default_value = "5",
        help = "Seconds to sleep between polls"
    )]
    pub poll_interval: u64,

    #[arg(long = "uploaded-bucket", env = "UPLOADED_BUCKET", default_value = "cad-uploaded")]
    pub uploaded_bucket: String,

    #[arg(long = "converted-bucket", env = "CONVERTED_BUCKET", default_value = "cad-converted")]
    pub converted_bucket: String,

    #[arg(
        long = "scratch-dir",
        env = "SCRATCH_DIR",
        help = "Directory for downloaded and converted files [default: <tmp>/showcase-worker]"
    )]
    pub scratch_dir: Option<PathBuf>,

    #[arg(
        long = "freecad-cmd",
        env = "FREECAD_CMD",
        default_value = "freecadcmd",
        help = "Headless FreeCAD executable"
    )]
    pub freecad_cmd: String,

    #[arg(long = "max-connections", env = "DB_MAX_CONNECTIONS", default_value = "5")]
    pub max_connections: u32,

    #[arg(
        long = "init-schema",
        env = "INIT_SCHEMA",
        help = "Create the job tables if they do not exist"
    )]
    pub init_schema: bool,

    #[arg(long = "jaeger-endpoint", env = "JAEGER_ENDPOINT", help = "Jaeger collector URL")]
    pub jaeger_endpoint: Option<String>,
}

/// Where the worker reads uploads from and writes meshes to.
#[derive(Clone, Debug, PartialEq)]
pub enum StorageTarget {
    Local(PathBuf),
    Service { url: String, service_key: String },
}

impl WorkerConfig {
    /// `--storage-dir` takes precedence, so a `.env` carrying `SUPABASE_URL`
    /// for `verify` does not get in the way of local runs.
    pub fn storage_target(&self) -> anyhow::Result<StorageTarget> {
        if let Some(dir) = &self.storage_dir {
            return Ok(StorageTarget::Local(dir.clone()));
        }

        let url = self
            .storage_url
            .clone()
            .context("either SUPABASE_URL or STORAGE_DIR must be set")?;
        let service_key = self
            .service_key
            .clone()
            .context("SUPABASE_SERVICE_ROLE_KEY is required with SUPABASE_URL")?;
        Ok(StorageTarget::Service { url, service_key })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("showcase-worker"))
    }
}

#[derive(Parser, Clone, Debug, PartialEq)]
#[command(author, version, about = "Checks the job store schema through its REST interface")]
pub struct VerifyConfig {
    #[arg(long = "url", env = "SUPABASE_URL", help = "Base URL of the store's REST interface")]
    pub url: String,

    #[arg(
        long = "service-key",
        env = "SUPABASE_SERVICE_ROLE_KEY",
        hide_env_values = true
    )]
    pub service_key: String,

    #[arg(
        long = "anon-key",
        env = "SUPABASE_ANON_KEY",
        hide_env_values = true,
        help = "Anonymous key used to probe row level security [default: service key]"
    )]
    pub anon_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = WorkerConfig::try_parse_from([
            "worker",
            "--database-url",
            "postgres://localhost/jobs",
            "--storage-url",
            "https://example.supabase.co",
            "--service-key",
            "secret",
        ])
        .unwrap();

        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.uploaded_bucket, "cad-uploaded");
        assert_eq!(config.converted_bucket, "cad-converted");
        assert_eq!(config.freecad_cmd, "freecadcmd");
        assert!(!config.init_schema);
        assert!(config.scratch_dir().ends_with("showcase-worker"));
    }

    #[test]
    fn storage_service_needs_its_key() {
        let config = WorkerConfig::try_parse_from([
            "worker",
            "--database-url",
            "postgres://localhost/jobs",
            "--storage-url",
            "https://example.supabase.co",
        ])
        .unwrap();

        let err = config.storage_target().unwrap_err();
        assert!(err.to_string().contains("SUPABASE_SERVICE_ROLE_KEY"));
    }

    #[test]
    fn storage_needs_url_or_dir() {
        let result = WorkerConfig::try_parse_from([
            "worker",
            "--database-url",
            "postgres://localhost/jobs",
        ]);

        assert!(result.is_err());
    }

    // clap treats values taken from the environment (or `.env`) exactly like
    // flags, so this is also what a `.env` holding SUPABASE_URL looks like.
    #[test]
    fn storage_dir_wins_over_storage_url() {
        let config = WorkerConfig::try_parse_from([
            "worker",
            "--database-url",
            "postgres://localhost/jobs",
            "--storage-url",
            "https://example.supabase.co",
            "--storage-dir",
            "/srv/buckets",
        ])
        .unwrap();

        assert_eq!(
            config.storage_target().unwrap(),
            StorageTarget::Local(PathBuf::from("/srv/buckets"))
        );
    }

    #[test]
    fn storage_service_target() {
        let config = WorkerConfig::try_parse_from([
            "worker",
            "--database-url",
            "postgres://localhost/jobs",
            "--storage-url",
            "https://example.supabase.co",
            "--service-key",
            "secret",
        ])
        .unwrap();

        assert_eq!(
            config.storage_target().unwrap(),
            StorageTarget::Service {
                url: "https://example.supabase.co".into(),
                service_key: "secret".into(),
            }
        );
    }

    #[test]
    fn local_buckets_replace_storage_service() {
        let config = WorkerConfig::try_parse_from([
            "worker",
            "--database-url",
            "postgres://localhost/jobs",
            "--storage-dir",
            "/srv/buckets",
            "--poll-interval",
            "1",
        ])
        .unwrap();

        assert_eq!(
            config.storage_target().unwrap(),
            StorageTarget::Local(PathBuf::from("/srv/buckets"))
        );
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
    }
}
