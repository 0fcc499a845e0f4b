use std::net::SocketAddr;
use std::path::PathBuf;

/// Daemon settings, assembled once at startup from command line flags.
///
/// Runtime-tunable knobs (`LAMINAR_TITLE`, `LAMINAR_KEEP_RUNDIRS`) are read
/// from the environment where they are used so that a restart is not needed
/// to pick them up.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Absolute path under which cfg/, run/ and archive/ live.
    pub home: PathBuf,
    /// URL prefix for artifact links in status documents. Always ends in '/'.
    pub archive_url: String,
    /// Listen address of the web front-end.
    pub bind_http: SocketAddr,
    /// Listen address of the control endpoint.
    pub bind_rpc: SocketAddr,
    /// PostgreSQL connection string.
    pub connection_string: String,
}

impl Settings {
    pub fn jobs_dir(&self) -> PathBuf {
        self.home.join("cfg").join("jobs")
    }

    pub fn run_dir(&self, job: &str, number: i64) -> PathBuf {
        self.home.join("run").join(job).join(number.to_string())
    }

    pub fn archive_dir(&self, job: &str, number: i64) -> PathBuf {
        self.home.join("archive").join(job).join(number.to_string())
    }

    pub fn new(
        home: PathBuf,
        archive_url: String,
        bind_http: SocketAddr,
        bind_rpc: SocketAddr,
        connection_string: String,
    ) -> Self {
        let mut archive_url = archive_url;
        if !archive_url.ends_with('/') {
            archive_url.push('/');
        }
        Self {
            home,
            archive_url,
            bind_http,
            bind_rpc,
            connection_string,
        }
    }
}
