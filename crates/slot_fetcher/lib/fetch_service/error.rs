use thiserror::Error;

use super::RunReport;
use crate::config::ConfigError;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// No slot of the run could be fetched; the partial report is attached.
    #[error("RPC provider unreachable: all {failed} requested slots exhausted retries")]
    ProviderUnreachable { failed: u64, report: Box<RunReport> },
}
