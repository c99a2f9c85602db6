use crate::{config, perf, resctrl};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Perf(#[from] perf::Error),
    #[error(transparent)]
    Resctrl(#[from] resctrl::Error),
}
