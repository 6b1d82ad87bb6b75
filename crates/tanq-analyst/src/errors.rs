//! Process-level error taxonomy

use thiserror::Error;

/// Errors constructing a component. All programmer/config errors, all
/// fatal: the process aborts startup.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("bad handle: {0}")]
    BadHandle(String),

    #[error("bad parameter: {0}")]
    BadParam(String),
}
