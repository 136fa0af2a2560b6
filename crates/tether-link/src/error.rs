use std::io;

use thiserror::Error;

/// Errors surfaced to the embedding application.
///
/// After one successful connect the engines never surface an error again;
/// outages are absorbed by reconnection and the blocking calls simply block.
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("no initial network connection")]
    NoInitialNetwork,
    #[error("no initial server connection")]
    NoInitialServer,
    #[error("link closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] io::Error),
}
