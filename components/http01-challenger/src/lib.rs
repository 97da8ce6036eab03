mod challenge_directory;
mod challenge_server;
mod runner;

pub use challenge_directory::*;
pub use challenge_server::*;
pub use runner::*;

use thiserror::Error;

#[macro_use]
extern crate log;

#[derive(Error, Debug)]
pub enum ChallengerError {
    #[error("Bind Error: {0}")]
    BindFailed(String),
    #[error("Stream Error: {0}")]
    StreamError(String),
}

pub type ChallengerResult<T> = std::result::Result<T, ChallengerError>;
