// src/errors.rs
// Error taxonomy for the bot core

use thiserror::Error;

/// Errors surfaced by the bot core.
///
/// Exchange errors are treated as transient by the engine loop (log and move
/// on to the next symbol/cycle); Data errors skip the affected symbol for the
/// current cycle; Persistence errors are warnings only while the process is
/// running; Config errors are fatal at startup.
#[derive(Error, Debug)]
pub enum BotError {
    #[error("Exchange error: {0}")]
    Exchange(String),

    #[error("Data error: {0}")]
    Data(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for BotError {
    fn from(e: reqwest::Error) -> Self {
        BotError::Exchange(e.to_string())
    }
}
