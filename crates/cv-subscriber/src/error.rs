use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("missed parsers for queue processing")]
    MissedParsers,

    #[error("unprocessable entity")]
    Unprocessable,

    #[error("long entity processing")]
    ProcessingDurationExceeded,

    #[error("lock for key not found")]
    LockForKeyNotFound,

    #[error("lock for id not found")]
    LockForIdNotFound,

    #[error("lock meet conflict")]
    LockMeetConflict,

    #[error("Consumer {0:?} finished processing")]
    ConsumerFinished(String),

    #[error("invalid duration {name:?}: {source}")]
    InvalidDuration {
        name: &'static str,
        source: humantime::DurationError,
    },

    #[error(transparent)]
    Amqp(#[from] cv_amqp::Error),

    #[error("entity error: {0}")]
    Entity(anyhow::Error),
}
