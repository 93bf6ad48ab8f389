//! Crate-wide error type and helpers for attaching call-site context.

use std::panic::Location;

use thiserror::Error;

use crate::identity::BodyId;
use crate::identity::HostRef;
use crate::pool::WorkerIndex;

/// Everything that can go wrong inside this crate.
///
/// Probe failures and duplicate recovery triggers are *not* errors
/// here; they are normal outcomes that are reported through
/// [`crate::future::ReplyError`] and
/// [`crate::recovery::FailureOutcome`].
#[derive(Debug, Error)]
pub enum VigilError {
    #[error("invalid configuration for {key}: {msg}")]
    Config { key: String, msg: String },

    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),

    #[error("checkpoint store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("checkpoint store migration error: {0}")]
    Migration(#[from] rusqlite_migration::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("no checkpoint recorded for body {0}")]
    NoCheckpoint(BodyId),

    #[error("no recovery target available for body {0}")]
    NoTarget(BodyId),

    #[error("resume of body {body} on {target} rejected: {msg}")]
    Resume {
        body: BodyId,
        target: HostRef,
        msg: String,
    },

    #[error("worker {0} has been stopped")]
    WorkerStopped(WorkerIndex),

    #[error("future monitor already started")]
    AlreadyStarted,

    #[error("telemetry setup failed: {0}")]
    Telemetry(String),

    #[error("{msg}\nCaused by => {source}")]
    Context {
        msg: String,
        #[source]
        source: Box<VigilError>,
    },

    #[error("{0}")]
    Tracked(String),
}

pub type Result<T> = std::result::Result<T, VigilError>;

/// Wrap an error with a message and the location of the caller.
///
/// Example:
///     open_db(path).reraise("error opening checkpoint database")?;
pub trait Reraise<T> {
    #[track_caller]
    fn reraise(self, msg: &str) -> Result<T>;
}

impl<T, E> Reraise<T> for std::result::Result<T, E>
where
    E: Into<VigilError>,
{
    #[track_caller]
    fn reraise(self, msg: &str) -> Result<T> {
        let caller = Location::caller();
        self.map_err(|err| VigilError::Context {
            msg: prepend_caller(caller, msg),
            source: Box::new(err.into()),
        })
    }
}

/// Use this function to create an error with location tracking.
#[track_caller]
pub(crate) fn tracked_err(msg: &str) -> VigilError {
    let caller = Location::caller();
    VigilError::Tracked(prepend_caller(caller, msg))
}

/// Prepend '({caller}) ' to the message
fn prepend_caller(caller: &Location, msg: &str) -> String {
    format!("({caller}) {msg}")
}

/// Prepend the name of the current thread to each line,
/// if present.
pub(crate) fn prepend_tname(msg: String) -> String {
    let tname = std::thread::current()
        .name()
        .unwrap_or("unnamed-thread")
        .to_string();
    msg.lines()
        .map(|line| format!("<{tname}> {line}\n"))
        .collect()
}

/// Best-effort conversion of a panic payload into text.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(err) = payload.downcast_ref::<VigilError>() {
        err.to_string()
    } else {
        "unknown error".to_string()
    }
}

#[test]
fn reraise_keeps_source_and_location() {
    let res: std::result::Result<(), std::io::Error> = Err(std::io::Error::new(
        std::io::ErrorKind::ConnectionRefused,
        "refused",
    ));
    let err = res.reraise("probing body").unwrap_err();
    let text = err.to_string();
    assert!(text.contains("errors.rs"));
    assert!(text.contains("probing body"));
    assert!(text.contains("Caused by => transport failure: refused"));
}

#[test]
fn prepend_tname_prefixes_every_line() {
    let found = std::thread::Builder::new()
        .name("vigil-worker-3".into())
        .spawn(|| prepend_tname("first\nsecond".to_string()))
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(found, "<vigil-worker-3> first\n<vigil-worker-3> second\n");
}

#[test]
fn panic_message_reads_common_payloads() {
    let payload = std::panic::catch_unwind(|| panic!("boom {}", 1)).unwrap_err();
    assert_eq!(panic_message(payload.as_ref()), "boom 1");
    let payload = std::panic::catch_unwind(|| panic!("static boom")).unwrap_err();
    assert_eq!(panic_message(payload.as_ref()), "static boom");
}
