// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Contains the [`EventSender`] trait, the boundary between a harvest and the transport that
//! actually serializes and transmits a batch of sampled events.

use std::{borrow::Cow, fmt, io, rc::Rc, sync::Arc};

/// The error cases for an [`EventSender::send_events`] call.
///
/// Reservoirs do not distinguish between error kinds: any error causes the unsent batch to be merged
/// back into the next harvest cycle. The variants only exist so transports can report something
/// meaningful in logs.
#[derive(Debug)]
#[non_exhaustive]
pub enum SendError {
    /// The transport failed to reach the collector.
    Io(io::Error),
    /// The collector answered, but refused the batch.
    Collector {
        /// Status code returned by the collector.
        status: u16,
        /// Human-readable reason, if the collector gave one.
        message: Cow<'static, str>,
    },
    /// The sender panicked while handling the batch.
    Panicked(String),
    /// Any other failure, for example a serialization error.
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl SendError {
    /// Create a [`SendError::Collector`]
    pub fn collector(status: u16, message: impl Into<Cow<'static, str>>) -> Self {
        Self::Collector {
            status,
            message: message.into(),
        }
    }

    /// Create a [`SendError::Other`] from any error type
    pub fn other(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Other(err.into())
    }

    /// A short, stable name for the error kind, suitable for use as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::Collector { .. } => "collector",
            Self::Panicked(_) => "panicked",
            Self::Other(_) => "other",
        }
    }
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "couldn't reach collector: {err}"),
            Self::Collector { status, message } if message.is_empty() => {
                write!(f, "collector rejected batch with status {status}")
            }
            Self::Collector { status, message } => {
                write!(f, "collector rejected batch with status {status}: {message}")
            }
            Self::Panicked(message) => write!(f, "event sender panicked: {message}"),
            Self::Other(err) => fmt::Display::fmt(err, f),
        }
    }
}

impl std::error::Error for SendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Other(err) => Some(&**err),
            Self::Collector { .. } | Self::Panicked(_) => None,
        }
    }
}

impl From<io::Error> for SendError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Serializes and transmits a harvested batch of events to a collector.
///
/// The wire format and transport are entirely the sender's responsibility. A harvest only supplies
/// the logical batch:
/// - `app_name`: the application the events belong to.
/// - `reservoir_size`: the capacity of the reservoir the batch was taken from.
/// - `events_seen`: how many events were offered to that reservoir, which is usually more than
///   `events.len()`; collectors use the ratio to extrapolate.
/// - `events`: the retained events, highest priority first.
///
/// Senders are called on the harvesting thread, never on a producer thread, so it is fine for them
/// to block on network IO. They should enforce their own timeouts.
pub trait EventSender<T> {
    /// Send one batch. Returning an error (or panicking) leaves the batch eligible for the next
    /// harvest.
    fn send_events(
        &self,
        app_name: &str,
        reservoir_size: usize,
        events_seen: u64,
        events: &[T],
    ) -> Result<(), SendError>;
}

impl<T, S: EventSender<T> + ?Sized> EventSender<T> for &S {
    fn send_events(
        &self,
        app_name: &str,
        reservoir_size: usize,
        events_seen: u64,
        events: &[T],
    ) -> Result<(), SendError> {
        (**self).send_events(app_name, reservoir_size, events_seen, events)
    }
}

impl<T, S: EventSender<T> + ?Sized> EventSender<T> for Box<S> {
    fn send_events(
        &self,
        app_name: &str,
        reservoir_size: usize,
        events_seen: u64,
        events: &[T],
    ) -> Result<(), SendError> {
        (**self).send_events(app_name, reservoir_size, events_seen, events)
    }
}

impl<T, S: EventSender<T> + ?Sized> EventSender<T> for Arc<S> {
    fn send_events(
        &self,
        app_name: &str,
        reservoir_size: usize,
        events_seen: u64,
        events: &[T],
    ) -> Result<(), SendError> {
        (**self).send_events(app_name, reservoir_size, events_seen, events)
    }
}

impl<T, S: EventSender<T> + ?Sized> EventSender<T> for Rc<S> {
    fn send_events(
        &self,
        app_name: &str,
        reservoir_size: usize,
        events_seen: u64,
        events: &[T],
    ) -> Result<(), SendError> {
        (**self).send_events(app_name, reservoir_size, events_seen, events)
    }
}

/// Adapts a closure into an [`EventSender`].
///
/// ```
/// # use reservoir_core::{EventSender, FnSender, SendError};
/// let sender = FnSender::new(|app: &str, _size: usize, _seen: u64, events: &[u32]| {
///     println!("{app}: {} events", events.len());
///     Ok::<(), SendError>(())
/// });
/// sender.send_events("my-app", 10, 3, &[1, 2, 3]).unwrap();
/// ```
#[derive(Clone, Copy, Debug)]
pub struct FnSender<F>(F);

impl<F> FnSender<F> {
    /// Create a new [`FnSender`]
    pub const fn new(f: F) -> Self {
        Self(f)
    }
}

impl<T, F> EventSender<T> for FnSender<F>
where
    F: Fn(&str, usize, u64, &[T]) -> Result<(), SendError>,
{
    fn send_events(
        &self,
        app_name: &str,
        reservoir_size: usize,
        events_seen: u64,
        events: &[T],
    ) -> Result<(), SendError> {
        (self.0)(app_name, reservoir_size, events_seen, events)
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use assert2::{check, let_assert};

    use super::*;

    #[test]
    fn display_includes_collector_status() {
        let err = SendError::collector(503, "try again later");
        check!(err.to_string() == "collector rejected batch with status 503: try again later");
        check!(SendError::collector(413, "").to_string() == "collector rejected batch with status 413");
        check!(err.kind() == "collector");
        let_assert!(SendError::Collector { status: 503, .. } = err);
    }

    #[test]
    fn io_errors_keep_their_source() {
        let err: SendError = io::Error::new(io::ErrorKind::TimedOut, "deadline").into();
        check!(err.kind() == "io");
        check!(err.source().is_some());
        check!(err.to_string().contains("deadline"));
    }

    #[test]
    fn fn_sender_forwards_arguments() {
        let sender = FnSender::new(|app: &str, size: usize, seen: u64, events: &[u8]| {
            assert_eq!(app, "app");
            assert_eq!(size, 5);
            assert_eq!(seen, 9);
            assert_eq!(events, &[1, 2]);
            Err::<(), _>(SendError::other("serialization failed"))
        });
        let boxed: Box<dyn EventSender<u8>> = Box::new(sender);
        let err = boxed.send_events("app", 5, 9, &[1, 2]).unwrap_err();
        check!(err.to_string() == "serialization failed");
        check!(err.kind() == "other");
    }
}
