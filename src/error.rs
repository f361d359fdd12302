// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::fmt::{self, Display};
use std::io;

/// Represent the types of errors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Selector passed to `update`/`subscribe` was neither a string nor a path array.
    InvalidPath,

    /// Broker denied a subscribe grant (QoS >= 128).
    SubscribeDenied,

    /// `MqttClient::publish` was called while the client reports disconnected.
    PublishWhileDisconnected,

    /// Payload on a topic we are syncing did not parse as JSON.
    MalformedPayload,

    /// Migration item's subscribe grant was denied; that item completes without effect.
    MigrationSubscribeDenied,

    /// RPC handler returned an error; no response is emitted.
    RpcHandlerError,

    /// mpsc/oneshot channel error talking to the sync engine or queue actor.
    ChannelError,

    /// I/O error from the embedder-supplied collaborator.
    IoError,
}

#[derive(Clone, Debug)]
pub struct Error {
    /// Type of current error.
    kind: ErrorKind,

    /// Detail message about this error.
    message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: &str) -> Self {
        Error {
            kind,
            message: message.to_owned(),
        }
    }

    pub fn from_string(kind: ErrorKind, message: String) -> Self {
        Error { kind, message }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind.clone()
    }

    pub fn invalid_path(message: impl Into<String>) -> Self {
        Error::from_string(ErrorKind::InvalidPath, message.into())
    }

    pub fn subscribe_denied(selector: &str) -> Self {
        Error::from_string(
            ErrorKind::SubscribeDenied,
            format!("subscribe denied for selector {}", selector),
        )
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::from_string(ErrorKind::IoError, format!("IoError {}", err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::from_string(ErrorKind::MalformedPayload, format!("{}", err))
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(err: tokio::sync::oneshot::error::RecvError) -> Self {
        Error::from_string(ErrorKind::ChannelError, format!("reply dropped: {}", err))
    }
}

/// Generates a `From<mpsc::error::SendError<$cmd_type>>` impl for a command
/// enum sent to an actor task, matching the teacher's `convert_send_error!`.
macro_rules! convert_send_error {
    ($cmd_type: ty) => {
        impl From<tokio::sync::mpsc::error::SendError<$cmd_type>> for Error {
            fn from(err: tokio::sync::mpsc::error::SendError<$cmd_type>) -> Self {
                Error::from_string(
                    ErrorKind::ChannelError,
                    format!("engine channel closed: {}", err),
                )
            }
        }
    };
}

convert_send_error!(crate::sync::SyncCommand);
convert_send_error!(crate::queue::QueueCommand);
