// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::{
    error,
    fmt,
    io,
};

//======================================================================================================================
// Enumerations
//======================================================================================================================

/// Kinds of failures surfaced to callers of the graph builder and runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailKind {
    /// An argument failed validation.
    BadArgument,
    /// A port number exceeds the number of ports exposed by the driver.
    PortOutOfRange,
    /// Two receivers were requested on the same port.
    MultipleReceivePort,
    /// Two kernel-bridge devices were requested on the same port.
    MultipleKniPort,
    /// A flow handle did not refer to any flow.
    NilFlow,
    /// A flow was used after a sink consumed it.
    ClosedFlow,
    /// Some flow was left open when the runtime was asked to start.
    OpenedFlowAtStart,
    /// The scheduler failed to bring up its workers.
    SchedulerStart,
    /// An IP address was bound to a port that was never requested.
    WrongPort,
    /// An I/O operation failed.
    Io,
    /// A mempool ran out of mbufs.
    OutOfMemory,
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Failure
#[derive(Clone)]
pub struct Fail {
    /// Failure kind.
    pub kind: FailKind,
    /// Cause.
    pub cause: String,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

/// Associate Functions for Failures
impl Fail {
    /// Creates a new Failure
    pub fn new(kind: FailKind, cause: &str) -> Self {
        Self {
            kind,
            cause: cause.to_string(),
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Display Trait Implementation for Failures
impl fmt::Display for Fail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error {:?}: {:?}", self.kind, self.cause)
    }
}

/// Debug trait Implementation for Failures
impl fmt::Debug for Fail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error {:?}: {:?}", self.kind, self.cause)
    }
}

/// Error Trait Implementation for Failures
impl error::Error for Fail {}

/// Conversion Trait Implementation for Fail
impl From<io::Error> for Fail {
    fn from(e: io::Error) -> Self {
        Self {
            kind: FailKind::Io,
            cause: e.to_string(),
        }
    }
}
