// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Catflow builds and runs packet-processing data-flow graphs on top of a poll-mode network driver. A user program
//! declaratively composes a graph of flow functions (receive, generate, handle, separate, split, partition, merge,
//! copy, stop, file read/write, kernel bridge) between [FlowSystem::init] and [FlowSystem::start]; the library fuses
//! adjacent nodes into burst-processing segments, wires rings between them and drives everything with per-core
//! busy-polling workers under an adaptive scheduler.

mod collections;

#[macro_use]
extern crate log;

pub mod graph;
pub mod packet;
pub mod runtime;
pub mod scheduler;

pub use crate::graph::{
    check_fatal,
    segment::{
        Answers,
        Mask,
    },
    ContextRef,
    Flow,
    FlowSystem,
    GenerateFunction,
    HandleFunction,
    HwCapability,
    Kni,
    SeparateFunction,
    SplitFunction,
    UserContext,
    VectorGenerateFunction,
    VectorHandleFunction,
    VectorSeparateFunction,
    VectorSplitFunction,
};
pub use crate::packet::Packet;
pub use crate::runtime::{
    config::Config,
    fail::{
        Fail,
        FailKind,
    },
    network::{
        consts::BURST_SIZE,
        memdev::MemoryDriver,
        types::MacAddress,
        PacketDriver,
    },
};
pub use crate::scheduler::{
    timer::{
        Timer,
        TimerHandler,
    },
    Controller,
};

/// Asserts that two expressions are equal, bailing out of the enclosing test with a descriptive error otherwise.
#[macro_export]
macro_rules! ensure_eq {
    ($left:expr, $right:expr) => {{
        match (&$left, &$right) {
            (left_val, right_val) => {
                if !(*left_val == *right_val) {
                    ::anyhow::bail!(
                        "ensure_eq failed: `{}` == `{}` ({:?} != {:?})",
                        stringify!($left),
                        stringify!($right),
                        left_val,
                        right_val
                    );
                }
            },
        }
    }};
}
