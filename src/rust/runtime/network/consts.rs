// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Constants
//======================================================================================================================

/// Number of packets processed as one unit. This is the scheduling quantum of the data plane: workers dequeue,
/// process and enqueue at most this many packets per iteration.
pub const BURST_SIZE: usize = 32;

/// Whether workers account transmitted bytes in addition to packets.
pub const REPORT_MBITS: bool = false;
