// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Segments: fused runs of user nodes executed between two rings. A segment dequeues one burst, pushes every packet
//! through a small tree of callables and enqueues each packet into exactly one output ring, without re-enqueueing
//! between nodes. Scalar segments walk the tree one packet at a time; vector segments walk it one mask at a time.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::graph::{
    HandleFunction,
    SeparateFunction,
    SplitFunction,
    UserContext,
    VectorHandleFunction,
    VectorSeparateFunction,
    VectorSplitFunction,
};
use crate::collections::ring::Rings;
use crate::packet::Packet;
use crate::runtime::{
    fail::{
        Fail,
        FailKind,
    },
    memory::MbufHandle,
    network::consts::{
        BURST_SIZE,
        REPORT_MBITS,
    },
};
use ::arrayvec::ArrayVec;
use ::std::{
    any::Any,
    sync::Arc,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Upper bound on the depth of the work stack used by vector dispatch. The stack never grows beyond the depth of the
/// node tree, which the builder keeps far below this.
const MAX_TREE_DEPTH: usize = 30;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Per-packet membership in a burst.
pub type Mask = [bool; BURST_SIZE];

/// Per-packet branch choice of a vector node.
pub type Answers = [u8; BURST_SIZE];

/// Dispatch style contributed by a node, and adopted by the segment containing it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeType {
    /// Works under either dispatch style.
    Universal,
    /// One packet at a time.
    Scalar,
    /// One mask-driven burst at a time.
    Vector,
}

/// Operation performed by one node. The variant set is closed so that the burst loop dispatches through a jump table
/// instead of virtual calls.
pub(crate) enum NodeOp {
    /// Passes every packet to a user callable and forwards it unchanged.
    Handle {
        scalar: Option<HandleFunction>,
        vector: Option<VectorHandleFunction>,
    },
    /// Routes each packet to one of two branches based on a user predicate. Branch one keeps the packet in the
    /// original flow, branch zero diverts it.
    Separate {
        scalar: Option<SeparateFunction>,
        vector: Option<VectorSeparateFunction>,
    },
    /// Routes each packet to one of `flows_number` branches chosen by a user callable.
    Split {
        scalar: Option<SplitFunction>,
        vector: Option<VectorSplitFunction>,
        flows_number: usize,
    },
    /// Deterministic N/M counting branch backed by a [PartitionCtx].
    Partition,
    /// Slice terminator: routes packets into the indexed output ring of the segment.
    Slice { out_index: usize },
}

/// A compiled node.
pub(crate) struct Func {
    pub op: NodeOp,
    pub next: Vec<Func>,
    pub context_index: usize,
}

/// A node under construction inside a [SegmentBuilder].
struct BuilderNode {
    op: NodeOp,
    children: Vec<Option<usize>>,
    context_index: usize,
}

/// A segment under construction. Nodes live in an arena and reference each other by index; branch slots stay empty
/// until the flow that owns them is consumed. The builder compiles into a [CompiledSegment] once the whole graph is
/// closed, which is also what lets mergers re-route output rings without touching running workers.
pub(crate) struct SegmentBuilder {
    pub in_rings: Rings,
    pub in_index_number: i32,
    pub stype: NodeType,
    nodes: Vec<BuilderNode>,
    out: Vec<Rings>,
    contexts: Vec<Option<Box<dyn UserContext>>>,
}

/// An immutable, compiled segment shared by every worker instance that executes it.
pub(crate) struct CompiledSegment {
    pub in_rings: Rings,
    pub in_index_number: i32,
    pub first: Func,
    pub out: Vec<Rings>,
    pub stype: NodeType,
}

/// Per-worker execution state for one segment: an independently copied context vector plus scratch buffers reused
/// across bursts.
pub(crate) struct SegmentExecutor {
    segment: Arc<CompiledSegment>,
    contexts: Vec<Option<Box<dyn UserContext>>>,
    packets: Vec<Packet>,
    out_bufs: Vec<ArrayVec<MbufHandle, BURST_SIZE>>,
    compacted: [MbufHandle; BURST_SIZE],
    retired: bool,
}

/// Context of the counting partitioner: `n` consecutive packets go to branch zero, then `m` to branch one,
/// alternating. Every worker instance owns an independent copy, so the aggregate ratio stays n:m across clones even
/// though the interleaving is only contiguous within one instance.
pub struct PartitionCtx {
    n: u64,
    m: u64,
    current_answer: u8,
    current_compare: u64,
    current_packet_number: u64,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl NodeOp {
    /// Number of child branches a node of this operation carries.
    fn children_number(&self) -> usize {
        match self {
            NodeOp::Handle { .. } => 1,
            NodeOp::Separate { .. } => 2,
            NodeOp::Split { flows_number, .. } => *flows_number,
            NodeOp::Partition => 2,
            NodeOp::Slice { .. } => 0,
        }
    }

    /// Dispatch style this node insists on.
    pub(crate) fn node_type(&self) -> NodeType {
        match self {
            NodeOp::Handle { scalar: Some(_), .. } => NodeType::Scalar,
            NodeOp::Handle { vector: Some(_), .. } => NodeType::Vector,
            NodeOp::Separate { scalar: Some(_), .. } => NodeType::Scalar,
            NodeOp::Separate { vector: Some(_), .. } => NodeType::Vector,
            NodeOp::Split { scalar: Some(_), .. } => NodeType::Scalar,
            NodeOp::Split { vector: Some(_), .. } => NodeType::Vector,
            _ => NodeType::Universal,
        }
    }
}

impl Func {
    pub(crate) fn following_number(&self) -> usize {
        self.next.len()
    }
}

impl SegmentBuilder {
    /// Opens a segment over `in_rings` with `op` as its first node. Returns the builder and the node identifier.
    pub fn new(in_rings: Rings, in_index_number: i32, op: NodeOp, stype: NodeType) -> (Self, usize) {
        let mut builder: SegmentBuilder = Self {
            in_rings,
            in_index_number,
            stype,
            nodes: Vec::new(),
            out: Vec::new(),
            contexts: Vec::new(),
        };
        let first: usize = builder.add_node(op);
        (builder, first)
    }

    /// Adds a detached node to the arena.
    pub fn add_node(&mut self, op: NodeOp) -> usize {
        let children: Vec<Option<usize>> = vec![None; op.children_number()];
        self.nodes.push(BuilderNode {
            op,
            children,
            context_index: 0,
        });
        self.nodes.len() - 1
    }

    /// Adds a slice terminator that emits into `out_rings`.
    pub fn add_slice(&mut self, out_rings: Rings) -> usize {
        self.out.push(out_rings);
        let out_index: usize = self.out.len() - 1;
        self.add_node(NodeOp::Slice { out_index })
    }

    /// Hooks `child` into the `branch`-th slot of `parent`.
    pub fn attach(&mut self, parent: usize, branch: usize, child: usize) {
        debug_assert!(self.nodes[parent].children[branch].is_none());
        self.nodes[parent].children[branch] = Some(child);
    }

    /// Checks whether `node` carries child branch slots.
    pub fn node_has_children(&self, node: usize) -> bool {
        !self.nodes[node].children.is_empty()
    }

    /// Records the context template of `node`.
    pub fn push_context(&mut self, node: usize, context: Option<Box<dyn UserContext>>) {
        self.contexts.push(context);
        self.nodes[node].context_index = self.contexts.len() - 1;
    }

    /// Compiles the builder into an immutable segment plus the context template vector. Fails if any branch slot was
    /// never attached, which cannot happen once every flow of the graph is consumed.
    pub fn compile(self) -> Result<(CompiledSegment, Vec<Option<Box<dyn UserContext>>>), Fail> {
        let mut nodes: Vec<Option<BuilderNode>> = self.nodes.into_iter().map(Some).collect();
        let first: Func = Self::build(&mut nodes, 0)?;
        Ok((
            CompiledSegment {
                in_rings: self.in_rings,
                in_index_number: self.in_index_number,
                first,
                out: self.out,
                stype: self.stype,
            },
            self.contexts,
        ))
    }

    fn build(nodes: &mut Vec<Option<BuilderNode>>, id: usize) -> Result<Func, Fail> {
        let node: BuilderNode = match nodes.get_mut(id).and_then(Option::take) {
            Some(node) => node,
            None => return Err(Fail::new(FailKind::BadArgument, "segment node referenced twice")),
        };
        let mut next: Vec<Func> = Vec::with_capacity(node.children.len());
        for child in &node.children {
            match child {
                Some(child) => next.push(Self::build(nodes, *child)?),
                None => {
                    return Err(Fail::new(
                        FailKind::BadArgument,
                        "segment has an unattached branch; some flow was never consumed",
                    ))
                },
            }
        }
        Ok(Func {
            op: node.op,
            next,
            context_index: node.context_index,
        })
    }
}

impl SegmentExecutor {
    pub fn new(segment: Arc<CompiledSegment>, contexts: Vec<Option<Box<dyn UserContext>>>) -> Self {
        let out_number: usize = segment.out.len();
        Self {
            segment,
            contexts,
            packets: Vec::with_capacity(BURST_SIZE),
            out_bufs: (0..out_number).map(|_| ArrayVec::new()).collect(),
            compacted: [0; BURST_SIZE],
            retired: false,
        }
    }

    /// Runs one burst through the node tree, handing each terminator's packets to `emit(out_index, handles)`.
    /// Returns `(packets, bytes)` counted at the terminators.
    pub fn process_burst(
        &mut self,
        bufs: &[MbufHandle],
        count: usize,
        emit: &mut dyn FnMut(usize, &[MbufHandle]),
    ) -> (u64, u64) {
        if self.segment.stype != NodeType::Vector {
            self.process_burst_scalar(bufs, count, emit)
        } else {
            self.process_burst_vector(bufs, count, emit)
        }
    }

    fn process_burst_scalar(
        &mut self,
        bufs: &[MbufHandle],
        count: usize,
        emit: &mut dyn FnMut(usize, &[MbufHandle]),
    ) -> (u64, u64) {
        let segment: &CompiledSegment = &self.segment;
        let contexts: &mut Vec<Option<Box<dyn UserContext>>> = &mut self.contexts;
        let mut bytes: u64 = 0;

        for handle in &bufs[..count] {
            let mut packet: Packet = Packet::extract(*handle);
            let mut current: &Func = &segment.first;
            loop {
                let next_index: usize = scalar_apply(current, &mut packet, contexts);
                if current.following_number() == 0 {
                    self.out_bufs[next_index].push(*handle);
                    if REPORT_MBITS {
                        bytes += packet.len() as u64;
                    }
                    break;
                }
                current = &current.next[next_index];
            }
        }

        let mut packets: u64 = 0;
        for (index, buffer) in self.out_bufs.iter_mut().enumerate() {
            if buffer.is_empty() {
                continue;
            }
            emit(index, buffer.as_slice());
            packets += buffer.len() as u64;
            buffer.clear();
        }
        (packets, bytes)
    }

    fn process_burst_vector(
        &mut self,
        bufs: &[MbufHandle],
        count: usize,
        emit: &mut dyn FnMut(usize, &[MbufHandle]),
    ) -> (u64, u64) {
        let segment: &CompiledSegment = &self.segment;
        let contexts: &mut Vec<Option<Box<dyn UserContext>>> = &mut self.contexts;
        Packet::extract_packets(&mut self.packets, bufs, count);

        let mut stack: Vec<(&Func, Mask)> = vec![(&segment.first, [false; BURST_SIZE]); MAX_TREE_DEPTH];
        for (i, slot) in stack[0].1.iter_mut().enumerate() {
            *slot = i < count;
        }

        let mut answers: Answers = [0; BURST_SIZE];
        let mut packets_out: u64 = 0;
        let mut top: isize = 0;
        while top != -1 {
            let st: usize = top as usize;
            let current: &Func = stack[st].0;
            let mask: Mask = stack[st].1;
            vector_apply(current, &mut self.packets, &mask, &mut answers, contexts);
            match current.following_number() {
                0 => {
                    // Every lane of a surviving sub-mask shares one output ring, so the first answer names it.
                    let compacted: usize = fill_slice_from_mask(bufs, &mask, &mut self.compacted);
                    emit(answers[0] as usize, &self.compacted[..compacted]);
                    packets_out += compacted as u64;
                },
                1 => {
                    stack[st].0 = &current.next[0];
                    top += 1;
                },
                children => {
                    let mut step: usize = 0;
                    for i in 0..children {
                        let empty: bool = {
                            let child_mask: &mut Mask = &mut stack[st + step].1;
                            generate_mask(&answers, i as u8, &mask, child_mask)
                        };
                        if !empty {
                            stack[st + step].0 = &current.next[i];
                            step += 1;
                        }
                    }
                    top += step as isize;
                },
            }
            top -= 1;
        }
        (packets_out, 0)
    }

    /// Invokes the destructor of every owned context. Called exactly once, on worker retirement.
    pub fn retire(&mut self) {
        if self.retired {
            return;
        }
        self.retired = true;
        for context in self.contexts.iter_mut() {
            if let Some(context) = context {
                context.delete();
            }
        }
    }
}

impl PartitionCtx {
    pub fn new(n: u64, m: u64) -> Self {
        Self {
            n,
            m,
            current_answer: 0,
            current_compare: n,
            current_packet_number: 0,
        }
    }

    /// Advances the counter by one packet and returns the branch it belongs to.
    fn step(&mut self) -> usize {
        let answer: usize = self.current_answer as usize;
        self.current_packet_number += 1;
        if self.current_packet_number == self.current_compare {
            self.current_answer ^= 1;
            self.current_compare = self.n + self.m - self.current_compare;
            self.current_packet_number = 0;
        }
        answer
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl UserContext for PartitionCtx {
    fn duplicate(&self) -> Box<dyn UserContext> {
        Box::new(PartitionCtx::new(self.n, self.m))
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Applies one node to one packet. Returns the branch index chosen, or the output-ring index for terminators.
pub(crate) fn scalar_apply(
    func: &Func,
    packet: &mut Packet,
    contexts: &mut [Option<Box<dyn UserContext>>],
) -> usize {
    match &func.op {
        NodeOp::Handle { scalar, .. } => {
            let scalar: &HandleFunction = scalar.as_ref().expect("scalar segment carries scalar callables");
            scalar(packet, contexts[func.context_index].as_mut());
            0
        },
        NodeOp::Separate { scalar, .. } => {
            let scalar: &SeparateFunction = scalar.as_ref().expect("scalar segment carries scalar callables");
            scalar(packet, contexts[func.context_index].as_mut()) as usize
        },
        NodeOp::Split { scalar, .. } => {
            let scalar: &SplitFunction = scalar.as_ref().expect("scalar segment carries scalar callables");
            scalar(packet, contexts[func.context_index].as_mut())
        },
        NodeOp::Partition => partition_context(contexts, func.context_index).step(),
        NodeOp::Slice { out_index } => *out_index,
    }
}

/// Applies one node to every packet selected by `mask`, filling `answers` with per-packet branch choices.
pub(crate) fn vector_apply(
    func: &Func,
    packets: &mut [Packet],
    mask: &Mask,
    answers: &mut Answers,
    contexts: &mut [Option<Box<dyn UserContext>>],
) {
    match &func.op {
        NodeOp::Handle { vector, .. } => {
            let vector: &VectorHandleFunction = vector.as_ref().expect("vector segment carries vector callables");
            vector(packets, mask, contexts[func.context_index].as_mut());
        },
        NodeOp::Separate { vector, .. } => {
            let vector: &VectorSeparateFunction = vector.as_ref().expect("vector segment carries vector callables");
            let mut kept: Mask = [false; BURST_SIZE];
            vector(packets, mask, &mut kept, contexts[func.context_index].as_mut());
            for i in 0..BURST_SIZE {
                if mask[i] {
                    answers[i] = kept[i] as u8;
                }
            }
        },
        NodeOp::Split { vector, .. } => {
            let vector: &VectorSplitFunction = vector.as_ref().expect("vector segment carries vector callables");
            vector(packets, mask, answers, contexts[func.context_index].as_mut());
        },
        NodeOp::Partition => {
            let context: &mut PartitionCtx = partition_context(contexts, func.context_index);
            for i in 0..BURST_SIZE {
                if mask[i] {
                    answers[i] = context.step() as u8;
                }
            }
        },
        NodeOp::Slice { out_index } => {
            answers[0] = *out_index as u8;
        },
    }
}

/// Intersects `parent` with the lanes whose answer equals `value`. Returns whether the child mask came out empty.
pub(crate) fn generate_mask(answers: &Answers, value: u8, parent: &Mask, child: &mut Mask) -> bool {
    let mut empty: bool = true;
    for i in 0..BURST_SIZE {
        let hit: bool = parent[i] && answers[i] == value;
        child[i] = hit;
        empty &= !hit;
    }
    empty
}

/// Compacts the handles selected by `mask` into the front of `output`. Returns the number of handles moved.
pub(crate) fn fill_slice_from_mask(input: &[MbufHandle], mask: &Mask, output: &mut [MbufHandle]) -> usize {
    let mut count: usize = 0;
    for (i, selected) in mask.iter().enumerate() {
        if *selected {
            output[count] = input[i];
            count += 1;
        }
    }
    count
}

fn partition_context<'a>(
    contexts: &'a mut [Option<Box<dyn UserContext>>],
    index: usize,
) -> &'a mut PartitionCtx {
    contexts[index]
        .as_mut()
        .expect("partitioner carries a context")
        .as_any_mut()
        .downcast_mut::<PartitionCtx>()
        .expect("partitioner context has partition type")
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
