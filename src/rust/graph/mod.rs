// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Graph builder and lifecycle. A user program composes a packet-processing graph between [FlowSystem::init] and
//! [FlowSystem::start] by chaining flow functions through [Flow] handles; the builder fuses contiguous map and
//! branch nodes into segments, wires rings between them and registers one worker per source, sink and segment with
//! the scheduler. Construction is strictly single-threaded; the run phase begins at [FlowSystem::start].

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod segment;

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::collections::ring::{
    create_rings,
    Rings,
};
use crate::graph::segment::{
    NodeOp,
    NodeType,
    PartitionCtx,
    SegmentBuilder,
};
use crate::packet::{
    self,
    Packet,
};
use crate::runtime::{
    config::{
        self,
        Config,
        DEFAULT_CHECK_TIME_MS,
        DEFAULT_DEBUG_TIME_MS,
        DEFAULT_MAX_IN_INDEX,
        DEFAULT_MAX_RECV,
        DEFAULT_MBUF_CACHE_SIZE,
        DEFAULT_MBUF_NUMBER,
        DEFAULT_RING_SIZE,
        DEFAULT_SCHED_TIME_MS,
    },
    fail::{
        Fail,
        FailKind,
    },
    logging,
    memory::Mempool,
    network::{
        consts::BURST_SIZE,
        types::MacAddress,
        PacketDriver,
    },
};
use crate::scheduler::{
    timer::{
        Timer,
        TimerHandler,
    },
    CloneKind,
    Controller,
    FlowFunctionParams,
    Scheduler,
};
use ::std::{
    any::Any,
    collections::HashMap,
    net::Ipv4Addr,
    process,
    sync::Arc,
    time::Duration,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Opaque carrier handed to user callables. Contexts attached to clonable parts of the graph must produce independent
/// deep copies; every worker instance runs on its own copy and the destructor runs exactly once when the instance
/// retires.
pub trait UserContext: Send + 'static {
    /// Produces an independent copy for a newly launched worker instance.
    fn duplicate(&self) -> Box<dyn UserContext>;

    /// Releases whatever the context owns. Invoked exactly once per instance, on retirement.
    fn delete(&mut self) {}

    /// Gives user callables typed access to the context.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Borrowed context slot passed to user callables.
pub type ContextRef<'a> = Option<&'a mut Box<dyn UserContext>>;

/// Fills a freshly allocated packet with content.
pub type GenerateFunction = Arc<dyn Fn(&mut Packet, ContextRef) + Send + Sync>;

/// Fills a whole burst of freshly allocated packets with content.
pub type VectorGenerateFunction = Arc<dyn Fn(&mut [Packet], ContextRef) + Send + Sync>;

/// Inspects and possibly modifies one packet.
pub type HandleFunction = Arc<dyn Fn(&mut Packet, ContextRef) + Send + Sync>;

/// Inspects and possibly modifies the packets selected by the mask.
pub type VectorHandleFunction = Arc<dyn Fn(&mut [Packet], &segment::Mask, ContextRef) + Send + Sync>;

/// Decides whether a packet stays in its flow (`true`) or is diverted to the branched-off flow (`false`).
pub type SeparateFunction = Arc<dyn Fn(&Packet, ContextRef) -> bool + Send + Sync>;

/// Vector form of [SeparateFunction]: fills the answer mask for every packet selected by the input mask.
pub type VectorSeparateFunction = Arc<dyn Fn(&[Packet], &segment::Mask, &mut segment::Mask, ContextRef) + Send + Sync>;

/// Chooses the output flow of a packet. The returned index must stay below the flow number given to the splitter.
pub type SplitFunction = Arc<dyn Fn(&Packet, ContextRef) -> usize + Send + Sync>;

/// Vector form of [SplitFunction]: fills per-packet answers for every packet selected by the mask.
pub type VectorSplitFunction = Arc<dyn Fn(&[Packet], &segment::Mask, &mut segment::Answers, ContextRef) + Send + Sync>;

/// Hardware offload capabilities that can be queried and enabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HwCapability {
    /// TCP/UDP checksum calculation on transmit.
    TxChecksum,
}

/// A kernel-bridge device. The device itself lives in the driver; this handle names it by its port.
pub struct Kni {
    port_id: u16,
}

/// An abstraction for connecting flow functions with each other. A flow has exactly one producer and is consumed by
/// exactly one follow-up flow function; using it after a sink consumed it is an error.
pub struct Flow {
    id: usize,
}

/// Builder-side state of one flow.
struct FlowState {
    current: Option<Rings>,
    segment: Option<usize>,
    previous: Option<(usize, usize)>,
    in_index_number: i32,
}

/// Per-port bookkeeping kept from init to teardown.
struct PortRecord {
    port: u16,
    was_requested: bool,
    will_receive: bool,
    tx_queues_number: u16,
    will_kni: bool,
    kni_core_index: usize,
    mac: MacAddress,
    in_index: i32,
}

/// The system: driver, ports, scheduler and the graph under construction.
pub struct FlowSystem {
    driver: Arc<dyn PacketDriver>,
    scheduler: Scheduler,
    ports: Vec<PortRecord>,
    port_pairs: HashMap<u32, u16>,
    flows: Vec<FlowState>,
    segments: Vec<SegmentBuilder>,
    open_flows: u32,
    ring_capacity: usize,
    sched_time_ms: u64,
    hw_tx_checksum: bool,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Kni {
    /// Port the kernel-bridge device is bound to.
    pub fn port_id(&self) -> u16 {
        self.port_id
    }
}

impl FlowSystem {
    /// Initializes the system over `driver`. Must be called before any graph construction.
    pub fn init(config: &Config, driver: Arc<dyn PacketDriver>) -> Result<FlowSystem, Fail> {
        if config.log_spec.is_empty() {
            logging::initialize();
        } else {
            logging::initialize_with(&config.log_spec);
        }

        let cores_number: usize = config::cores_number();
        let cpus: Vec<usize> = if !config.cpu_list.is_empty() {
            config::parse_cpu_list(&config.cpu_list, cores_number)?
        } else {
            config::default_cpus(cores_number)
        };

        let scheduler_off: bool = config.disable_scheduler;
        let scheduler_off_remove: bool = config.persistent_clones;
        let stop_dedicated_core: bool = config.stop_on_dedicated_core;
        let hw_tx_checksum: bool = config.hw_tx_checksum;
        let anyway: bool = !config.restricted_cloning;

        let mbuf_number: usize = if config.mbuf_number != 0 {
            config.mbuf_number
        } else {
            DEFAULT_MBUF_NUMBER
        };
        let mbuf_cache_size: usize = if config.mbuf_cache_size != 0 {
            config.mbuf_cache_size
        } else {
            DEFAULT_MBUF_CACHE_SIZE
        };
        let size_multiplier: usize = if config.ring_size != 0 {
            config.ring_size
        } else {
            DEFAULT_RING_SIZE
        };
        if !size_multiplier.is_power_of_two() {
            return Err(Fail::new(FailKind::BadArgument, "ring size should be a power of two"));
        }
        let sched_time_ms: u64 = if config.sched_time_ms != 0 {
            config.sched_time_ms
        } else {
            DEFAULT_SCHED_TIME_MS
        };
        let check_time_ms: u64 = if config.check_time_ms != 0 {
            config.check_time_ms
        } else {
            DEFAULT_CHECK_TIME_MS
        };
        let debug_time_ms: u64 = if config.debug_time_ms != 0 {
            config.debug_time_ms
        } else {
            DEFAULT_DEBUG_TIME_MS
        };
        if debug_time_ms < sched_time_ms {
            return Err(Fail::new(
                FailKind::BadArgument,
                "debug time should be larger or equal to schedule time",
            ));
        }

        let mut kni_number: i32 = if config.need_kni { 1 } else { 0 };
        let max_recv: usize = DEFAULT_MAX_RECV as usize;
        if config.max_recv != 0 {
            kni_number = config.max_recv;
        }

        let mut max_in_index: i32 = DEFAULT_MAX_IN_INDEX;
        if scheduler_off {
            max_in_index = 1;
        }
        if config.max_in_index != 0 {
            max_in_index = config.max_in_index;
        }

        // A worker gets a clone when its input ring is roughly 80% full.
        let max_packets_to_clone: u32 = (size_multiplier * BURST_SIZE / 5 * 4) as u32;

        info!("initializing driver");
        driver.initialize(&config.driver_args, BURST_SIZE, mbuf_number, mbuf_cache_size, kni_number)?;

        let mut ports: Vec<PortRecord> = Vec::with_capacity(driver.ports_number() as usize);
        for port in 0..driver.ports_number() {
            let rss: i32 = driver.port_rss_count(port);
            ports.push(PortRecord {
                port,
                was_requested: false,
                will_receive: false,
                tx_queues_number: 0,
                will_kni: false,
                kni_core_index: 0,
                mac: MacAddress::nil(),
                in_index: max_in_index.min(rss),
            });
        }

        info!("initializing scheduler");
        let ring_capacity: usize = BURST_SIZE * size_multiplier;
        let stop_ring: Rings = create_rings(ring_capacity, max_in_index)?;
        debug!("scheduler can use cores: {:?}", cpus);
        let scheduler: Scheduler = Scheduler::new(
            cpus,
            scheduler_off,
            scheduler_off_remove,
            stop_dedicated_core,
            stop_ring,
            check_time_ms,
            debug_time_ms,
            sched_time_ms,
            max_packets_to_clone,
            max_recv,
            anyway,
            driver.clone(),
        );

        packet::set_hw_tx_checksum_flag(hw_tx_checksum);

        Ok(FlowSystem {
            driver,
            scheduler,
            ports,
            port_pairs: HashMap::new(),
            flows: Vec::new(),
            segments: Vec::new(),
            open_flows: 0,
            ring_capacity,
            sched_time_ms,
            hw_tx_checksum,
        })
    }

    /// Returns a handle that can stop a running system from another thread.
    pub fn controller(&self) -> Controller {
        self.scheduler.controller()
    }

    /// Number of flows that are open and still need a consumer.
    pub fn open_flows(&self) -> u32 {
        self.open_flows
    }

    //==================================================================================================================
    // Sources
    //==================================================================================================================

    /// Adds a receive function for `port_id`. A receive queue set is booked on the port automatically. Returns a new
    /// open flow carrying received packets.
    pub fn set_receiver(&mut self, port_id: u16) -> Result<Flow, Fail> {
        if port_id as usize >= self.ports.len() {
            let cause: String = format!("requested receive port exceeds number of ports (port={})", port_id);
            error!("set_receiver(): {}", cause);
            return Err(Fail::new(FailKind::PortOutOfRange, &cause));
        }
        if self.ports[port_id as usize].will_receive {
            let cause: String = format!("two receives from one port are prohibited (port={})", port_id);
            error!("set_receiver(): {}", cause);
            return Err(Fail::new(FailKind::MultipleReceivePort, &cause));
        }
        self.ports[port_id as usize].was_requested = true;
        self.ports[port_id as usize].will_receive = true;
        let in_index: i32 = self.ports[port_id as usize].in_index;
        let rings: Rings = self.create_graph_rings(in_index)?;
        self.scheduler.add_ff(
            "receiver",
            FlowFunctionParams::Receive {
                port: port_id,
                kni: false,
                out: rings.clone(),
            },
            Vec::new(),
            in_index,
            CloneKind::None,
        );
        Ok(self.new_flow(rings, in_index))
    }

    /// Adds a receive function for a kernel-bridge device. Returns a new open flow carrying received packets.
    pub fn set_receiver_kni(&mut self, kni: &Kni) -> Result<Flow, Fail> {
        let rings: Rings = self.create_graph_rings(1)?;
        self.scheduler.add_ff(
            "KNI receiver",
            FlowFunctionParams::Receive {
                port: kni.port_id,
                kni: true,
                out: rings.clone(),
            },
            Vec::new(),
            0,
            CloneKind::None,
        );
        Ok(self.new_flow(rings, 1))
    }

    /// Adds a non-clonable generate function. Returns a new open flow carrying generated packets.
    pub fn set_generator(&mut self, f: GenerateFunction, context: Option<Box<dyn UserContext>>) -> Result<Flow, Fail> {
        let rings: Rings = self.create_graph_rings(1)?;
        self.scheduler.add_ff(
            "generator",
            FlowFunctionParams::Generate {
                out: rings.clone(),
                f,
            },
            vec![context],
            0,
            CloneKind::None,
        );
        Ok(self.new_flow(rings, 1))
    }

    /// Adds a clonable generate function that the scheduler paces towards `target_speed` packets per second.
    /// Returns a new open flow carrying generated packets.
    pub fn set_fast_generator(
        &mut self,
        f: GenerateFunction,
        target_speed: u64,
        context: Option<Box<dyn UserContext>>,
    ) -> Result<Flow, Fail> {
        self.add_fast_generator(Some(f), None, target_speed, context)
    }

    /// Adds a clonable vector generate function paced towards `target_speed` packets per second.
    pub fn set_vector_fast_generator(
        &mut self,
        f: VectorGenerateFunction,
        target_speed: u64,
        context: Option<Box<dyn UserContext>>,
    ) -> Result<Flow, Fail> {
        self.add_fast_generator(None, Some(f), target_speed, context)
    }

    /// Adds a read function for a pcap file. The file is re-read `repcount` times. Returns a new open flow.
    pub fn set_receiver_file(&mut self, filename: &str, repcount: i32) -> Result<Flow, Fail> {
        let rings: Rings = self.create_graph_rings(1)?;
        self.scheduler.add_ff(
            "reader",
            FlowFunctionParams::Read {
                filename: filename.to_string(),
                out: rings.clone(),
                repcount,
            },
            Vec::new(),
            0,
            CloneKind::None,
        );
        Ok(self.new_flow(rings, 1))
    }

    //==================================================================================================================
    // Sinks
    //==================================================================================================================

    /// Closes `flow` and sends its packets out of `port_id`. A transmit queue is booked on the port automatically.
    pub fn set_sender(&mut self, flow: &Flow, port_id: u16) -> Result<(), Fail> {
        self.check_flow(flow)?;
        if port_id as usize >= self.ports.len() {
            let cause: String = format!("requested send port exceeds number of ports (port={})", port_id);
            error!("set_sender(): {}", cause);
            return Err(Fail::new(FailKind::PortOutOfRange, &cause));
        }
        self.ports[port_id as usize].was_requested = true;
        let queue: u16 = self.ports[port_id as usize].tx_queues_number;
        let in_index: i32 = self.flow_in_index(flow)?;
        let in_rings: Rings = self.finish_flow(flow)?;
        self.scheduler.add_ff(
            "sender",
            FlowFunctionParams::Send {
                port: port_id,
                queue: Some(queue),
                in_rings,
            },
            Vec::new(),
            in_index,
            CloneKind::None,
        );
        self.ports[port_id as usize].tx_queues_number += 1;
        Ok(())
    }

    /// Closes `flow` and hands its packets to a kernel-bridge device.
    pub fn set_sender_kni(&mut self, flow: &Flow, kni: &Kni) -> Result<(), Fail> {
        self.check_flow(flow)?;
        let in_index: i32 = self.flow_in_index(flow)?;
        let in_rings: Rings = self.finish_flow(flow)?;
        self.scheduler.add_ff(
            "KNI sender",
            FlowFunctionParams::Send {
                port: kni.port_id,
                queue: None,
                in_rings,
            },
            Vec::new(),
            in_index,
            CloneKind::None,
        );
        Ok(())
    }

    /// Closes `flow` and writes its packets into a pcap file.
    pub fn set_sender_file(&mut self, flow: &Flow, filename: &str) -> Result<(), Fail> {
        self.check_flow(flow)?;
        let in_index: i32 = self.flow_in_index(flow)?;
        let in_rings: Rings = self.finish_flow(flow)?;
        self.scheduler.add_ff(
            "writer",
            FlowFunctionParams::Write {
                filename: filename.to_string(),
                in_rings,
            },
            Vec::new(),
            in_index,
            CloneKind::None,
        );
        Ok(())
    }

    /// Closes `flow` and drops every packet in it.
    pub fn set_stopper(&mut self, flow: &Flow) -> Result<(), Fail> {
        let idx: usize = self.check_flow(flow)?;
        if self.flows[idx].segment.is_none() {
            let current: Rings = self.flows[idx].current.clone().expect("materialized flow carries rings");
            let stop_ring: Rings = self.scheduler.stop_ring();
            self.scheduler.rebind_out(&current, &stop_ring);
            self.close_flow(idx);
        } else {
            let stop_ring: Rings = self.scheduler.stop_ring();
            self.segment_insert_slice(idx, stop_ring, true)?;
        }
        Ok(())
    }

    //==================================================================================================================
    // In-graph flow functions
    //==================================================================================================================

    /// Adds a handle function. Every packet of `flow` passes through `f` and continues in the same flow.
    pub fn set_handler(
        &mut self,
        flow: &Flow,
        f: HandleFunction,
        context: Option<Box<dyn UserContext>>,
    ) -> Result<(), Fail> {
        let op: NodeOp = NodeOp::Handle {
            scalar: Some(f),
            vector: None,
        };
        self.segment_insert(flow, op, false, context, 0)?;
        Ok(())
    }

    /// Adds a vector handle function.
    pub fn set_vector_handler(
        &mut self,
        flow: &Flow,
        f: VectorHandleFunction,
        context: Option<Box<dyn UserContext>>,
    ) -> Result<(), Fail> {
        let op: NodeOp = NodeOp::Handle {
            scalar: None,
            vector: Some(f),
        };
        self.segment_insert(flow, op, false, context, 0)?;
        Ok(())
    }

    /// Adds a handle function that may drop packets: returning `false` sends the packet to the stop ring.
    pub fn set_handler_drop(
        &mut self,
        flow: &Flow,
        f: SeparateFunction,
        context: Option<Box<dyn UserContext>>,
    ) -> Result<(), Fail> {
        let op: NodeOp = NodeOp::Separate {
            scalar: Some(f),
            vector: None,
        };
        let (seg, node) = self.segment_insert(flow, op, false, context, 1)?;
        let in_index: i32 = self.flow_in_index(flow)?;
        let dropped: Flow = self.new_flow_segment(seg, node, 0, in_index);
        self.set_stopper(&dropped)
    }

    /// Adds a vector handle function that may drop packets.
    pub fn set_vector_handler_drop(
        &mut self,
        flow: &Flow,
        f: VectorSeparateFunction,
        context: Option<Box<dyn UserContext>>,
    ) -> Result<(), Fail> {
        let op: NodeOp = NodeOp::Separate {
            scalar: None,
            vector: Some(f),
        };
        let (seg, node) = self.segment_insert(flow, op, false, context, 1)?;
        let in_index: i32 = self.flow_in_index(flow)?;
        let dropped: Flow = self.new_flow_segment(seg, node, 0, in_index);
        self.set_stopper(&dropped)
    }

    /// Adds a separate function. Packets for which `f` returns `true` remain in `flow`; the rest continue in the
    /// returned flow.
    pub fn set_separator(
        &mut self,
        flow: &Flow,
        f: SeparateFunction,
        context: Option<Box<dyn UserContext>>,
    ) -> Result<Flow, Fail> {
        let op: NodeOp = NodeOp::Separate {
            scalar: Some(f),
            vector: None,
        };
        let (seg, node) = self.segment_insert(flow, op, false, context, 1)?;
        let in_index: i32 = self.flow_in_index(flow)?;
        Ok(self.new_flow_segment(seg, node, 0, in_index))
    }

    /// Adds a vector separate function.
    pub fn set_vector_separator(
        &mut self,
        flow: &Flow,
        f: VectorSeparateFunction,
        context: Option<Box<dyn UserContext>>,
    ) -> Result<Flow, Fail> {
        let op: NodeOp = NodeOp::Separate {
            scalar: None,
            vector: Some(f),
        };
        let (seg, node) = self.segment_insert(flow, op, false, context, 1)?;
        let in_index: i32 = self.flow_in_index(flow)?;
        Ok(self.new_flow_segment(seg, node, 0, in_index))
    }

    /// Adds a split function. Closes `flow` and returns `flows_number` new flows; `f` chooses the flow of each
    /// packet.
    pub fn set_splitter(
        &mut self,
        flow: &Flow,
        f: SplitFunction,
        flows_number: usize,
        context: Option<Box<dyn UserContext>>,
    ) -> Result<Vec<Flow>, Fail> {
        let in_index: i32 = self.flow_in_index(flow)?;
        let op: NodeOp = NodeOp::Split {
            scalar: Some(f),
            vector: None,
            flows_number,
        };
        let (seg, node) = self.segment_insert(flow, op, true, context, 0)?;
        Ok((0..flows_number).map(|i| self.new_flow_segment(seg, node, i, in_index)).collect())
    }

    /// Adds a vector split function.
    pub fn set_vector_splitter(
        &mut self,
        flow: &Flow,
        f: VectorSplitFunction,
        flows_number: usize,
        context: Option<Box<dyn UserContext>>,
    ) -> Result<Vec<Flow>, Fail> {
        let in_index: i32 = self.flow_in_index(flow)?;
        let op: NodeOp = NodeOp::Split {
            scalar: None,
            vector: Some(f),
            flows_number,
        };
        let (seg, node) = self.segment_insert(flow, op, true, context, 0)?;
        Ok((0..flows_number).map(|i| self.new_flow_segment(seg, node, i, in_index)).collect())
    }

    /// Adds a partition function: each loop, `n` packets stay in `flow`, then `m` packets go to the returned flow.
    /// Cloned workers carry independent counters, so the n:m ratio holds per clone but interleaving is only
    /// contiguous within one worker.
    pub fn set_partitioner(&mut self, flow: &Flow, n: u64, m: u64) -> Result<Flow, Fail> {
        if n == 0 || m == 0 {
            warn!("set_partitioner(): one of the partition arguments is zero");
        }
        let context: Box<dyn UserContext> = Box::new(PartitionCtx::new(n, m));
        let (seg, node) = self.segment_insert(flow, NodeOp::Partition, false, Some(context), 0)?;
        let in_index: i32 = self.flow_in_index(flow)?;
        Ok(self.new_flow_segment(seg, node, 1, in_index))
    }

    /// Adds a copy function. Every packet of `flow` is duplicated; the duplicate continues in the returned flow.
    pub fn set_copier(&mut self, flow: &Flow) -> Result<Flow, Fail> {
        let idx: usize = self.check_flow(flow)?;
        let in_index: i32 = self.flows[idx].in_index_number;
        let ring_first: Rings = self.create_graph_rings(in_index)?;
        let ring_second: Rings = self.create_graph_rings(in_index)?;
        let mempool: Arc<Mempool> = self.driver.create_mempool("copy")?;

        let in_rings: Rings = if self.flows[idx].segment.is_none() {
            self.flows[idx].current.clone().expect("materialized flow carries rings")
        } else {
            let bridge: Rings = self.create_graph_rings(in_index)?;
            self.segment_insert_slice(idx, bridge.clone(), false)?;
            self.flows[idx].segment = None;
            self.flows[idx].previous = None;
            bridge
        };
        self.scheduler.add_ff(
            "copy",
            FlowFunctionParams::Copy {
                in_rings,
                out: ring_first.clone(),
                out_copy: ring_second.clone(),
                mempool,
            },
            Vec::new(),
            in_index,
            CloneKind::IfUnrestricted,
        );
        self.flows[idx].current = Some(ring_first);
        Ok(self.new_flow(ring_second, in_index))
    }

    /// Merges any number of flows into a new one. All input flows are closed; the merger inserts no worker, it
    /// re-routes the producers feeding the inputs into one shared ring set.
    pub fn set_merger(&mut self, flows: &[&Flow]) -> Result<Flow, Fail> {
        if flows.is_empty() {
            return Err(Fail::new(FailKind::BadArgument, "cannot merge zero flows"));
        }
        let mut max: i32 = 0;
        for flow in flows {
            let idx: usize = self.check_flow(flow)?;
            max = max.max(self.flows[idx].in_index_number);
        }
        let rings: Rings = self.create_graph_rings(max)?;
        for flow in flows {
            let idx: usize = self.check_flow(flow)?;
            if self.flows[idx].segment.is_none() {
                let current: Rings = self.flows[idx].current.clone().expect("materialized flow carries rings");
                self.scheduler.rebind_out(&current, &rings);
                self.close_flow(idx);
            } else {
                self.segment_insert_slice(idx, rings.clone(), true)?;
            }
        }
        Ok(self.new_flow(rings, max))
    }

    //==================================================================================================================
    // Ports, capabilities and timers
    //==================================================================================================================

    /// Creates a kernel-bridge device on `port_id`, serviced from a core booked with the scheduler.
    pub fn create_kni_device(&mut self, port_id: u16, name: &str) -> Result<Kni, Fail> {
        if port_id as usize >= self.ports.len() {
            let cause: String = format!("requested KNI port exceeds number of ports (port={})", port_id);
            error!("create_kni_device(): {}", cause);
            return Err(Fail::new(FailKind::PortOutOfRange, &cause));
        }
        if self.ports[port_id as usize].will_kni {
            let cause: String = format!("two KNI devices for one port are prohibited (port={})", port_id);
            error!("create_kni_device(): {}", cause);
            return Err(Fail::new(FailKind::MultipleKniPort, &cause));
        }
        let (core, core_index): (usize, usize) = self.scheduler.get_core()?;
        self.driver.create_kni(port_id, core, name)?;
        self.ports[port_id as usize].will_kni = true;
        self.ports[port_id as usize].kni_core_index = core_index;
        Ok(Kni { port_id })
    }

    /// Checks whether a hardware offload capability is present on every listed port.
    pub fn check_hw_capability(&self, capability: HwCapability, ports: &[u16]) -> bool {
        match capability {
            HwCapability::TxChecksum => ports
                .iter()
                .all(|port: &u16| self.driver.check_hw_tx_checksum_capability(*port)),
        }
    }

    /// Enables or disables using a hardware offload capability.
    pub fn set_use_hw_capability(&self, capability: HwCapability, use_capability: bool) {
        match capability {
            HwCapability::TxChecksum => packet::set_hw_tx_checksum_flag(use_capability),
        }
    }

    /// Returns the MAC address of an Ethernet port.
    pub fn port_mac_address(&self, port: u16) -> MacAddress {
        self.driver.port_mac_address(port)
    }

    /// Binds `ip` to `port` if the port was requested by the graph.
    pub fn set_ip_for_port(&mut self, port: u16, ip: Ipv4Addr) -> Result<(), Fail> {
        for record in &self.ports {
            if record.port == port && record.was_requested {
                self.port_pairs.insert(u32::from(ip), port);
                return Ok(());
            }
        }
        let cause: String = format!("port number is wrong or port was not requested (port={})", port);
        error!("set_ip_for_port(): {}", cause);
        Err(Fail::new(FailKind::WrongPort, &cause))
    }

    /// Returns the port previously bound to `ip`, if any.
    pub fn port_for_ip(&self, ip: Ipv4Addr) -> Option<u16> {
        self.port_pairs.get(&u32::from(ip)).copied()
    }

    /// Adds a timer whose handler may run every `period`, dispatched from the scheduler tick. At least one variant
    /// must be added for the timer to fire.
    pub fn add_timer(&mut self, period: Duration, handler: TimerHandler) -> Timer {
        let timer: Timer = Timer::new(period, handler);
        self.scheduler.add_timer(timer.share());
        timer
    }

    //==================================================================================================================
    // Lifecycle
    //==================================================================================================================

    /// Creates the requested ports and the slow-path mempool. Fails while any flow is left open.
    pub fn start_ports_and_memory(&mut self) -> Result<(), Fail> {
        if self.open_flows != 0 {
            let cause: String = format!(
                "some flows are left open at the end of configuration (open={})",
                self.open_flows
            );
            error!("start_ports_and_memory(): {}", cause);
            return Err(Fail::new(FailKind::OpenedFlowAtStart, &cause));
        }
        info!("creating ports");
        for record in &mut self.ports {
            if record.was_requested {
                self.driver.create_port(
                    record.port,
                    record.will_receive,
                    record.tx_queues_number,
                    self.hw_tx_checksum,
                    record.in_index,
                )?;
            }
            record.mac = self.driver.port_mac_address(record.port);
            debug!("port {} MAC address: {}", record.port, record.mac);
        }
        let slow_pool: Arc<Mempool> = self.driver.create_mempool("slow operations")?;
        self.scheduler.set_slow_pool(slow_pool);
        Ok(())
    }

    /// Starts the system: creates ports and memory, compiles every segment, launches all workers and runs the
    /// scheduler. Does not return until a [Controller] asks for a stop; on return the workers are terminated and
    /// driver resources are released.
    pub fn start(&mut self) -> Result<(), Fail> {
        self.start_ports_and_memory()?;

        let mut compiled: Vec<(Arc<segment::CompiledSegment>, Vec<Option<Box<dyn UserContext>>>)> = Vec::new();
        for builder in self.segments.drain(..) {
            let (seg, contexts) = builder.compile()?;
            compiled.push((Arc::new(seg), contexts));
        }
        self.scheduler.install_segments(compiled);

        self.scheduler.system_start()?;
        info!("system started");
        self.scheduler.schedule();
        self.system_stop()
    }

    /// Stops the system and releases driver resources without tearing the driver down.
    fn system_stop(&mut self) -> Result<(), Fail> {
        self.scheduler.system_stop();
        for record in &mut self.ports {
            if record.was_requested {
                self.driver.stop_port(record.port);
                record.was_requested = false;
                record.tx_queues_number = 0;
                record.will_receive = false;
            }
            if record.will_kni {
                self.driver.free_kni(record.port)?;
                self.scheduler.set_core_by_index(record.kni_core_index);
                record.will_kni = false;
            }
        }
        self.driver.free_mempools();
        Ok(())
    }

    /// Stops the whole framework and tears the driver down.
    pub fn reset(mut self) -> Result<(), Fail> {
        self.system_stop()?;
        self.driver.finalize();
        Ok(())
    }

    //==================================================================================================================
    // Flow bookkeeping
    //==================================================================================================================

    fn add_fast_generator(
        &mut self,
        f: Option<GenerateFunction>,
        vf: Option<VectorGenerateFunction>,
        target_speed: u64,
        context: Option<Box<dyn UserContext>>,
    ) -> Result<Flow, Fail> {
        let speed: f64 = target_speed as f64;
        if speed <= 0.0 {
            return Err(Fail::new(FailKind::BadArgument, "target speed value should be > 0"));
        }
        if speed / (1000.0 / self.sched_time_ms as f64) < BURST_SIZE as f64 {
            // One burst per schedule tick is the smallest unit the scheduler can pace.
            return Err(Fail::new(
                FailKind::BadArgument,
                "target speed per schedule time should be more than burst size",
            ));
        }
        let rings: Rings = self.create_graph_rings(1)?;
        let mempool: Arc<Mempool> = self.driver.create_mempool("fast generate")?;
        self.scheduler.add_ff(
            "fast generator",
            FlowFunctionParams::FastGenerate {
                out: rings.clone(),
                f,
                vf,
                mempool,
                target_speed: speed,
            },
            vec![context],
            0,
            CloneKind::Always,
        );
        Ok(self.new_flow(rings, 1))
    }

    fn create_graph_rings(&self, lanes: i32) -> Result<Rings, Fail> {
        create_rings(self.ring_capacity, lanes)
    }

    fn new_flow(&mut self, rings: Rings, in_index_number: i32) -> Flow {
        self.flows.push(FlowState {
            current: Some(rings),
            segment: None,
            previous: None,
            in_index_number,
        });
        self.open_flows += 1;
        Flow {
            id: self.flows.len() - 1,
        }
    }

    fn new_flow_segment(&mut self, seg: usize, node: usize, branch: usize, in_index_number: i32) -> Flow {
        self.flows.push(FlowState {
            current: None,
            segment: Some(seg),
            previous: Some((node, branch)),
            in_index_number,
        });
        self.open_flows += 1;
        Flow {
            id: self.flows.len() - 1,
        }
    }

    fn check_flow(&self, flow: &Flow) -> Result<usize, Fail> {
        let state: &FlowState = match self.flows.get(flow.id) {
            Some(state) => state,
            None => {
                error!("check_flow(): one of the flows is nil");
                return Err(Fail::new(FailKind::NilFlow, "one of the flows is nil"));
            },
        };
        if state.current.is_none() && state.previous.is_none() {
            error!("check_flow(): one of the flows is used after it was closed");
            return Err(Fail::new(
                FailKind::ClosedFlow,
                "one of the flows is used after it was closed",
            ));
        }
        Ok(flow.id)
    }

    fn flow_in_index(&self, flow: &Flow) -> Result<i32, Fail> {
        match self.flows.get(flow.id) {
            Some(state) => Ok(state.in_index_number),
            None => Err(Fail::new(FailKind::NilFlow, "one of the flows is nil")),
        }
    }

    fn close_flow(&mut self, idx: usize) {
        self.flows[idx].current = None;
        self.flows[idx].previous = None;
        self.flows[idx].segment = None;
        self.open_flows -= 1;
    }

    /// Turns `flow` into a concrete ring set for a sink and closes it. An in-segment flow first gets a terminator
    /// that emits into a freshly allocated ring set.
    fn finish_flow(&mut self, flow: &Flow) -> Result<Rings, Fail> {
        let idx: usize = self.check_flow(flow)?;
        if self.flows[idx].segment.is_none() {
            let rings: Rings = self.flows[idx].current.clone().expect("materialized flow carries rings");
            self.close_flow(idx);
            Ok(rings)
        } else {
            let rings: Rings = self.create_graph_rings(self.flows[idx].in_index_number)?;
            self.segment_insert_slice(idx, rings.clone(), true)?;
            Ok(rings)
        }
    }

    /// Attaches a slice terminator emitting into `out_rings` at the attach point of flow `idx`.
    fn segment_insert_slice(&mut self, idx: usize, out_rings: Rings, will_close: bool) -> Result<(), Fail> {
        let seg: usize = self.flows[idx].segment.expect("flow is embedded in a segment");
        let (node, branch): (usize, usize) = self.flows[idx].previous.expect("in-segment flow has an attach point");
        let builder: &mut SegmentBuilder = &mut self.segments[seg];
        let slice: usize = builder.add_slice(out_rings);
        builder.push_context(slice, None);
        builder.attach(node, branch, slice);
        if will_close {
            self.close_flow(idx);
        }
        Ok(())
    }

    /// Fuses `op` into the segment of `flow`, opening a new segment when the flow is materialized. Mixing scalar and
    /// vector nodes closes the current segment over a bridge ring and restarts fusion there. Returns the segment and
    /// node the operation landed in.
    fn segment_insert(
        &mut self,
        flow: &Flow,
        op: NodeOp,
        will_close: bool,
        context: Option<Box<dyn UserContext>>,
        next_branch: usize,
    ) -> Result<(usize, usize), Fail> {
        let idx: usize = self.check_flow(flow)?;
        let in_index: i32 = self.flows[idx].in_index_number;
        let set_type: NodeType = op.node_type();

        let (seg, node): (usize, usize) = match self.flows[idx].segment {
            None => {
                let rings: Rings = self.flows[idx].current.clone().expect("materialized flow carries rings");
                let (builder, first) = SegmentBuilder::new(rings, in_index, op, set_type);
                let seg: usize = self.segments.len();
                self.segments.push(builder);
                self.scheduler.add_ff(
                    "segment",
                    FlowFunctionParams::Segment {
                        segment: seg,
                        compiled: None,
                    },
                    Vec::new(),
                    in_index,
                    CloneKind::IfUnrestricted,
                );
                self.flows[idx].segment = Some(seg);
                (seg, first)
            },
            Some(seg) => {
                let stype: NodeType = self.segments[seg].stype;
                if set_type != NodeType::Universal && stype != NodeType::Universal && set_type != stype {
                    // Scalar and vector nodes cannot share a segment. Close this one over a bridge ring and restart
                    // fusion behind it.
                    let bridge: Rings = self.create_graph_rings(in_index)?;
                    self.segment_insert_slice(idx, bridge.clone(), false)?;
                    self.flows[idx].segment = None;
                    self.flows[idx].previous = None;
                    self.flows[idx].current = Some(bridge);
                    return self.segment_insert(flow, op, will_close, context, next_branch);
                }
                if set_type != NodeType::Universal && stype == NodeType::Universal {
                    self.segments[seg].stype = set_type;
                }
                let (parent, branch): (usize, usize) =
                    self.flows[idx].previous.expect("in-segment flow has an attach point");
                let builder: &mut SegmentBuilder = &mut self.segments[seg];
                let node: usize = builder.add_node(op);
                builder.attach(parent, branch, node);
                (seg, node)
            },
        };

        self.segments[seg].push_context(node, context);
        if will_close {
            self.close_flow(idx);
        } else if self.segments[seg].node_has_children(node) {
            self.flows[idx].previous = Some((node, next_branch));
            self.flows[idx].segment = Some(seg);
        }
        Ok((seg, node))
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Default error handler: logs the failure and exits the process with a non-zero status.
pub fn check_fatal<T>(result: Result<T, Fail>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            error!("failed with message and code: {}", e);
            process::exit(1);
        },
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
