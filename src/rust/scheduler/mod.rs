// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Scheduler: owns the worker registry, places every worker on a core, drives the periodic tick and owns the
//! clone/pause/terminate handshakes. The stop ring lives here too, doubling as the overflow sink for every
//! best-effort enqueue in the data plane.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod timer;
pub(crate) mod worker;

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::collections::ring::{
    total_len,
    Rings,
};
use crate::graph::{
    segment::CompiledSegment,
    GenerateFunction,
    UserContext,
    VectorGenerateFunction,
};
use crate::runtime::{
    fail::{
        Fail,
        FailKind,
    },
    memory::Mempool,
    network::PacketDriver,
};
use crate::scheduler::{
    timer::TimerInner,
    worker::{
        Report,
        WorkerChannels,
        ACK_READY,
        TERMINATE,
    },
};
use ::crossbeam::channel::{
    bounded,
    Receiver,
    Sender,
};
use ::parking_lot::Mutex;
use ::std::{
    sync::{
        atomic::{
            AtomicBool,
            AtomicI32,
            AtomicU64,
            Ordering,
        },
        Arc,
    },
    thread,
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Whether and when the scheduler may clone a worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CloneKind {
    /// Never cloned.
    None,
    /// Cloned whenever the load asks for it.
    Always,
    /// Cloned only when the graph tolerates reordering across clones.
    IfUnrestricted,
}

/// Parameters of one registered worker. Output rings stay rewritable until the workers are spawned, which is what
/// lets a merger re-route producers without an intermediate worker.
pub(crate) enum FlowFunctionParams {
    Receive {
        port: u16,
        kni: bool,
        out: Rings,
    },
    Generate {
        out: Rings,
        f: GenerateFunction,
    },
    FastGenerate {
        out: Rings,
        f: Option<GenerateFunction>,
        vf: Option<VectorGenerateFunction>,
        mempool: Arc<Mempool>,
        target_speed: f64,
    },
    Send {
        port: u16,
        queue: Option<u16>,
        in_rings: Rings,
    },
    Copy {
        in_rings: Rings,
        out: Rings,
        out_copy: Rings,
        mempool: Arc<Mempool>,
    },
    Read {
        filename: String,
        out: Rings,
        repcount: i32,
    },
    Write {
        filename: String,
        in_rings: Rings,
    },
    Segment {
        segment: usize,
        compiled: Option<Arc<CompiledSegment>>,
    },
}

/// How the scheduler talks to one running instance.
enum InstanceControl {
    /// Two-way channel pair: pause values and the terminate message go down, ready and terminated acks come back.
    Channel { stop_tx: Sender<i64>, ack_rx: Receiver<i64> },
    /// Driver shims poll a shared run flag instead.
    Flag(Arc<AtomicI32>),
}

/// One running worker instance (the first launch or a clone).
struct Instance {
    thread: Option<thread::JoinHandle<()>>,
    control: InstanceControl,
    report_rx: Option<Receiver<Report>>,
    core_index: Option<usize>,
    pause: i64,
}

/// One registered worker and its running instances.
pub(crate) struct FlowFunction {
    name: String,
    params: FlowFunctionParams,
    context_templates: Vec<Option<Box<dyn UserContext>>>,
    in_index_number: i32,
    clone_kind: CloneKind,
    instances: Vec<Instance>,
    packets_this_tick: u64,
    bytes_this_tick: u64,
    low_load_since: Option<Instant>,
}

/// One bookable core.
struct CoreRecord {
    id: usize,
    busy: bool,
}

/// State shared between the scheduler, its workers and [Controller] handles.
pub(crate) struct SchedulerShared {
    pub stop_ring: Rings,
    pub dropped: AtomicU64,
    pub driver: Arc<dyn PacketDriver>,
    pub slow_pool: Mutex<Option<Arc<Mempool>>>,
    pub stop_requested: AtomicBool,
    pub sched_time_ms: u64,
}

/// Stops a running system from any thread. Cancellation is cooperative: the scheduler finishes its tick, then walks
/// every worker through the terminate handshake.
#[derive(Clone)]
pub struct Controller {
    shared: Arc<SchedulerShared>,
}

/// The scheduler state.
pub(crate) struct Scheduler {
    shared: Arc<SchedulerShared>,
    cores: Vec<CoreRecord>,
    off: bool,
    off_remove: bool,
    stop_dedicated_core: bool,
    check_time_ms: u64,
    debug_time_ms: u64,
    sched_time_ms: u64,
    max_packets_to_clone: u32,
    max_recv: usize,
    unrestricted: bool,
    ffs: Vec<FlowFunction>,
    timers: Vec<Arc<TimerInner>>,
    stop_instance: Option<Instance>,
    next_shared_core: usize,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Controller {
    /// Asks the system to stop. [crate::FlowSystem::start] returns once every worker acknowledged termination.
    pub fn stop(&self) {
        self.shared.stop_requested.store(true, Ordering::Release);
    }

    /// Number of packets dropped because some ring could not take them.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl FlowFunction {
    /// Occupancy and capacity of the instance-shared input rings, for the kinds whose load is ring-driven.
    fn input_load(&self) -> Option<(usize, usize)> {
        let rings: &Rings = match &self.params {
            FlowFunctionParams::Segment {
                compiled: Some(compiled),
                ..
            } => &compiled.in_rings,
            FlowFunctionParams::Copy { in_rings, .. } => in_rings,
            _ => return None,
        };
        let capacity: usize = rings.first()?.capacity() * rings.len();
        Some((total_len(rings), capacity))
    }
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        cpus: Vec<usize>,
        off: bool,
        off_remove: bool,
        stop_dedicated_core: bool,
        stop_ring: Rings,
        check_time_ms: u64,
        debug_time_ms: u64,
        sched_time_ms: u64,
        max_packets_to_clone: u32,
        max_recv: usize,
        unrestricted: bool,
        driver: Arc<dyn PacketDriver>,
    ) -> Self {
        let cores: Vec<CoreRecord> = cpus.into_iter().map(|id: usize| CoreRecord { id, busy: false }).collect();
        Self {
            shared: Arc::new(SchedulerShared {
                stop_ring,
                dropped: AtomicU64::new(0),
                driver,
                slow_pool: Mutex::new(None),
                stop_requested: AtomicBool::new(false),
                sched_time_ms,
            }),
            cores,
            off,
            off_remove,
            stop_dedicated_core,
            check_time_ms,
            debug_time_ms,
            sched_time_ms,
            max_packets_to_clone,
            max_recv,
            unrestricted,
            ffs: Vec::new(),
            timers: Vec::new(),
            stop_instance: None,
            next_shared_core: 0,
        }
    }

    pub(crate) fn controller(&self) -> Controller {
        Controller {
            shared: self.shared.clone(),
        }
    }

    pub(crate) fn stop_ring(&self) -> Rings {
        self.shared.stop_ring.clone()
    }

    pub(crate) fn set_slow_pool(&self, pool: Arc<Mempool>) {
        *self.shared.slow_pool.lock() = Some(pool);
    }

    /// Registers a worker. Workers are spawned at [Scheduler::system_start]; until then their parameters, including
    /// output ring bindings, may still change.
    pub(crate) fn add_ff(
        &mut self,
        name: &str,
        params: FlowFunctionParams,
        context_templates: Vec<Option<Box<dyn UserContext>>>,
        in_index_number: i32,
        clone_kind: CloneKind,
    ) {
        self.ffs.push(FlowFunction {
            name: name.to_string(),
            params,
            context_templates,
            in_index_number,
            clone_kind,
            instances: Vec::new(),
            packets_this_tick: 0,
            bytes_this_tick: 0,
            low_load_since: None,
        });
    }

    /// Re-routes every registered producer whose output is `from` to `to`.
    pub(crate) fn rebind_out(&mut self, from: &Rings, to: &Rings) {
        for ff in &mut self.ffs {
            match &mut ff.params {
                FlowFunctionParams::Receive { out, .. }
                | FlowFunctionParams::Generate { out, .. }
                | FlowFunctionParams::FastGenerate { out, .. }
                | FlowFunctionParams::Read { out, .. } => {
                    if Arc::ptr_eq(out, from) {
                        *out = to.clone();
                    }
                },
                FlowFunctionParams::Copy { out, out_copy, .. } => {
                    if Arc::ptr_eq(out, from) {
                        *out = to.clone();
                    }
                    if Arc::ptr_eq(out_copy, from) {
                        *out_copy = to.clone();
                    }
                },
                _ => {},
            }
        }
    }

    /// Hands each segment worker its compiled segment and context templates.
    pub(crate) fn install_segments(
        &mut self,
        compiled: Vec<(Arc<CompiledSegment>, Vec<Option<Box<dyn UserContext>>>)>,
    ) {
        let mut compiled: Vec<Option<(Arc<CompiledSegment>, Vec<Option<Box<dyn UserContext>>>)>> =
            compiled.into_iter().map(Some).collect();
        for ff in &mut self.ffs {
            if let FlowFunctionParams::Segment { segment, compiled: slot } = &mut ff.params {
                let (seg, contexts) = compiled[*segment].take().expect("exactly one worker per segment");
                *slot = Some(seg);
                ff.context_templates = contexts;
            }
        }
    }

    pub(crate) fn add_timer(&mut self, timer: Arc<TimerInner>) {
        self.timers.push(timer);
    }

    /// Books a free core. Used for workers and for kernel-bridge devices.
    pub(crate) fn get_core(&mut self) -> Result<(usize, usize), Fail> {
        for (index, core) in self.cores.iter_mut().enumerate() {
            if !core.busy {
                core.busy = true;
                return Ok((core.id, index));
            }
        }
        Err(Fail::new(FailKind::SchedulerStart, "no free cores left"))
    }

    /// Releases a core booked with [Scheduler::get_core].
    pub(crate) fn set_core_by_index(&mut self, index: usize) {
        self.cores[index].busy = false;
    }

    /// Launches the stop worker and one instance of every registered worker.
    pub(crate) fn system_start(&mut self) -> Result<(), Fail> {
        // The scheduler itself occupies the first core.
        let (scheduler_core, _) = self.get_core()?;
        pin_to_core(scheduler_core);

        let receivers: usize = self
            .ffs
            .iter()
            .filter(|ff: &&FlowFunction| matches!(ff.params, FlowFunctionParams::Receive { kni: false, .. }))
            .count();
        if receivers > self.max_recv {
            warn!(
                "system_start(): {} receive workers exceed the configured maximum of {}",
                receivers, self.max_recv
            );
        }

        let stop_core: (usize, Option<usize>) = if self.stop_dedicated_core {
            match self.get_core() {
                Ok((core, index)) => (core, Some(index)),
                Err(_) => (scheduler_core, None),
            }
        } else {
            (scheduler_core, None)
        };
        let flag: Arc<AtomicI32> = Arc::new(AtomicI32::new(1));
        let thread: thread::JoinHandle<()> = {
            let shared: Arc<SchedulerShared> = self.shared.clone();
            let flag: Arc<AtomicI32> = flag.clone();
            let core: usize = stop_core.0;
            spawn_worker("stop", move || {
                pin_to_core(core);
                worker::stop_worker(shared, flag);
            })?
        };
        self.stop_instance = Some(Instance {
            thread: Some(thread),
            control: InstanceControl::Flag(flag),
            report_rx: None,
            core_index: stop_core.1,
            pause: 0,
        });

        for index in 0..self.ffs.len() {
            self.launch(index)?;
        }
        Ok(())
    }

    /// Runs the periodic scheduler loop until a [Controller] asks for a stop: collects reports, paces fast
    /// generators, clones and retires workers, fires timers and prints statistics.
    pub(crate) fn schedule(&mut self) {
        let tick: Duration = Duration::from_millis(self.sched_time_ms);
        let mut last_debug: Instant = Instant::now();
        while !self.shared.stop_requested.load(Ordering::Acquire) {
            thread::sleep(tick);
            self.process_reports();
            if !self.off {
                self.balance();
            }
            let now: Instant = Instant::now();
            self.timers.retain(|timer: &Arc<TimerInner>| !timer.is_stopped());
            for timer in &self.timers {
                timer.fire_due(now);
            }
            if last_debug.elapsed() >= Duration::from_millis(self.debug_time_ms) {
                self.debug_stats();
                last_debug = Instant::now();
            }
        }
    }

    /// Walks every worker through the cooperative terminate handshake, drains the stop ring one final time and
    /// retires the stop worker.
    pub(crate) fn system_stop(&mut self) {
        let mut freed_cores: Vec<usize> = Vec::new();
        for ff in &mut self.ffs {
            for instance in ff.instances.drain(..) {
                if let Some(core_index) = instance.core_index {
                    freed_cores.push(core_index);
                }
                Self::stop_instance(instance);
            }
        }
        for core_index in freed_cores {
            self.set_core_by_index(core_index);
        }

        if let Some(instance) = self.stop_instance.take() {
            // Give the stop worker a moment to drain what terminated workers left behind.
            let deadline: Instant = Instant::now() + Duration::from_millis(200);
            while total_len(&self.shared.stop_ring) > 0 && Instant::now() < deadline {
                thread::yield_now();
            }
            let core_index: Option<usize> = instance.core_index;
            Self::stop_instance(instance);
            if let Some(core_index) = core_index {
                self.set_core_by_index(core_index);
            }
        }
    }

    //==================================================================================================================
    // Internals
    //==================================================================================================================

    /// Launches one instance of worker `index`: books a core, copies the context templates and spawns the matching
    /// entry point. Instances beyond the core count share cores.
    fn launch(&mut self, index: usize) -> Result<(), Fail> {
        let (core, core_index): (usize, Option<usize>) = match self.get_core() {
            Ok((core, core_index)) => (core, Some(core_index)),
            Err(_) => {
                let core: usize = self.cores[self.next_shared_core % self.cores.len()].id;
                self.next_shared_core += 1;
                debug!("launch(): no free cores left, sharing core {}", core);
                (core, None)
            },
        };
        let shared: Arc<SchedulerShared> = self.shared.clone();

        let ff: &FlowFunction = &self.ffs[index];
        let lanes: i32 = ff.in_index_number.max(1);
        let mut in_index: Vec<i32> = Vec::with_capacity(lanes as usize + 1);
        in_index.push(lanes);
        for lane in 0..lanes {
            in_index.push(lane);
        }
        let contexts: Vec<Option<Box<dyn UserContext>>> = ff
            .context_templates
            .iter()
            .map(|c: &Option<Box<dyn UserContext>>| c.as_ref().map(|c: &Box<dyn UserContext>| c.duplicate()))
            .collect();
        let thread_name: String = format!("{}-{}", ff.name, ff.instances.len());

        let (instance, awaits_ready): (Instance, bool) = match &ff.params {
            FlowFunctionParams::Receive { port, kni, out } => {
                let (port, kni, out) = (*port, *kni, out.clone());
                let flag: Arc<AtomicI32> = Arc::new(AtomicI32::new(1));
                let worker_flag: Arc<AtomicI32> = flag.clone();
                let thread = spawn_worker(&thread_name, move || {
                    pin_to_core(core);
                    worker::receive_worker(shared, port, kni, out, in_index, worker_flag);
                })?;
                (flag_instance(thread, flag, core_index), false)
            },
            FlowFunctionParams::Send { port, queue, in_rings } => {
                let (port, queue, in_rings) = (*port, *queue, in_rings.clone());
                let flag: Arc<AtomicI32> = Arc::new(AtomicI32::new(1));
                let worker_flag: Arc<AtomicI32> = flag.clone();
                let thread = spawn_worker(&thread_name, move || {
                    pin_to_core(core);
                    worker::send_worker(shared, port, queue, in_rings, in_index, worker_flag);
                })?;
                (flag_instance(thread, flag, core_index), false)
            },
            FlowFunctionParams::Generate { out, f } => {
                let (out, f) = (out.clone(), f.clone());
                let (channels, control, report_rx) = make_channels(false);
                let thread = spawn_worker(&thread_name, move || {
                    pin_to_core(core);
                    worker::generate_worker(shared, out, f, channels, contexts);
                })?;
                (channel_instance(thread, control, report_rx, core_index), true)
            },
            FlowFunctionParams::FastGenerate {
                out, f, vf, mempool, ..
            } => {
                let (out, f, vf, mempool) = (out.clone(), f.clone(), vf.clone(), mempool.clone());
                let (channels, control, report_rx) = make_channels(true);
                let thread = spawn_worker(&thread_name, move || {
                    pin_to_core(core);
                    worker::fast_generate_worker(shared, out, f, vf, mempool, channels, contexts);
                })?;
                (channel_instance(thread, control, report_rx, core_index), true)
            },
            FlowFunctionParams::Copy {
                in_rings,
                out,
                out_copy,
                mempool,
            } => {
                let (in_rings, out, out_copy, mempool) =
                    (in_rings.clone(), out.clone(), out_copy.clone(), mempool.clone());
                let (channels, control, report_rx) = make_channels(true);
                let thread = spawn_worker(&thread_name, move || {
                    pin_to_core(core);
                    worker::copy_worker(shared, in_rings, out, out_copy, mempool, in_index, channels);
                })?;
                (channel_instance(thread, control, report_rx, core_index), true)
            },
            FlowFunctionParams::Read { filename, out, repcount } => {
                let (filename, out, repcount) = (filename.clone(), out.clone(), *repcount);
                let (channels, control, report_rx) = make_channels(false);
                let thread = spawn_worker(&thread_name, move || {
                    pin_to_core(core);
                    worker::read_worker(shared, filename, out, repcount, channels);
                })?;
                (channel_instance(thread, control, report_rx, core_index), false)
            },
            FlowFunctionParams::Write { filename, in_rings } => {
                let (filename, in_rings) = (filename.clone(), in_rings.clone());
                let (channels, control, report_rx) = make_channels(false);
                let thread = spawn_worker(&thread_name, move || {
                    pin_to_core(core);
                    worker::write_worker(shared, filename, in_rings, in_index, channels);
                })?;
                (channel_instance(thread, control, report_rx, core_index), false)
            },
            FlowFunctionParams::Segment { compiled, .. } => {
                let compiled: Arc<CompiledSegment> = compiled
                    .as_ref()
                    .expect("segments are compiled before workers launch")
                    .clone();
                let lanes: i32 = compiled.in_index_number.max(1);
                let mut in_index: Vec<i32> = Vec::with_capacity(lanes as usize + 1);
                in_index.push(lanes);
                for lane in 0..lanes {
                    in_index.push(lane);
                }
                let (channels, control, report_rx) = make_channels(true);
                let thread = spawn_worker(&thread_name, move || {
                    pin_to_core(core);
                    worker::segment_worker(shared, compiled, in_index, channels, contexts);
                })?;
                (channel_instance(thread, control, report_rx, core_index), true)
            },
        };

        if awaits_ready {
            if let InstanceControl::Channel { ack_rx, .. } = &instance.control {
                match ack_rx.recv_timeout(Duration::from_secs(5)) {
                    Ok(ACK_READY) => {},
                    _ => {
                        let cause: String = format!("worker did not report ready (name={})", thread_name);
                        error!("launch(): {}", cause);
                        return Err(Fail::new(FailKind::SchedulerStart, &cause));
                    },
                }
            }
        }
        self.ffs[index].instances.push(instance);
        Ok(())
    }

    fn stop_instance(mut instance: Instance) {
        match &instance.control {
            InstanceControl::Channel { stop_tx, ack_rx } => {
                let _ = stop_tx.send(TERMINATE);
                let _ = ack_rx.recv_timeout(Duration::from_secs(5));
            },
            InstanceControl::Flag(flag) => {
                flag.store(0, Ordering::Release);
            },
        }
        if let Some(thread) = instance.thread.take() {
            let _ = thread.join();
        }
    }

    fn process_reports(&mut self) {
        for ff in &mut self.ffs {
            let mut packets: u64 = 0;
            let mut bytes: u64 = 0;
            for instance in &ff.instances {
                if let Some(report_rx) = &instance.report_rx {
                    for report in report_rx.try_iter() {
                        packets += report.packets;
                        bytes += report.bytes;
                    }
                }
            }
            ff.packets_this_tick = packets;
            ff.bytes_this_tick = bytes;
        }
    }

    /// The load-balancing pass of one tick: pace fast generators towards their target, clone ring-fed workers whose
    /// input is filling up, retire extra clones after a sustained quiet period.
    fn balance(&mut self) {
        let now: Instant = Instant::now();
        for index in 0..self.ffs.len() {
            let clonable: bool = match self.ffs[index].clone_kind {
                CloneKind::Always => true,
                CloneKind::IfUnrestricted => self.unrestricted,
                CloneKind::None => false,
            };

            let target_speed: Option<f64> = match &self.ffs[index].params {
                FlowFunctionParams::FastGenerate { target_speed, .. } => Some(*target_speed),
                _ => None,
            };
            if let Some(target_speed) = target_speed {
                self.pace_fast_generator(index, target_speed, clonable);
                continue;
            }
            if !clonable {
                continue;
            }

            let (occupancy, capacity): (usize, usize) = match self.ffs[index].input_load() {
                Some(load) => load,
                None => continue,
            };
            if occupancy > self.max_packets_to_clone as usize {
                self.ffs[index].low_load_since = None;
                if self.ffs[index].instances.len() < self.cores.len() && self.launch(index).is_err() {
                    debug!("balance(): could not clone {}", self.ffs[index].name);
                }
            } else if occupancy < capacity / 2 {
                match self.ffs[index].low_load_since {
                    None => self.ffs[index].low_load_since = Some(now),
                    Some(since) => {
                        if now.duration_since(since) >= Duration::from_millis(self.check_time_ms)
                            && self.ffs[index].instances.len() > 1
                            && !self.off_remove
                        {
                            if let Some(instance) = self.ffs[index].instances.pop() {
                                let core_index: Option<usize> = instance.core_index;
                                Self::stop_instance(instance);
                                if let Some(core_index) = core_index {
                                    self.set_core_by_index(core_index);
                                }
                            }
                            self.ffs[index].low_load_since = None;
                        }
                    },
                }
            } else {
                self.ffs[index].low_load_since = None;
            }
        }
    }

    /// Nudges the per-burst pause of every instance of a fast generator towards its target rate; clones once the
    /// pause bottoms out and the rate still falls short.
    fn pace_fast_generator(&mut self, index: usize, target_speed: f64, clonable: bool) {
        let wanted: f64 = target_speed * self.sched_time_ms as f64 / 1000.0;
        let measured: f64 = self.ffs[index].packets_this_tick as f64;
        if measured > wanted {
            for instance in self.ffs[index].instances.iter_mut() {
                instance.pause += instance.pause / 8 + 1;
                if let InstanceControl::Channel { stop_tx, .. } = &instance.control {
                    let _ = stop_tx.try_send(instance.pause);
                }
            }
        } else if measured < wanted * 0.95 {
            let mut exhausted: bool = true;
            for instance in self.ffs[index].instances.iter_mut() {
                if instance.pause > 0 {
                    instance.pause -= instance.pause / 8 + 1;
                    if instance.pause < 0 {
                        instance.pause = 0;
                    }
                    if let InstanceControl::Channel { stop_tx, .. } = &instance.control {
                        let _ = stop_tx.try_send(instance.pause);
                    }
                }
                exhausted &= instance.pause == 0;
            }
            if exhausted
                && clonable
                && measured < wanted * 0.9
                && self.ffs[index].instances.len() < self.cores.len()
                && self.launch(index).is_err()
            {
                debug!("pace_fast_generator(): could not clone {}", self.ffs[index].name);
            }
        }
    }

    fn debug_stats(&self) {
        let mut summary: String = String::new();
        for ff in &self.ffs {
            summary.push_str(&format!(
                " [{}: instances={} packets={} bytes={}]",
                ff.name,
                ff.instances.len(),
                ff.packets_this_tick,
                ff.bytes_this_tick
            ));
        }
        debug!(
            "scheduler: dropped={}{}",
            self.shared.dropped.load(Ordering::Relaxed),
            summary
        );
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

fn make_channels(with_report: bool) -> (WorkerChannels, InstanceControl, Option<Receiver<Report>>) {
    let (stop_tx, stop_rx): (Sender<i64>, Receiver<i64>) = bounded(4);
    let (ack_tx, ack_rx): (Sender<i64>, Receiver<i64>) = bounded(4);
    let (report_tx, report_rx): (Option<Sender<Report>>, Option<Receiver<Report>>) = if with_report {
        let (tx, rx): (Sender<Report>, Receiver<Report>) = bounded(8);
        (Some(tx), Some(rx))
    } else {
        (None, None)
    };
    (
        WorkerChannels {
            stop_rx,
            ack_tx,
            report_tx,
        },
        InstanceControl::Channel { stop_tx, ack_rx },
        report_rx,
    )
}

fn flag_instance(thread: thread::JoinHandle<()>, flag: Arc<AtomicI32>, core_index: Option<usize>) -> Instance {
    Instance {
        thread: Some(thread),
        control: InstanceControl::Flag(flag),
        report_rx: None,
        core_index,
        pause: 0,
    }
}

fn channel_instance(
    thread: thread::JoinHandle<()>,
    control: InstanceControl,
    report_rx: Option<Receiver<Report>>,
    core_index: Option<usize>,
) -> Instance {
    Instance {
        thread: Some(thread),
        control,
        report_rx,
        core_index,
        pause: 0,
    }
}

fn spawn_worker<F>(name: &str, body: F) -> Result<thread::JoinHandle<()>, Fail>
where
    F: FnOnce() + Send + 'static,
{
    match thread::Builder::new().name(name.to_string()).spawn(body) {
        Ok(handle) => Ok(handle),
        Err(_) => {
            let cause: String = format!("failed to spawn worker thread (name={})", name);
            error!("spawn_worker(): {}", cause);
            Err(Fail::new(FailKind::SchedulerStart, &cause))
        },
    }
}

/// Pins the calling thread to `core`. Workers busy-poll, so each one wants a core of its own.
#[cfg(target_os = "linux")]
fn pin_to_core(core: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = ::std::mem::zeroed();
        libc::CPU_SET(core % libc::CPU_SETSIZE as usize, &mut set);
        if libc::sched_setaffinity(0, ::std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            warn!("pin_to_core(): failed to pin thread (core={})", core);
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_to_core(_core: usize) {}
