// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Worker entry points. Each function here is the body of one pinned, busy-polling worker thread. The loop discipline
//! is shared by all of them: a non-blocking control-channel check at the top, an optional busy-wait implementing the
//! scheduler's pause, then a burst dequeue that returns immediately. None of them ever sleeps or blocks on I/O inside
//! the hot loop.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::collections::ring::{
    Ring,
    Rings,
};
use crate::graph::{
    segment::{
        CompiledSegment,
        SegmentExecutor,
    },
    GenerateFunction,
    UserContext,
    VectorGenerateFunction,
};
use crate::packet::{
    pcap,
    Packet,
};
use crate::runtime::{
    memory::{
        MbufHandle,
        Mempool,
    },
    network::consts::{
        BURST_SIZE,
        REPORT_MBITS,
    },
};
use crate::scheduler::SchedulerShared;
use ::crossbeam::channel::{
    Receiver,
    Sender,
};
use ::std::{
    fs::File,
    hint,
    io::{
        BufReader,
        Seek,
        SeekFrom,
    },
    process,
    sync::{
        atomic::{
            AtomicI32,
            Ordering,
        },
        Arc,
    },
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Control message asking a worker to terminate.
pub(crate) const TERMINATE: i64 = -1;

/// Acknowledgement a worker sends once it is ready to process packets.
pub(crate) const ACK_READY: i64 = 2;

/// Acknowledgement a worker sends right before returning.
pub(crate) const ACK_TERMINATED: i64 = 1;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Statistics a worker accumulated since its last report.
#[derive(Clone, Copy, Default)]
pub(crate) struct Report {
    pub packets: u64,
    pub bytes: u64,
}

/// Control endpoints owned by the worker side of the handshake.
pub(crate) struct WorkerChannels {
    pub stop_rx: Receiver<i64>,
    pub ack_tx: Sender<i64>,
    pub report_tx: Option<Sender<Report>>,
}

/// What the control-channel check at the top of a worker loop decided.
enum Control {
    Continue,
    Terminate,
    Pause(i64),
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Tries to enqueue a burst into `ring`. Overflow goes to the process-wide stop ring; if that is saturated too, the
/// residual is released through the driver's synchronous free. The shortfall is accounted as dropped either way, so
/// backpressure never blocks a polling worker.
pub(crate) fn safe_enqueue(shared: &SchedulerShared, ring: &Ring, data: &[MbufHandle]) {
    let done: usize = ring.enqueue_burst(data);
    if done < data.len() {
        shared.dropped.fetch_add((data.len() - done) as u64, Ordering::Relaxed);
        let done2: usize = shared.stop_ring[0].enqueue_burst(&data[done..]);
        if done + done2 < data.len() {
            warn!("safe_enqueue(): stop ring is crowded, using synchronous free instead");
            shared.driver.free_mbufs(&data[done + done2..]);
        }
    }
}

/// Single-packet convenience wrapper around [safe_enqueue]. Only for paths that are not performance critical.
pub(crate) fn safe_enqueue_one(shared: &SchedulerShared, ring: &Ring, handle: MbufHandle) {
    safe_enqueue(shared, ring, &[handle]);
}

/// Hands mbufs whose packets left the graph to the stop worker; falls back to the synchronous free when the stop
/// ring is saturated.
fn release_to_stop(shared: &SchedulerShared, data: &[MbufHandle]) {
    let done: usize = shared.stop_ring[0].enqueue_burst(data);
    if done < data.len() {
        shared.driver.free_mbufs(&data[done..]);
    }
}

/// Busy-waits for `nanos`. OS sleep granularity exceeds the burst period, so rate control spins on the monotonic
/// clock instead of yielding.
fn busy_wait(nanos: i64) {
    let deadline: Duration = Duration::from_nanos(nanos as u64);
    let start: Instant = Instant::now();
    while start.elapsed() < deadline {
        hint::spin_loop();
    }
}

/// Logs a fatal condition and terminates the process. The data plane cannot re-establish its polling invariants
/// after a driver or file fault mid-flight.
fn fatal(location: &str, cause: &str) -> ! {
    error!("{}: {}", location, cause);
    process::exit(1);
}

fn check_control(stop_rx: &Receiver<i64>) -> Control {
    match stop_rx.try_recv() {
        Ok(TERMINATE) => Control::Terminate,
        Ok(pause) => Control::Pause(pause),
        Err(_) => Control::Continue,
    }
}

fn delete_contexts(contexts: &mut [Option<Box<dyn UserContext>>]) {
    for context in contexts.iter_mut() {
        if let Some(context) = context {
            context.delete();
        }
    }
}

//======================================================================================================================
// Driver shims
//======================================================================================================================

/// Receive worker: a thin shim over the driver's burst receive on the owned lane set.
pub(crate) fn receive_worker(
    shared: Arc<SchedulerShared>,
    port: u16,
    kni: bool,
    out: Rings,
    in_index: Vec<i32>,
    flag: Arc<AtomicI32>,
) {
    let mut bufs: [MbufHandle; BURST_SIZE] = [0; BURST_SIZE];
    while flag.load(Ordering::Acquire) == 1 {
        if kni {
            let count: usize = shared.driver.kni_receive_burst(port, &mut bufs);
            if count > 0 {
                safe_enqueue(&shared, &out[0], &bufs[..count]);
            }
        } else {
            for q in 1..=in_index[0] as usize {
                let lane: usize = in_index[q] as usize;
                let count: usize = shared.driver.receive_burst(port, lane, &mut bufs);
                if count > 0 {
                    safe_enqueue(&shared, &out[lane], &bufs[..count]);
                }
            }
        }
    }
}

/// Send worker: drains its lanes into one transmit queue of the port, or into the kernel-bridge device when no
/// queue is booked. Whatever the driver does not accept is released and accounted as dropped.
pub(crate) fn send_worker(
    shared: Arc<SchedulerShared>,
    port: u16,
    queue: Option<u16>,
    in_rings: Rings,
    in_index: Vec<i32>,
    flag: Arc<AtomicI32>,
) {
    let mut bufs: [MbufHandle; BURST_SIZE] = [0; BURST_SIZE];
    while flag.load(Ordering::Acquire) == 1 {
        for lane in 0..in_index[0] as usize {
            let count: usize = in_rings[lane].dequeue_burst(&mut bufs);
            if count == 0 {
                continue;
            }
            let sent: usize = match queue {
                Some(queue) => shared.driver.send_burst(port, queue, &bufs[..count]),
                None => shared.driver.kni_send_burst(port, &bufs[..count]),
            };
            if sent < count {
                shared.dropped.fetch_add((count - sent) as u64, Ordering::Relaxed);
                shared.driver.free_mbufs(&bufs[sent..count]);
            }
        }
    }
}

/// Stop worker: drains the process-wide stop ring and releases the mbufs to the driver.
pub(crate) fn stop_worker(shared: Arc<SchedulerShared>, flag: Arc<AtomicI32>) {
    let mut bufs: [MbufHandle; BURST_SIZE] = [0; BURST_SIZE];
    while flag.load(Ordering::Acquire) == 1 {
        for lane in 0..shared.stop_ring.len() {
            let count: usize = shared.stop_ring[lane].dequeue_burst(&mut bufs);
            if count > 0 {
                shared.driver.free_mbufs(&bufs[..count]);
            }
        }
    }
}

//======================================================================================================================
// Generators
//======================================================================================================================

/// Fixed generator: allocates one packet at a time from the slow-path pool and never clones. Useful for graphs that
/// wait for sporadic user packets.
pub(crate) fn generate_worker(
    shared: Arc<SchedulerShared>,
    out: Rings,
    f: GenerateFunction,
    ch: WorkerChannels,
    mut contexts: Vec<Option<Box<dyn UserContext>>>,
) {
    let pool: Arc<Mempool> = match shared.slow_pool.lock().clone() {
        Some(pool) => pool,
        None => fatal("generate_worker()", "slow-path mempool was never created"),
    };
    let _ = ch.ack_tx.send(ACK_READY);
    loop {
        match check_control(&ch.stop_rx) {
            Control::Continue => {},
            _ => {
                delete_contexts(&mut contexts);
                let _ = ch.ack_tx.send(ACK_TERMINATED);
                return;
            },
        }
        let handle: MbufHandle = match pool.alloc_one() {
            Ok(handle) => handle,
            Err(e) => fatal("generate_worker()", &e.cause),
        };
        let mut packet: Packet = Packet::extract(handle);
        f(&mut packet, contexts[0].as_mut());
        safe_enqueue_one(&shared, &out[0], handle);
    }
}

/// Fast generator: bulk-allocates whole bursts from its own pool and spins for `pause` nanoseconds per packet after
/// each burst. The scheduler adjusts the pause to steer the rate towards the target and clones the worker when the
/// pause alone cannot reach it.
pub(crate) fn fast_generate_worker(
    shared: Arc<SchedulerShared>,
    out: Rings,
    f: Option<GenerateFunction>,
    vf: Option<VectorGenerateFunction>,
    mempool: Arc<Mempool>,
    ch: WorkerChannels,
    mut contexts: Vec<Option<Box<dyn UserContext>>>,
) {
    let vector: bool = vf.is_some();
    let mut bufs: [MbufHandle; BURST_SIZE] = [0; BURST_SIZE];
    let mut packets: Vec<Packet> = Vec::with_capacity(BURST_SIZE);
    let mut current: Report = Report::default();
    let mut pause: i64 = 0;
    let tick: Duration = Duration::from_millis(shared.sched_time_ms);
    let mut report_deadline: Instant = Instant::now() + tick;
    let _ = ch.ack_tx.send(ACK_READY);

    loop {
        match check_control(&ch.stop_rx) {
            Control::Continue => {},
            Control::Terminate => {
                delete_contexts(&mut contexts);
                let _ = ch.ack_tx.send(ACK_TERMINATED);
                return;
            },
            Control::Pause(p) => {
                pause = p;
                report_deadline = Instant::now() + tick;
                current = Report::default();
            },
        }
        if Instant::now() >= report_deadline {
            if let Some(report_tx) = &ch.report_tx {
                let _ = report_tx.try_send(current);
            }
            current = Report::default();
            report_deadline += tick;
        }

        if let Err(e) = mempool.alloc_bulk(&mut bufs) {
            fatal("fast_generate_worker()", &e.cause);
        }
        if !vector {
            let f: &GenerateFunction = f.as_ref().expect("scalar fast generator carries a callable");
            for handle in &bufs {
                let mut packet: Packet = Packet::extract(*handle);
                f(&mut packet, contexts[0].as_mut());
                if REPORT_MBITS {
                    current.bytes += packet.len() as u64;
                }
            }
        } else {
            let vf: &VectorGenerateFunction = vf.as_ref().expect("vector fast generator carries a callable");
            Packet::extract_packets(&mut packets, &bufs, BURST_SIZE);
            vf(&mut packets, contexts[0].as_mut());
        }
        safe_enqueue(&shared, &out[0], &bufs);
        current.packets += BURST_SIZE as u64;
        if pause != 0 {
            busy_wait(pause * BURST_SIZE as i64);
        }
    }
}

//======================================================================================================================
// Copy
//======================================================================================================================

/// Copy worker: duplicates every packet of its lanes into freshly allocated mbufs, emitting the original and the
/// copy into separate ring sets.
pub(crate) fn copy_worker(
    shared: Arc<SchedulerShared>,
    in_rings: Rings,
    out: Rings,
    out_copy: Rings,
    mempool: Arc<Mempool>,
    in_index: Vec<i32>,
    ch: WorkerChannels,
) {
    let mut bufs1: [MbufHandle; BURST_SIZE] = [0; BURST_SIZE];
    let mut bufs2: [MbufHandle; BURST_SIZE] = [0; BURST_SIZE];
    let mut current: Report = Report::default();
    let mut pause: i64 = 0;
    let tick: Duration = Duration::from_millis(shared.sched_time_ms);
    let mut report_deadline: Instant = Instant::now() + tick;
    let _ = ch.ack_tx.send(ACK_READY);

    loop {
        match check_control(&ch.stop_rx) {
            Control::Continue => {},
            Control::Terminate => {
                let _ = ch.ack_tx.send(ACK_TERMINATED);
                return;
            },
            Control::Pause(p) => {
                pause = p;
                report_deadline = Instant::now() + tick;
                current = Report::default();
            },
        }
        if Instant::now() >= report_deadline {
            if let Some(report_tx) = &ch.report_tx {
                let _ = report_tx.try_send(current);
            }
            current = Report::default();
            report_deadline += tick;
        }

        for q in 1..=in_index[0] as usize {
            let lane: usize = in_index[q] as usize;
            let count: usize = in_rings[lane].dequeue_burst(&mut bufs1);
            if count != 0 {
                if let Err(e) = mempool.alloc_bulk(&mut bufs2[..count]) {
                    fatal("copy_worker()", &e.cause);
                }
                for i in 0..count {
                    let original: Packet = Packet::extract(bufs1[i]);
                    let mut duplicate: Packet = Packet::extract(bufs2[i]);
                    if let Err(e) = duplicate.generate_from_bytes(original.data()) {
                        fatal("copy_worker()", &e.cause);
                    }
                    if REPORT_MBITS {
                        current.bytes += original.len() as u64;
                    }
                }
                safe_enqueue(&shared, &out[lane], &bufs1[..count]);
                safe_enqueue(&shared, &out_copy[lane], &bufs2[..count]);
                current.packets += count as u64;
            }
            if pause != 0 {
                busy_wait(pause * BURST_SIZE as i64);
            }
        }
    }
}

//======================================================================================================================
// Segment processing
//======================================================================================================================

/// Segment worker: dequeues bursts from its lanes and runs them through the compiled node tree, enqueueing each
/// terminator's packets into the matching output ring of the same lane.
pub(crate) fn segment_worker(
    shared: Arc<SchedulerShared>,
    segment: Arc<CompiledSegment>,
    in_index: Vec<i32>,
    ch: WorkerChannels,
    contexts: Vec<Option<Box<dyn UserContext>>>,
) {
    let in_rings: Rings = segment.in_rings.clone();
    let outs: Vec<Rings> = segment.out.clone();
    let mut executor: SegmentExecutor = SegmentExecutor::new(segment, contexts);
    let mut input: [MbufHandle; BURST_SIZE] = [0; BURST_SIZE];
    let mut current: Report = Report::default();
    let mut pause: i64 = 0;
    let tick: Duration = Duration::from_millis(shared.sched_time_ms);
    let mut report_deadline: Instant = Instant::now() + tick;
    let _ = ch.ack_tx.send(ACK_READY);

    loop {
        match check_control(&ch.stop_rx) {
            Control::Continue => {},
            Control::Terminate => {
                executor.retire();
                let _ = ch.ack_tx.send(ACK_TERMINATED);
                return;
            },
            Control::Pause(p) => {
                pause = p;
                report_deadline = Instant::now() + tick;
                current = Report::default();
            },
        }
        if Instant::now() >= report_deadline {
            if let Some(report_tx) = &ch.report_tx {
                let _ = report_tx.try_send(current);
            }
            current = Report::default();
            report_deadline += tick;
        }

        for q in 1..=in_index[0] as usize {
            let lane: usize = in_index[q] as usize;
            let count: usize = in_rings[lane].dequeue_burst(&mut input);
            if count == 0 {
                if pause != 0 {
                    busy_wait(pause * BURST_SIZE as i64);
                }
                continue;
            }
            let (packets, bytes) = executor.process_burst(&input, count, &mut |out_index, handles| {
                safe_enqueue(&shared, &outs[out_index][lane], handles);
            });
            current.packets += packets;
            current.bytes += bytes;
        }
    }
}

//======================================================================================================================
// File I/O
//======================================================================================================================

/// Reader worker: replays a pcap file into the graph, rewinding `repcount` times before going quiet.
pub(crate) fn read_worker(
    shared: Arc<SchedulerShared>,
    filename: String,
    out: Rings,
    repcount: i32,
    ch: WorkerChannels,
) {
    let pool: Arc<Mempool> = match shared.slow_pool.lock().clone() {
        Some(pool) => pool,
        None => fatal("read_worker()", "slow-path mempool was never created"),
    };
    let file: File = match File::open(&filename) {
        Ok(file) => file,
        Err(e) => fatal("read_worker()", &e.to_string()),
    };
    let mut reader: BufReader<File> = BufReader::new(file);
    if let Err(e) = pcap::read_global_header(&mut reader) {
        fatal("read_worker()", &e.cause);
    }

    let mut count: i32 = 0;
    let mut done: bool = count >= repcount;
    loop {
        match check_control(&ch.stop_rx) {
            Control::Continue => {},
            _ => {
                let _ = ch.ack_tx.send(ACK_TERMINATED);
                return;
            },
        }
        if done {
            hint::spin_loop();
            continue;
        }
        let handle: MbufHandle = match pool.alloc_one() {
            Ok(handle) => handle,
            Err(e) => fatal("read_worker()", &e.cause),
        };
        let mut packet: Packet = Packet::extract(handle);
        let eof: bool = match pcap::read_one_packet(&mut reader, &mut packet) {
            Ok(eof) => eof,
            Err(e) => fatal("read_worker()", &e.cause),
        };
        if eof {
            count += 1;
            if count == repcount {
                shared.driver.free_mbufs(&[handle]);
                done = true;
                continue;
            }
            if let Err(e) = reader.seek(SeekFrom::Start(pcap::PCAP_GLOBAL_HEADER_SIZE)) {
                fatal("read_worker()", &e.to_string());
            }
            match pcap::read_one_packet(&mut reader, &mut packet) {
                Ok(false) => {},
                Ok(true) => {
                    // The file holds no records at all.
                    shared.driver.free_mbufs(&[handle]);
                    done = true;
                    continue;
                },
                Err(e) => fatal("read_worker()", &e.cause),
            }
        }
        safe_enqueue_one(&shared, &out[0], handle);
    }
}

/// Writer worker: writes the pcap global header once, then one record per dequeued packet, returning each mbuf to
/// the stop ring right after it is written out. Writes go straight to the file; this is a slow path by construction.
pub(crate) fn write_worker(
    shared: Arc<SchedulerShared>,
    filename: String,
    in_rings: Rings,
    in_index: Vec<i32>,
    ch: WorkerChannels,
) {
    let mut writer: File = match File::create(&filename) {
        Ok(file) => file,
        Err(e) => fatal("write_worker()", &e.to_string()),
    };
    if let Err(e) = pcap::write_global_header(&mut writer) {
        fatal("write_worker()", &e.cause);
    }

    let mut bufs: [MbufHandle; 1] = [0];
    loop {
        match check_control(&ch.stop_rx) {
            Control::Continue => {},
            _ => {
                let _ = ch.ack_tx.send(ACK_TERMINATED);
                return;
            },
        }
        for q in 0..in_index[0] as usize {
            let count: usize = in_rings[q].dequeue_burst(&mut bufs);
            if count == 0 {
                continue;
            }
            let packet: Packet = Packet::extract(bufs[0]);
            if let Err(e) = pcap::write_one_packet(&mut writer, &packet) {
                fatal("write_worker()", &e.cause);
            }
            release_to_stop(&shared, &bufs);
        }
    }
}
