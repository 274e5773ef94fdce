// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! End-to-end graph scenarios driven through the memory-backed driver.

use ::anyhow::Result;
use ::catflow::{
    ensure_eq,
    packet::pcap,
    runtime::memory::{
        MbufHandle,
        Mempool,
    },
    Config,
    Controller,
    Flow,
    FlowSystem,
    MemoryDriver,
    Packet,
};
use ::std::{
    fs::File,
    io::BufReader,
    path::PathBuf,
    sync::{
        atomic::{
            AtomicU32,
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
// Helpers
//======================================================================================================================

/// A config tuned for tests: short tick, no adaptive cloning, so scenarios are deterministic.
fn test_config() -> Config {
    Config {
        sched_time_ms: 50,
        debug_time_ms: 10_000,
        disable_scheduler: true,
        ..Config::default()
    }
}

/// A config with the scheduler enabled, for pacing and timer scenarios.
fn scheduled_config() -> Config {
    Config {
        sched_time_ms: 50,
        debug_time_ms: 10_000,
        ..Config::default()
    }
}

fn start(system: FlowSystem) -> (Controller, thread::JoinHandle<Result<(), ::catflow::Fail>>) {
    let controller: Controller = system.controller();
    let mut system: FlowSystem = system;
    let handle = thread::spawn(move || system.start());
    (controller, handle)
}

fn stop(controller: Controller, handle: thread::JoinHandle<Result<(), ::catflow::Fail>>) -> Result<()> {
    controller.stop();
    match handle.join() {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => anyhow::bail!("system stop failed: {}", e),
        Err(_) => anyhow::bail!("system thread panicked"),
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline: Instant = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Feeds payloads into one receive lane, retrying while the queue or the injection pool is momentarily full.
fn inject_all(driver: &MemoryDriver, port: u16, lane: usize, payloads: &[Vec<u8>]) {
    for payload in payloads {
        loop {
            match driver.inject(port, lane, payload) {
                Ok(()) => break,
                Err(_) => thread::sleep(Duration::from_micros(50)),
            }
        }
    }
}

fn counter_payloads(count: u32) -> Vec<Vec<u8>> {
    (0..count).map(|i: u32| i.to_le_bytes().to_vec()).collect()
}

fn payload_counter(payload: &[u8]) -> u32 {
    u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]])
}

fn temp_path(name: &str) -> PathBuf {
    let mut path: PathBuf = ::std::env::temp_dir();
    path.push(format!("catflow-{}-{}", ::std::process::id(), name));
    path
}

/// Writes a pcap file holding the given payloads.
fn make_pcap(path: &PathBuf, payloads: &[Vec<u8>]) -> Result<()> {
    let pool: Arc<Mempool> = Mempool::new("pcap fixture", 0, 4)?;
    let mut file: File = File::create(path)?;
    pcap::write_global_header(&mut file)?;
    for payload in payloads {
        let handle: MbufHandle = pool.alloc_one()?;
        let mut packet: Packet = Packet::extract(handle);
        packet.generate_from_bytes(payload)?;
        pcap::write_one_packet(&mut file, &packet)?;
        pool.free_bulk(&[handle]);
    }
    Ok(())
}

/// Reads every payload of a pcap file.
fn read_pcap(path: &PathBuf) -> Result<Vec<Vec<u8>>> {
    let pool: Arc<Mempool> = Mempool::new("pcap fixture", 0, 4)?;
    let mut reader: BufReader<File> = BufReader::new(File::open(path)?);
    pcap::read_global_header(&mut reader)?;
    let handle: MbufHandle = pool.alloc_one()?;
    let mut packet: Packet = Packet::extract(handle);
    let mut payloads: Vec<Vec<u8>> = Vec::new();
    while !pcap::read_one_packet(&mut reader, &mut packet)? {
        payloads.push(packet.data().to_vec());
    }
    pool.free_bulk(&[handle]);
    Ok(payloads)
}

//======================================================================================================================
// Scenarios
//======================================================================================================================

/// Reading a pcap file once and writing it back preserves every payload in order.
#[test]
fn pcap_file_roundtrip() -> Result<()> {
    let input: PathBuf = temp_path("roundtrip-in.pcap");
    let output: PathBuf = temp_path("roundtrip-out.pcap");
    let payloads: Vec<Vec<u8>> = counter_payloads(100);
    make_pcap(&input, &payloads)?;

    let driver: Arc<MemoryDriver> = MemoryDriver::new(1, 1)?;
    let mut system: FlowSystem = FlowSystem::init(&test_config(), driver.clone())?;
    let flow: Flow = system.set_receiver_file(input.to_str().unwrap(), 1)?;
    system.set_sender_file(&flow, output.to_str().unwrap())?;

    let (controller, handle) = start(system);
    let expected_len: u64 = 24 + payloads.iter().map(|p: &Vec<u8>| 16 + p.len() as u64).sum::<u64>();
    let grown: bool = wait_until(Duration::from_secs(10), || {
        ::std::fs::metadata(&output).map(|m| m.len() >= expected_len).unwrap_or(false)
    });
    stop(controller, handle)?;
    ensure_eq!(grown, true);

    ensure_eq!(read_pcap(&output)?, payloads);
    let _ = ::std::fs::remove_file(&input);
    let _ = ::std::fs::remove_file(&output);
    Ok(())
}

/// A generator feeding a separator that drops even counters leaves exactly the odd counters, in order.
#[test]
fn generator_separator_drops_evens() -> Result<()> {
    let driver: Arc<MemoryDriver> = MemoryDriver::new(1, 1)?;
    let mut system: FlowSystem = FlowSystem::init(&test_config(), driver.clone())?;

    let counter: Arc<AtomicU32> = Arc::new(AtomicU32::new(0));
    let flow: Flow = system.set_generator(
        Arc::new(move |packet: &mut Packet, _ctx| {
            let value: u32 = counter.fetch_add(1, Ordering::Relaxed);
            packet.generate_from_bytes(&value.to_le_bytes()).expect("payload fits");
        }),
        None,
    )?;
    let evens: Flow = system.set_separator(&flow, Arc::new(|packet: &Packet, _ctx| payload_counter(packet.data()) % 2 == 1), None)?;
    system.set_stopper(&evens)?;
    system.set_sender(&flow, 0)?;

    let (controller, handle) = start(system);
    let enough: bool = wait_until(Duration::from_secs(10), || driver.transmitted_count(0) >= 100);
    stop(controller, handle)?;
    ensure_eq!(enough, true);

    let transmitted: Vec<Vec<u8>> = driver.transmitted(0);
    for (i, payload) in transmitted.iter().take(100).enumerate() {
        ensure_eq!(payload_counter(payload), 2 * i as u32 + 1);
    }
    Ok(())
}

/// Reading a ten-packet file with three repetitions yields the file three times over, in order.
#[test]
fn file_reader_repeats() -> Result<()> {
    let input: PathBuf = temp_path("repeat-in.pcap");
    let payloads: Vec<Vec<u8>> = counter_payloads(10);
    make_pcap(&input, &payloads)?;

    let driver: Arc<MemoryDriver> = MemoryDriver::new(1, 1)?;
    let mut system: FlowSystem = FlowSystem::init(&test_config(), driver.clone())?;
    let flow: Flow = system.set_receiver_file(input.to_str().unwrap(), 3)?;
    system.set_sender(&flow, 0)?;

    let (controller, handle) = start(system);
    let enough: bool = wait_until(Duration::from_secs(10), || driver.transmitted_count(0) >= 30);
    stop(controller, handle)?;
    ensure_eq!(enough, true);

    let transmitted: Vec<Vec<u8>> = driver.transmitted(0);
    ensure_eq!(transmitted.len(), 30);
    for (i, payload) in transmitted.iter().enumerate() {
        ensure_eq!(payload_counter(payload), (i % 10) as u32);
    }
    let _ = ::std::fs::remove_file(&input);
    Ok(())
}

/// A 3:7 partitioner over ten thousand packets puts exactly three tenths on the first branch with the interleaving
/// pattern intact.
#[test]
fn partitioner_splits_three_to_seven() -> Result<()> {
    const TOTAL: u32 = 10_000;
    let driver: Arc<MemoryDriver> = MemoryDriver::new(2, 1)?;
    let mut system: FlowSystem = FlowSystem::init(&test_config(), driver.clone())?;

    let flow: Flow = system.set_receiver(0)?;
    let second: Flow = system.set_partitioner(&flow, 3, 7)?;
    system.set_sender(&flow, 0)?;
    system.set_sender(&second, 1)?;

    let (controller, handle) = start(system);
    let payloads: Vec<Vec<u8>> = counter_payloads(TOTAL);
    inject_all(&driver, 0, 0, &payloads);
    let enough: bool = wait_until(Duration::from_secs(20), || {
        driver.transmitted_count(0) + driver.transmitted_count(1) >= TOTAL as usize
    });
    stop(controller, handle)?;
    ensure_eq!(enough, true);

    let first: Vec<Vec<u8>> = driver.transmitted(0);
    let second: Vec<Vec<u8>> = driver.transmitted(1);
    ensure_eq!(first.len(), 3_000);
    ensure_eq!(second.len(), 7_000);
    for (i, payload) in first.iter().enumerate() {
        let counter: u32 = payload_counter(payload);
        ensure_eq!(counter % 10, (i % 3) as u32);
        ensure_eq!(counter / 10, (i / 3) as u32);
    }
    for (i, payload) in second.iter().enumerate() {
        let counter: u32 = payload_counter(payload);
        ensure_eq!(counter % 10, (i % 7) as u32 + 3);
        ensure_eq!(counter / 10, (i / 7) as u32);
    }
    Ok(())
}

/// A copier delivers every packet to both sinks with identical payloads.
#[test]
fn copier_duplicates_every_packet() -> Result<()> {
    const TOTAL: u32 = 500;
    let driver: Arc<MemoryDriver> = MemoryDriver::new(2, 1)?;
    let mut system: FlowSystem = FlowSystem::init(&test_config(), driver.clone())?;

    let flow: Flow = system.set_receiver(0)?;
    let copy: Flow = system.set_copier(&flow)?;
    system.set_sender(&flow, 0)?;
    system.set_sender(&copy, 1)?;

    let (controller, handle) = start(system);
    let payloads: Vec<Vec<u8>> = counter_payloads(TOTAL);
    inject_all(&driver, 0, 0, &payloads);
    let enough: bool = wait_until(Duration::from_secs(10), || {
        driver.transmitted_count(0) >= TOTAL as usize && driver.transmitted_count(1) >= TOTAL as usize
    });
    stop(controller, handle)?;
    ensure_eq!(enough, true);

    ensure_eq!(driver.transmitted(0), payloads);
    ensure_eq!(driver.transmitted(1), payloads);
    Ok(())
}

/// A merger forwards every packet of every input; identities are preserved.
#[test]
fn merger_preserves_identities() -> Result<()> {
    let driver: Arc<MemoryDriver> = MemoryDriver::new(2, 1)?;
    let mut system: FlowSystem = FlowSystem::init(&test_config(), driver.clone())?;

    let a: Flow = system.set_receiver(0)?;
    let b: Flow = system.set_receiver(1)?;
    let merged: Flow = system.set_merger(&[&a, &b])?;
    system.set_sender(&merged, 0)?;

    let (controller, handle) = start(system);
    let from_a: Vec<Vec<u8>> = (0..100u32).map(|i: u32| (i).to_le_bytes().to_vec()).collect();
    let from_b: Vec<Vec<u8>> = (1000..1100u32).map(|i: u32| (i).to_le_bytes().to_vec()).collect();
    inject_all(&driver, 0, 0, &from_a);
    inject_all(&driver, 1, 0, &from_b);
    let enough: bool = wait_until(Duration::from_secs(10), || driver.transmitted_count(0) >= 200);
    stop(controller, handle)?;
    ensure_eq!(enough, true);

    let mut counters: Vec<u32> = driver.transmitted(0).iter().map(|p: &Vec<u8>| payload_counter(p)).collect();
    counters.sort_unstable();
    let mut expected: Vec<u32> = (0..100).chain(1000..1100).collect();
    expected.sort_unstable();
    ensure_eq!(counters, expected);
    Ok(())
}

/// Dropped packets and delivered packets add up to what the sources produced.
#[test]
fn packets_are_conserved() -> Result<()> {
    const TOTAL: u32 = 1_000;
    let driver: Arc<MemoryDriver> = MemoryDriver::new(1, 1)?;
    let mut system: FlowSystem = FlowSystem::init(&test_config(), driver.clone())?;

    let flow: Flow = system.set_receiver(0)?;
    // Counters divisible by four leave the graph through the stop ring.
    let dropped: Flow = system.set_separator(
        &flow,
        Arc::new(|packet: &Packet, _ctx| payload_counter(packet.data()) % 4 != 0),
        None,
    )?;
    system.set_stopper(&dropped)?;
    system.set_sender(&flow, 0)?;

    let (controller, handle) = start(system);
    let payloads: Vec<Vec<u8>> = counter_payloads(TOTAL);
    inject_all(&driver, 0, 0, &payloads);
    let conserved: bool = wait_until(Duration::from_secs(10), || {
        driver.transmitted_count(0) as u64 + driver.direct_freed() >= TOTAL as u64
    });
    stop(controller, handle)?;
    ensure_eq!(conserved, true);
    ensure_eq!(driver.transmitted_count(0), 750);
    Ok(())
}

/// Scalar and vector renditions of the same handler plus separator produce identical sink output.
#[test]
fn scalar_and_vector_graphs_agree() -> Result<()> {
    const TOTAL: u32 = 600;

    fn run_variant(vector: bool) -> Result<Vec<Vec<u8>>> {
        let driver: Arc<MemoryDriver> = MemoryDriver::new(1, 1)?;
        let mut system: FlowSystem = FlowSystem::init(&test_config(), driver.clone())?;
        let flow: Flow = system.set_receiver(0)?;

        if vector {
            system.set_vector_handler(
                &flow,
                Arc::new(|packets: &mut [Packet], mask: &::catflow::Mask, _ctx| {
                    for i in 0..::catflow::BURST_SIZE {
                        if mask[i] {
                            let value: u32 = payload_counter(packets[i].data()).wrapping_mul(3);
                            packets[i].generate_from_bytes(&value.to_le_bytes()).expect("payload fits");
                        }
                    }
                }),
                None,
            )?;
            let diverted: Flow = system.set_vector_separator(
                &flow,
                Arc::new(
                    |packets: &[Packet], mask: &::catflow::Mask, kept: &mut ::catflow::Mask, _ctx| {
                        for i in 0..::catflow::BURST_SIZE {
                            if mask[i] {
                                kept[i] = payload_counter(packets[i].data()) % 2 == 0;
                            }
                        }
                    },
                ),
                None,
            )?;
            system.set_stopper(&diverted)?;
        } else {
            system.set_handler(
                &flow,
                Arc::new(|packet: &mut Packet, _ctx| {
                    let value: u32 = payload_counter(packet.data()).wrapping_mul(3);
                    packet.generate_from_bytes(&value.to_le_bytes()).expect("payload fits");
                }),
                None,
            )?;
            let diverted: Flow = system.set_separator(
                &flow,
                Arc::new(|packet: &Packet, _ctx| payload_counter(packet.data()) % 2 == 0),
                None,
            )?;
            system.set_stopper(&diverted)?;
        }
        system.set_sender(&flow, 0)?;

        let (controller, handle) = start(system);
        let payloads: Vec<Vec<u8>> = counter_payloads(TOTAL);
        inject_all(&driver, 0, 0, &payloads);
        // Half the counters survive: those whose tripled value is even.
        let enough: bool = wait_until(Duration::from_secs(10), || driver.transmitted_count(0) >= TOTAL as usize / 2);
        stop(controller, handle)?;
        anyhow::ensure!(enough, "sink did not fill up in time");
        Ok(driver.transmitted(0))
    }

    let scalar: Vec<Vec<u8>> = run_variant(false)?;
    let vector: Vec<Vec<u8>> = run_variant(true)?;
    ensure_eq!(scalar, vector);
    Ok(())
}

/// Mixing scalar and vector nodes in one chain splits them into bridged segments and both still apply.
#[test]
fn mixed_dispatch_chain_applies_both_stages() -> Result<()> {
    const TOTAL: u32 = 200;
    let driver: Arc<MemoryDriver> = MemoryDriver::new(1, 1)?;
    let mut system: FlowSystem = FlowSystem::init(&test_config(), driver.clone())?;

    let flow: Flow = system.set_receiver(0)?;
    system.set_handler(
        &flow,
        Arc::new(|packet: &mut Packet, _ctx| {
            let value: u32 = payload_counter(packet.data()) + 1;
            packet.generate_from_bytes(&value.to_le_bytes()).expect("payload fits");
        }),
        None,
    )?;
    system.set_vector_handler(
        &flow,
        Arc::new(|packets: &mut [Packet], mask: &::catflow::Mask, _ctx| {
            for i in 0..::catflow::BURST_SIZE {
                if mask[i] {
                    let value: u32 = payload_counter(packets[i].data()) * 10;
                    packets[i].generate_from_bytes(&value.to_le_bytes()).expect("payload fits");
                }
            }
        }),
        None,
    )?;
    system.set_sender(&flow, 0)?;

    let (controller, handle) = start(system);
    let payloads: Vec<Vec<u8>> = counter_payloads(TOTAL);
    inject_all(&driver, 0, 0, &payloads);
    let enough: bool = wait_until(Duration::from_secs(10), || driver.transmitted_count(0) >= TOTAL as usize);
    stop(controller, handle)?;
    ensure_eq!(enough, true);

    let transmitted: Vec<Vec<u8>> = driver.transmitted(0);
    for (i, payload) in transmitted.iter().enumerate() {
        ensure_eq!(payload_counter(payload), (i as u32 + 1) * 10);
    }
    Ok(())
}

/// The clonable generator produces whole bursts and responds to the scheduler's pacing without stalling. Its output
/// is routed straight to the stop ring, so production is observed through the generate callable itself.
#[test]
fn fast_generator_produces_under_scheduler() -> Result<()> {
    let driver: Arc<MemoryDriver> = MemoryDriver::new(1, 1)?;
    let mut system: FlowSystem = FlowSystem::init(&scheduled_config(), driver.clone())?;

    let counter: Arc<AtomicU32> = Arc::new(AtomicU32::new(0));
    let produced: Arc<AtomicU32> = counter.clone();
    let flow: Flow = system.set_fast_generator(
        Arc::new(move |packet: &mut Packet, _ctx| {
            let value: u32 = counter.fetch_add(1, Ordering::Relaxed);
            packet.generate_from_bytes(&value.to_le_bytes()).expect("payload fits");
        }),
        10_000,
        None,
    )?;
    system.set_stopper(&flow)?;

    let (controller, handle) = start(system);
    let enough: bool = wait_until(Duration::from_secs(10), || produced.load(Ordering::Relaxed) >= 10_000);
    stop(controller, handle)?;
    ensure_eq!(enough, true);
    Ok(())
}

/// Kernel-bridge devices can feed a graph and act as a sink.
#[test]
fn kernel_bridge_taps_both_directions() -> Result<()> {
    let driver: Arc<MemoryDriver> = MemoryDriver::new(2, 1)?;
    let mut system: FlowSystem = FlowSystem::init(&test_config(), driver.clone())?;

    let kni: ::catflow::Kni = system.create_kni_device(0, "vEth0")?;
    let from_kernel: Flow = system.set_receiver_kni(&kni)?;
    system.set_sender(&from_kernel, 1)?;
    let from_wire: Flow = system.set_receiver(1)?;
    system.set_sender_kni(&from_wire, &kni)?;

    let (controller, handle) = start(system);
    driver.inject_kni(0, &[0xaa])?;
    inject_all(&driver, 1, 0, &[vec![0xbb]]);
    let both: bool = wait_until(Duration::from_secs(10), || {
        driver.transmitted_count(1) >= 1 && !driver.kni_transmitted(0).is_empty()
    });
    stop(controller, handle)?;
    ensure_eq!(both, true);
    ensure_eq!(driver.transmitted(1), vec![vec![0xaa]]);
    ensure_eq!(driver.kni_transmitted(0), vec![vec![0xbb]]);
    Ok(())
}

/// An armed timer variant fires from the scheduler tick and disarms itself; re-arming fires it again.
#[test]
fn timer_variants_fire_when_armed() -> Result<()> {
    let driver: Arc<MemoryDriver> = MemoryDriver::new(1, 1)?;
    let mut system: FlowSystem = FlowSystem::init(&scheduled_config(), driver.clone())?;

    let fired: Arc<AtomicU32> = Arc::new(AtomicU32::new(0));
    let timer: ::catflow::Timer = system.add_timer(Duration::from_millis(10), {
        let fired: Arc<AtomicU32> = fired.clone();
        Arc::new(move |_ctx| {
            fired.fetch_add(1, Ordering::Relaxed);
        })
    });
    let armed = timer.add_variant(None);

    let counter: Arc<AtomicU32> = Arc::new(AtomicU32::new(0));
    let flow: Flow = system.set_generator(
        Arc::new(move |packet: &mut Packet, _ctx| {
            let value: u32 = counter.fetch_add(1, Ordering::Relaxed);
            packet.generate_from_bytes(&value.to_le_bytes()).expect("payload fits");
        }),
        None,
    )?;
    system.set_stopper(&flow)?;

    let (controller, handle) = start(system);
    armed.store(true, Ordering::Release);
    let fired_once: bool = wait_until(Duration::from_secs(10), || fired.load(Ordering::Relaxed) == 1);
    // The flag was cleared by the firing; without re-arming the count must not move.
    thread::sleep(Duration::from_millis(150));
    let still_one: u32 = fired.load(Ordering::Relaxed);
    armed.store(true, Ordering::Release);
    let fired_twice: bool = wait_until(Duration::from_secs(10), || fired.load(Ordering::Relaxed) == 2);
    stop(controller, handle)?;

    ensure_eq!(fired_once, true);
    ensure_eq!(still_one, 1);
    ensure_eq!(fired_twice, true);
    Ok(())
}

/// A splitter with three outputs routes by the user callable's verdict.
#[test]
fn splitter_routes_by_answer() -> Result<()> {
    const TOTAL: u32 = 300;
    let driver: Arc<MemoryDriver> = MemoryDriver::new(3, 1)?;
    let mut system: FlowSystem = FlowSystem::init(&test_config(), driver.clone())?;

    let flow: Flow = system.set_receiver(0)?;
    let outputs: Vec<Flow> = system.set_splitter(
        &flow,
        Arc::new(|packet: &Packet, _ctx| (payload_counter(packet.data()) % 3) as usize),
        3,
        None,
    )?;
    for (port, output) in outputs.iter().enumerate() {
        system.set_sender(output, port as u16)?;
    }

    let (controller, handle) = start(system);
    let payloads: Vec<Vec<u8>> = counter_payloads(TOTAL);
    inject_all(&driver, 0, 0, &payloads);
    let enough: bool = wait_until(Duration::from_secs(10), || {
        (0..3).map(|p: u16| driver.transmitted_count(p)).sum::<usize>() >= TOTAL as usize
    });
    stop(controller, handle)?;
    ensure_eq!(enough, true);

    for port in 0..3u16 {
        let transmitted: Vec<Vec<u8>> = driver.transmitted(port);
        ensure_eq!(transmitted.len(), 100);
        for payload in &transmitted {
            ensure_eq!(payload_counter(payload) % 3, port as u32);
        }
    }
    Ok(())
}

/// The vector splitter routes masked bursts the same way its scalar sibling routes single packets.
#[test]
fn vector_splitter_routes_by_answers() -> Result<()> {
    const TOTAL: u32 = 300;
    let driver: Arc<MemoryDriver> = MemoryDriver::new(3, 1)?;
    let mut system: FlowSystem = FlowSystem::init(&test_config(), driver.clone())?;

    let flow: Flow = system.set_receiver(0)?;
    let outputs: Vec<Flow> = system.set_vector_splitter(
        &flow,
        Arc::new(
            |packets: &[Packet], mask: &::catflow::Mask, answers: &mut ::catflow::Answers, _ctx| {
                for i in 0..::catflow::BURST_SIZE {
                    if mask[i] {
                        answers[i] = (payload_counter(packets[i].data()) % 3) as u8;
                    }
                }
            },
        ),
        3,
        None,
    )?;
    for (port, output) in outputs.iter().enumerate() {
        system.set_sender(output, port as u16)?;
    }

    let (controller, handle) = start(system);
    let payloads: Vec<Vec<u8>> = counter_payloads(TOTAL);
    inject_all(&driver, 0, 0, &payloads);
    let enough: bool = wait_until(Duration::from_secs(10), || {
        (0..3).map(|p: u16| driver.transmitted_count(p)).sum::<usize>() >= TOTAL as usize
    });
    stop(controller, handle)?;
    ensure_eq!(enough, true);

    for port in 0..3u16 {
        let transmitted: Vec<Vec<u8>> = driver.transmitted(port);
        ensure_eq!(transmitted.len(), 100);
        for payload in &transmitted {
            ensure_eq!(payload_counter(payload) % 3, port as u32);
        }
    }
    Ok(())
}

/// The vector fast generator fills whole bursts at once.
#[test]
fn vector_fast_generator_fills_bursts() -> Result<()> {
    let driver: Arc<MemoryDriver> = MemoryDriver::new(1, 1)?;
    let mut system: FlowSystem = FlowSystem::init(&scheduled_config(), driver.clone())?;

    let counter: Arc<AtomicU32> = Arc::new(AtomicU32::new(0));
    let produced: Arc<AtomicU32> = counter.clone();
    let flow: Flow = system.set_vector_fast_generator(
        Arc::new(move |packets: &mut [Packet], _ctx| {
            for packet in packets.iter_mut() {
                let value: u32 = counter.fetch_add(1, Ordering::Relaxed);
                packet.generate_from_bytes(&value.to_le_bytes()).expect("payload fits");
            }
        }),
        10_000,
        None,
    )?;
    system.set_stopper(&flow)?;

    let (controller, handle) = start(system);
    let enough: bool = wait_until(Duration::from_secs(10), || produced.load(Ordering::Relaxed) >= 10_000);
    stop(controller, handle)?;
    ensure_eq!(enough, true);
    Ok(())
}

/// A handler-drop keeps only the packets its callable approves.
#[test]
fn handler_drop_discards_rejected_packets() -> Result<()> {
    const TOTAL: u32 = 400;
    let driver: Arc<MemoryDriver> = MemoryDriver::new(1, 1)?;
    let mut system: FlowSystem = FlowSystem::init(&test_config(), driver.clone())?;

    let flow: Flow = system.set_receiver(0)?;
    system.set_handler_drop(
        &flow,
        Arc::new(|packet: &Packet, _ctx| payload_counter(packet.data()) < 100),
        None,
    )?;
    system.set_sender(&flow, 0)?;

    let (controller, handle) = start(system);
    let payloads: Vec<Vec<u8>> = counter_payloads(TOTAL);
    inject_all(&driver, 0, 0, &payloads);
    let enough: bool = wait_until(Duration::from_secs(10), || driver.transmitted_count(0) >= 100);
    stop(controller, handle)?;
    ensure_eq!(enough, true);

    let transmitted: Vec<Vec<u8>> = driver.transmitted(0);
    ensure_eq!(transmitted.len(), 100);
    for (i, payload) in transmitted.iter().enumerate() {
        ensure_eq!(payload_counter(payload), i as u32);
    }
    Ok(())
}
