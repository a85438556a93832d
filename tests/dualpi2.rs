use std::sync::{Arc, Mutex};

use dualpi2::cells::dualpi2::queue::{DualPi2Queue, DualPi2QueueConfig};
use dualpi2::cells::dualpi2::trace::DualPi2Tracer;
use dualpi2::cells::dualpi2::DualPi2Cell;
use dualpi2::cells::{Cell, EcnCodepoint, Egress, Ingress, Packet, StdPacket};
use dualpi2::error::Error;
use etherparse::PacketBuilder;
use tokio::time::{Duration, Instant};
use tracing::{info, span, Level};

fn build_packet(payload_len: usize, ecn: EcnCodepoint, timestamp: Instant) -> StdPacket {
    let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
        .ipv4([192, 168, 0, 1], [192, 168, 0, 2], 64)
        .udp(5000, 5001);
    let payload = vec![0u8; payload_len];
    let mut buf = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut buf, &payload).unwrap();
    let mut packet = StdPacket::from_raw_buffer(&buf);
    packet.set_ecn(ecn);
    packet.set_timestamp(timestamp);
    packet
}

fn scenario_config() -> DualPi2QueueConfig {
    DualPi2QueueConfig {
        queue_limit: 1 << 22,
        alpha: 10.0,
        beta: 100.0,
        tupdate: Duration::from_millis(16),
        target: Duration::from_millis(150),
        coupling_factor: 2.0,
        ..Default::default()
    }
}

/// Drives the queue on a fabricated millisecond timeline: 400 packets
/// enqueued at 1ms spacing, serviced at half that rate so queueing delay
/// builds, probability updates every 16ms.
fn run_scenario(ecn: EcnCodepoint) -> (DualPi2Queue<StdPacket>, u32) {
    let base = Instant::now();
    let mut queue: DualPi2Queue<StdPacket> = DualPi2Queue::new(scenario_config());
    let mut received = 0u32;
    for ms in 0..2000u64 {
        let now = base + Duration::from_millis(ms);
        if ms < 400 {
            // 972B payload + 28B of IPv4/UDP headers: 1000-byte packets
            assert!(queue.enqueue(build_packet(972, ecn, now)));
        }
        if ms % 2 == 0 && queue.dequeue(now).is_some() {
            received += 1;
        }
        if ms % 16 == 0 {
            queue.update_probabilities(now);
        }
    }
    let end = base + Duration::from_secs(2);
    while queue.dequeue(end).is_some() {
        received += 1;
    }
    (queue, received)
}

#[test_log::test]
fn l4s_only_traffic_sees_marks_and_no_drops() {
    let _span = span!(Level::INFO, "l4s_only_scenario").entered();
    let (queue, received) = run_scenario(EcnCodepoint::Ect1);
    let stats = queue.stats();
    info!(?stats, received, "L4S-only scenario finished");

    // L4S traffic is never dropped by the marking engine
    assert_eq!(received, 400);
    assert_eq!(stats.forced_drops, 0);
    assert_eq!(stats.unforced_classic_drops, 0);
    assert_eq!(stats.classic_marks, 0);
    // Rising queueing delay crosses the step threshold
    assert!(stats.l4s_marks > 0);
}

#[test_log::test]
fn classic_ecn_traffic_is_marked_never_dropped() {
    let _span = span!(Level::INFO, "classic_ecn_scenario").entered();
    let (queue, received) = run_scenario(EcnCodepoint::Ect0);
    let stats = queue.stats();
    info!(?stats, received, "Classic ECT(0) scenario finished");

    assert_eq!(received, 400);
    assert_eq!(stats.forced_drops, 0);
    // ECN-capable classic packets take the CE mark instead of the drop
    assert_eq!(stats.unforced_classic_drops, 0);
    assert!(stats.classic_marks > 0);
    assert_eq!(stats.l4s_marks, 0);
}

#[derive(Debug, Default, Clone)]
struct RecordedSignals {
    bytes_in_queue: Vec<usize>,
    probabilities: Vec<(f64, f64, f64)>,
    classic_sojourns: Vec<Duration>,
    l4s_sojourns: Vec<Duration>,
}

#[derive(Debug, Clone)]
struct RecordingTracer {
    signals: Arc<Mutex<RecordedSignals>>,
}

impl DualPi2Tracer for RecordingTracer {
    fn bytes_in_queue(&mut self, bytes: usize) {
        self.signals.lock().unwrap().bytes_in_queue.push(bytes);
    }

    fn probabilities(&mut self, prob_c: f64, prob_cl: f64, prob_l: f64) {
        self.signals
            .lock()
            .unwrap()
            .probabilities
            .push((prob_c, prob_cl, prob_l));
    }

    fn classic_sojourn(&mut self, sojourn: Duration) {
        self.signals.lock().unwrap().classic_sojourns.push(sojourn);
    }

    fn l4s_sojourn(&mut self, sojourn: Duration) {
        self.signals.lock().unwrap().l4s_sojourns.push(sojourn);
    }
}

#[test_log::test]
fn cell_pushes_signals_to_injected_tracer() -> Result<(), Error> {
    let _span = span!(Level::INFO, "cell_tracer").entered();
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()?;
    let _guard = rt.enter();

    let signals = Arc::new(Mutex::new(RecordedSignals::default()));
    let tracer = RecordingTracer {
        signals: Arc::clone(&signals),
    };
    let cell = DualPi2Cell::<StdPacket>::new(
        DualPi2QueueConfig::default(),
        Box::new(tracer) as Box<dyn DualPi2Tracer>,
    )?;
    let ingress = cell.sender();
    let handle = cell.link_handle();
    let mut egress = cell.into_receiver();

    for _ in 0..10 {
        ingress.enqueue(build_packet(972, EcnCodepoint::Ect1, Instant::now()))?;
    }
    // Let the PI² task tick a few times while the packets age
    rt.block_on(async {
        for _ in 0..4 {
            tokio::time::advance(Duration::from_millis(15)).await;
        }
    });
    for _ in 0..10 {
        let received = rt.block_on(async { egress.dequeue().await });
        assert!(received.is_some());
    }

    let recorded = signals.lock().unwrap().clone();
    info!(
        probability_updates = recorded.probabilities.len(),
        l4s_dequeues = recorded.l4s_sojourns.len(),
        "Recorded trace signals"
    );
    assert!(!recorded.probabilities.is_empty());
    assert_eq!(recorded.l4s_sojourns.len(), 10);
    assert!(recorded.classic_sojourns.is_empty());
    // Enqueues and dequeues both push the live byte depth
    assert!(recorded.bytes_in_queue.len() >= 20);
    assert_eq!(*recorded.bytes_in_queue.last().unwrap(), 0);
    // 60ms of aging is far beyond the 1ms step threshold
    assert!(handle.stats().l4s_marks > 0);
    assert!(recorded.l4s_sojourns.iter().all(|sojourn| *sojourn >= Duration::from_millis(60)));
    Ok(())
}
