//! DualQ Coupled AQM (DualPI2) cell.
//!
//! The queue discipline itself lives in [`queue`]; this module wires it into
//! the cell contract: a synchronous ingress, an asynchronous egress, a
//! validated control interface, the periodic PI² update task and the typed
//! handle through which a link layer announces pending batch dequeues.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::cells::{Cell, ControlInterface, Egress, Ingress, Packet};
use crate::error::Error;

pub mod queue;
pub mod trace;

use queue::{DualPi2Queue, DualPi2QueueConfig};
use trace::{DualPi2Stats, DualPi2Tracer};

struct DualPi2Shared<P>
where
    P: Packet,
{
    queue: Mutex<DualPi2Queue<P>>,
    arrived: Notify,
    transmit_stalled: AtomicBool,
}

pub struct DualPi2CellIngress<P>
where
    P: Packet,
{
    shared: Arc<DualPi2Shared<P>>,
}

impl<P> Clone for DualPi2CellIngress<P>
where
    P: Packet,
{
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<P> Ingress<P> for DualPi2CellIngress<P>
where
    P: Packet + Send,
{
    fn enqueue(&self, packet: P) -> Result<(), Error> {
        // A forced drop is admission control, not an error to the producer.
        let admitted = self.shared.queue.lock().enqueue(packet);
        if admitted {
            self.shared.arrived.notify_one();
        }
        Ok(())
    }
}

pub struct DualPi2CellEgress<P>
where
    P: Packet,
{
    shared: Arc<DualPi2Shared<P>>,
    update_task: JoinHandle<()>,
}

#[async_trait]
impl<P> Egress<P> for DualPi2CellEgress<P>
where
    P: Packet + Send + Sync,
{
    async fn dequeue(&mut self) -> Option<P> {
        loop {
            let arrived = self.shared.arrived.notified();
            if let Some(packet) = self.shared.queue.lock().dequeue(Instant::now()) {
                return Some(packet);
            }
            arrived.await;
        }
    }
}

impl<P> Drop for DualPi2CellEgress<P>
where
    P: Packet,
{
    // The controller timer holds a reference to the queue and must not
    // outlive the cell.
    fn drop(&mut self) {
        self.update_task.abort();
    }
}

/// Typed interface for the link-layer consumer: the stall gate, the
/// pending-dequeue signal and read-only observation of the AQM state.
pub struct DualPi2LinkHandle<P>
where
    P: Packet,
{
    shared: Arc<DualPi2Shared<P>>,
}

impl<P> Clone for DualPi2LinkHandle<P>
where
    P: Packet,
{
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<P> DualPi2LinkHandle<P>
where
    P: Packet,
{
    /// Mirror of the consumer's transmit-queue state. Reconciliation only
    /// runs while the transmit queue is stalled.
    pub fn set_transmit_stalled(&self, stalled: bool) {
        self.shared.transmit_stalled.store(stalled, Ordering::Release);
    }

    /// The consumer announces it is about to drain up to `new_bytes`
    /// (framing included) in one batch.
    pub fn pending_dequeue(&self, old_bytes: usize, new_bytes: usize) {
        if !self.shared.transmit_stalled.load(Ordering::Acquire) {
            debug!(
                old_bytes,
                new_bytes, "Ignore pending dequeue while the transmit queue is live"
            );
            return;
        }
        debug!(old_bytes, new_bytes, "Pending dequeue reconciliation");
        self.shared
            .queue
            .lock()
            .pending_dequeue(new_bytes, Instant::now());
        self.shared.arrived.notify_one();
    }

    pub fn stats(&self) -> DualPi2Stats {
        self.shared.queue.lock().stats().clone()
    }

    /// Current (prob_c, prob_cl, prob_l).
    pub fn probabilities(&self) -> (f64, f64, f64) {
        self.shared.queue.lock().probabilities()
    }

    pub fn byte_length(&self) -> usize {
        self.shared.queue.lock().byte_length()
    }
}

pub struct DualPi2CellControlInterface<P>
where
    P: Packet,
{
    shared: Arc<DualPi2Shared<P>>,
}

impl<P> ControlInterface for DualPi2CellControlInterface<P>
where
    P: Packet + Send + Sync,
{
    type Config = DualPi2QueueConfig;

    fn set_config(&self, config: Self::Config) -> Result<(), Error> {
        config.validate()?;
        info!("Setting DualPi2 config to: {:?}", config);
        self.shared.queue.lock().configure(config);
        Ok(())
    }
}

pub struct DualPi2Cell<P: Packet> {
    shared: Arc<DualPi2Shared<P>>,
    ingress: Arc<DualPi2CellIngress<P>>,
    egress: DualPi2CellEgress<P>,
    control_interface: Arc<DualPi2CellControlInterface<P>>,
}

impl<P> Cell<P> for DualPi2Cell<P>
where
    P: Packet + Send + Sync + 'static,
{
    type IngressType = DualPi2CellIngress<P>;
    type EgressType = DualPi2CellEgress<P>;
    type ControlInterfaceType = DualPi2CellControlInterface<P>;

    fn sender(&self) -> Arc<Self::IngressType> {
        self.ingress.clone()
    }

    fn receiver(&mut self) -> &mut Self::EgressType {
        &mut self.egress
    }

    fn into_receiver(self) -> Self::EgressType {
        self.egress
    }

    fn control_interface(&self) -> Arc<Self::ControlInterfaceType> {
        Arc::clone(&self.control_interface)
    }
}

// Self-rescheduling probability tick: sleep one tupdate (re-read each lap so
// reconfiguration takes effect), then integrate. Aborted by the egress Drop.
async fn probability_update_loop<P>(shared: Arc<DualPi2Shared<P>>)
where
    P: Packet,
{
    loop {
        let tupdate = shared.queue.lock().tupdate();
        tokio::time::sleep(tupdate).await;
        shared.queue.lock().update_probabilities(Instant::now());
    }
}

impl<P> DualPi2Cell<P>
where
    P: Packet + Send + Sync,
{
    /// Builds the cell and spawns the PI² update task; must run inside a
    /// tokio runtime. Configuration invariant violations abort construction.
    pub fn new<T: Into<Option<Box<dyn DualPi2Tracer>>>>(
        config: DualPi2QueueConfig,
        tracer: T,
    ) -> Result<DualPi2Cell<P>, Error> {
        config.validate()?;
        debug!(?config, "New DualPi2Cell");
        let mut queue = DualPi2Queue::new(config);
        if let Some(tracer) = tracer.into() {
            queue.set_tracer(tracer);
        }
        let shared = Arc::new(DualPi2Shared {
            queue: Mutex::new(queue),
            arrived: Notify::new(),
            transmit_stalled: AtomicBool::new(false),
        });
        let update_task = tokio::spawn(probability_update_loop(Arc::clone(&shared)));
        Ok(DualPi2Cell {
            ingress: Arc::new(DualPi2CellIngress {
                shared: Arc::clone(&shared),
            }),
            egress: DualPi2CellEgress {
                shared: Arc::clone(&shared),
                update_task,
            },
            control_interface: Arc::new(DualPi2CellControlInterface {
                shared: Arc::clone(&shared),
            }),
            shared,
        })
    }

    pub fn link_handle(&self) -> DualPi2LinkHandle<P> {
        DualPi2LinkHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cells::{EcnCodepoint, StdPacket};
    use etherparse::PacketBuilder;
    use tokio::time::Duration;
    use tracing::{info, span, Level};

    fn build_packet(payload_len: usize, ecn: EcnCodepoint) -> StdPacket {
        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .udp(4000, 4001);
        let payload = vec![0u8; payload_len];
        let mut buf = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut buf, &payload).unwrap();
        let mut packet = StdPacket::from_raw_buffer(&buf);
        packet.set_ecn(ecn);
        packet
    }

    #[test_log::test]
    fn update_task_drives_probabilities() -> Result<(), Error> {
        let _span = span!(Level::INFO, "update_task_drives_probabilities").entered();
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()?;
        let _guard = rt.enter();

        let config = DualPi2QueueConfig {
            alpha: 10.0,
            beta: 100.0,
            tupdate: Duration::from_millis(16),
            ..Default::default()
        };
        let cell = DualPi2Cell::<StdPacket>::new(config, None)?;
        let ingress = cell.sender();
        let handle = cell.link_handle();
        let mut egress = cell.into_receiver();

        ingress.enqueue(build_packet(1000, EcnCodepoint::NotEct))?;
        // Park a classic packet and let the controller integrate its
        // growing sojourn over a few periods.
        rt.block_on(async {
            for _ in 0..20 {
                tokio::time::advance(Duration::from_millis(16)).await;
            }
        });
        let (prob_c, prob_cl, _prob_l) = handle.probabilities();
        info!(prob_c, prob_cl, "Probabilities after 20 update periods");
        assert!(prob_c > 0.0);
        assert!(prob_cl > 0.0);

        let received = rt.block_on(async { egress.dequeue().await });
        assert!(received.is_some());
        Ok(())
    }

    #[test_log::test]
    fn pending_dequeue_is_gated_on_transmit_stall() -> Result<(), Error> {
        let _span = span!(Level::INFO, "pending_dequeue_is_gated").entered();
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let _guard = rt.enter();

        let config = DualPi2QueueConfig::default();
        let frame_overhead = config.frame_overhead;
        let cell = DualPi2Cell::<StdPacket>::new(config, None)?;
        let ingress = cell.sender();
        let handle = cell.link_handle();
        let _egress = cell.into_receiver();

        for _ in 0..6 {
            ingress.enqueue(build_packet(1000, EcnCodepoint::Ect1))?;
        }
        let framed = 1028 + frame_overhead;

        // A live transmit queue needs no reconciliation
        handle.pending_dequeue(0, 3 * framed);
        assert_eq!(handle.stats().l4s_marks, 0);

        // Stalled: three packets are staged and the three left behind force
        // three backfilled marks into the batch.
        handle.set_transmit_stalled(true);
        handle.pending_dequeue(0, 3 * framed);
        assert_eq!(handle.stats().l4s_marks, 3);
        Ok(())
    }

    #[test_log::test]
    fn config_updates_are_validated() -> Result<(), Error> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let _guard = rt.enter();

        assert!(DualPi2Cell::<StdPacket>::new(
            DualPi2QueueConfig {
                mtu: 10,
                ..Default::default()
            },
            None,
        )
        .is_err());

        let cell = DualPi2Cell::<StdPacket>::new(DualPi2QueueConfig::default(), None)?;
        let control = cell.control_interface();
        assert!(control
            .set_config(DualPi2QueueConfig {
                scheduling_weight: 0.0,
                ..Default::default()
            })
            .is_err());
        control.set_config(DualPi2QueueConfig {
            tupdate: Duration::from_millis(30),
            ..Default::default()
        })?;
        Ok(())
    }
}
