use crate::cells::{EcnCodepoint, Packet};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

use super::trace::{DualPi2Stats, DualPi2Tracer};
use crate::error::Error;

// DualQ Coupled AQM Implementation Reference:
// https://datatracker.ietf.org/doc/html/rfc9332
// https://github.com/L4STeam/linux/blob/testing/net/sched/sch_dualpi2.c

// The Classic queue keeps a small standing backlog: a dequeue never drops
// when fewer than this many MTUs remain after the pop. Ported from the Linux
// reference implementation; tunable only through `mtu`.
const CLASSIC_DROP_BACKSTOP_MTUS: usize = 2;

// RFC 791 minimum MTU every IPv4 link must support
const MIN_MTU: u32 = 68;

/// How the native per-packet L4S threshold AQM combines with the coupled
/// probability. Deployments differ: the Wi-Fi profile defers entirely to
/// coupling, others run the step threshold alone.
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum L4sMarkPolicy {
    #[default]
    Max,
    NativeOnly,
    CoupledOnly,
}

#[cfg_attr(feature = "serde", derive(Deserialize, Serialize), serde(default))]
#[derive(Debug, Clone)]
pub struct DualPi2QueueConfig {
    pub queue_limit: usize, // aggregate byte cap across both sub-queues
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub target: Duration, // classic queue delay target
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub tupdate: Duration, // probability update period
    pub alpha: f64, // integral gain of the PI² controller, Hz
    pub beta: f64,  // proportional gain of the PI² controller, Hz
    pub coupling_factor: f64, // scales the coupled L4S mark probability
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub l4s_mark_threshold: Duration, // native step AQM threshold
    pub l4s_mark_policy: L4sMarkPolicy,
    pub scheduling_weight: f64, // L4S : Classic quantum ratio, >= 1
    pub drr_quantum: usize,     // classic per-round byte allowance
    pub mtu: u32,
    pub frame_overhead: usize, // per-packet link framing seen by the consumer
}

impl Default for DualPi2QueueConfig {
    fn default() -> Self {
        Self {
            queue_limit: 1 << 20,
            target: Duration::from_millis(15),
            tupdate: Duration::from_millis(15),
            alpha: 0.16,
            beta: 3.2,
            coupling_factor: 2.0,
            l4s_mark_threshold: Duration::from_millis(1),
            l4s_mark_policy: L4sMarkPolicy::default(),
            scheduling_weight: 9.0,
            drr_quantum: 1500,
            mtu: 1500,
            frame_overhead: 38,
        }
    }
}

impl DualPi2QueueConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.mtu < MIN_MTU {
            return Err(Error::ConfigError(format!(
                "mtu {} is below the IPv4 minimum of {}",
                self.mtu, MIN_MTU
            )));
        }
        if self.queue_limit < CLASSIC_DROP_BACKSTOP_MTUS * self.mtu as usize {
            return Err(Error::ConfigError(format!(
                "queue_limit {} cannot hold the {} MTU classic backstop",
                self.queue_limit, CLASSIC_DROP_BACKSTOP_MTUS
            )));
        }
        if self.drr_quantum < self.mtu as usize {
            return Err(Error::ConfigError(format!(
                "drr_quantum {} must cover at least one MTU ({})",
                self.drr_quantum, self.mtu
            )));
        }
        if !self.scheduling_weight.is_finite() || self.scheduling_weight < 1.0 {
            return Err(Error::ConfigError(format!(
                "scheduling_weight {} must be finite and >= 1",
                self.scheduling_weight
            )));
        }
        if self.tupdate.is_zero() {
            return Err(Error::ConfigError(
                "tupdate must be non-zero".to_string(),
            ));
        }
        if !self.alpha.is_finite() || self.alpha <= 0.0 {
            return Err(Error::ConfigError(format!(
                "alpha {} must be finite and > 0",
                self.alpha
            )));
        }
        if !self.beta.is_finite() || self.beta <= 0.0 {
            return Err(Error::ConfigError(format!(
                "beta {} must be finite and > 0",
                self.beta
            )));
        }
        if !self.coupling_factor.is_finite() || self.coupling_factor < 0.0 {
            return Err(Error::ConfigError(format!(
                "coupling_factor {} must be finite and >= 0",
                self.coupling_factor
            )));
        }
        if self.frame_overhead >= self.mtu as usize {
            return Err(Error::ConfigError(format!(
                "frame_overhead {} must be smaller than the mtu",
                self.frame_overhead
            )));
        }
        Ok(())
    }

    fn classic_drop_backstop(&self) -> usize {
        CLASSIC_DROP_BACKSTOP_MTUS * self.mtu as usize
    }

    fn l4s_quantum(&self) -> usize {
        (self.drr_quantum as f64 * self.scheduling_weight).round() as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Traffic {
    Classic,
    L4s,
}

// Byte-counted FIFO; used for the two live sub-queues and the two staging
// queues alike.
#[derive(Debug)]
struct SubQueue<P> {
    queue: VecDeque<P>,
    bytes: usize,
}

impl<P> SubQueue<P>
where
    P: Packet,
{
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            bytes: 0,
        }
    }

    fn push(&mut self, packet: P) {
        self.bytes += packet.l3_length();
        self.queue.push_back(packet);
    }

    fn pop(&mut self) -> Option<P> {
        let packet = self.queue.pop_front()?;
        self.bytes -= packet.l3_length();
        Some(packet)
    }

    fn front(&self) -> Option<&P> {
        self.queue.front()
    }

    fn head_size(&self) -> Option<usize> {
        self.queue.front().map(|packet| packet.l3_length())
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut P> {
        self.queue.iter_mut()
    }

    fn len(&self) -> usize {
        self.queue.len()
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn bytes(&self) -> usize {
        self.bytes
    }
}

// Fractional-probability accumulator: applies `likelihood` at a
// deterministic long-run frequency instead of drawing per-packet randomness.
fn recur(count: &mut f64, likelihood: f64) -> bool {
    *count += likelihood;
    if *count > 1.0 {
        *count -= 1.0;
        true
    } else {
        false
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct DrrRound {
    classic: bool,
    l4s: bool,
}

pub struct DualPi2Queue<P> {
    config: DualPi2QueueConfig,

    classic: SubQueue<P>,
    l4s: SubQueue<P>,
    // Lookahead buffers between "AQM decision taken" and "handed to the
    // consumer"; drained ahead of live scheduling.
    staged_classic: SubQueue<P>,
    staged_l4s: SubQueue<P>,

    base_prob: f64, // PI² accumulator, in [0, 1]
    prev_q: Duration, // previous classic sojourn sample
    prob_c: f64,    // classic drop/mark probability, base_prob squared
    prob_cl: f64,   // coupled L4S mark probability, base_prob * k
    prob_l: f64,    // effective L4S mark probability of the last L4S dequeue

    classic_count: f64, // recurrence accumulators
    l4s_count: f64,

    classic_deficit: usize,
    l4s_deficit: usize,
    round: DrrRound,

    stats: DualPi2Stats,
    tracer: Option<Box<dyn DualPi2Tracer>>,
}

impl<P> From<DualPi2QueueConfig> for DualPi2Queue<P>
where
    P: Packet,
{
    fn from(config: DualPi2QueueConfig) -> Self {
        DualPi2Queue::new(config)
    }
}

impl<P> DualPi2Queue<P>
where
    P: Packet,
{
    pub fn new(config: DualPi2QueueConfig) -> Self {
        debug!(?config, "New DualPi2Queue");
        Self {
            config,
            classic: SubQueue::new(),
            l4s: SubQueue::new(),
            staged_classic: SubQueue::new(),
            staged_l4s: SubQueue::new(),
            base_prob: 0.0,
            prev_q: Duration::ZERO,
            prob_c: 0.0,
            prob_cl: 0.0,
            prob_l: 0.0,
            classic_count: 0.0,
            l4s_count: 0.0,
            classic_deficit: 0,
            l4s_deficit: 0,
            round: DrrRound::default(),
            stats: DualPi2Stats::default(),
            tracer: None,
        }
    }

    pub fn set_tracer(&mut self, tracer: Box<dyn DualPi2Tracer>) {
        self.tracer = Some(tracer);
    }

    pub fn configure(&mut self, config: DualPi2QueueConfig) {
        debug!(?config, "Reconfigure DualPi2Queue");
        self.config = config;
    }

    pub fn tupdate(&self) -> Duration {
        self.config.tupdate
    }

    /// Live bytes queued across both sub-queues (staged packets excluded).
    pub fn byte_length(&self) -> usize {
        self.classic.bytes() + self.l4s.bytes()
    }

    pub fn length(&self) -> usize {
        self.classic.len() + self.l4s.len()
    }

    pub fn is_empty(&self) -> bool {
        self.length() == 0 && self.staged_classic.is_empty() && self.staged_l4s.is_empty()
    }

    pub fn stats(&self) -> &DualPi2Stats {
        &self.stats
    }

    /// Current (prob_c, prob_cl, prob_l).
    pub fn probabilities(&self) -> (f64, f64, f64) {
        (self.prob_c, self.prob_cl, self.prob_l)
    }

    /// Admits the packet unless the aggregate byte limit would be exceeded.
    /// Returns false on the forced drop (the packet is discarded).
    pub fn enqueue(&mut self, packet: P) -> bool {
        let l3_length = packet.l3_length();
        let queued = self.byte_length();
        if queued + l3_length > self.config.queue_limit {
            trace!(
                queued_bytes = queued,
                queue_limit = self.config.queue_limit,
                header = ?format!("{:X?}", &packet.as_slice()[0..std::cmp::min(56, packet.length())]),
                "Forced drop: packet(l3_len: {}) exceeds the aggregate queue limit",
                l3_length
            );
            self.stats.forced_drops += 1;
            return false;
        }
        if packet.ecn().is_l4s() {
            self.l4s.push(packet);
        } else {
            self.classic.push(packet);
        }
        self.notify_bytes_in_queue();
        true
    }

    /// One PI² controller tick: integrate the classic sojourn error and
    /// refresh the coupled probabilities. Driven every `tupdate` by the
    /// owning cell's timer task.
    pub fn update_probabilities(&mut self, now: Instant) {
        let cur_q = self
            .classic
            .front()
            .map(|packet| now.saturating_duration_since(packet.get_timestamp()))
            .unwrap_or(Duration::ZERO);
        let delta = self.config.alpha * (cur_q.as_secs_f64() - self.config.target.as_secs_f64())
            + self.config.beta * (cur_q.as_secs_f64() - self.prev_q.as_secs_f64());
        self.base_prob = (self.base_prob + delta).clamp(0.0, 1.0);
        self.prob_cl = (self.base_prob * self.config.coupling_factor).clamp(0.0, 1.0);
        self.prob_c = self.base_prob * self.base_prob;
        self.prev_q = cur_q;
        trace!(
            cur_q = ?cur_q,
            base_prob = self.base_prob,
            prob_c = self.prob_c,
            prob_cl = self.prob_cl,
            "Probability update"
        );
        if let Some(tracer) = self.tracer.as_mut() {
            tracer.probabilities(self.prob_c, self.prob_cl, self.prob_l);
        }
    }

    /// Head-of-line dequeue: staged packets first, then live WDRR
    /// scheduling through the marking/dropping engine.
    pub fn dequeue(&mut self, now: Instant) -> Option<P> {
        if let Some(packet) = self.staged_l4s.pop() {
            self.observe_sojourn(Traffic::L4s, now, &packet);
            return Some(packet);
        }
        if let Some(packet) = self.staged_classic.pop() {
            self.observe_sojourn(Traffic::Classic, now, &packet);
            return Some(packet);
        }
        while self.byte_length() > 0 {
            match self.schedule(true, true) {
                Some(Traffic::L4s) => {
                    if let Some((packet, _marked)) = self.dequeue_from_l4s(now) {
                        self.observe_sojourn(Traffic::L4s, now, &packet);
                        self.notify_bytes_in_queue();
                        return Some(packet);
                    }
                }
                Some(Traffic::Classic) => {
                    if let Some(packet) = self.dequeue_from_classic(now) {
                        self.observe_sojourn(Traffic::Classic, now, &packet);
                        self.notify_bytes_in_queue();
                        return Some(packet);
                    }
                    // The drop loop consumed the classic backlog; a drop is
                    // not an end-of-queue condition, so reschedule.
                    self.notify_bytes_in_queue();
                }
                None => return None,
            }
        }
        None
    }

    /// The consumer announced an imminent batch drain of `new_bytes`
    /// (framing included). Pre-runs scheduling and AQM decisions into the
    /// staging queues so the batch leaves with a consistent mark count.
    pub fn pending_dequeue(&mut self, new_bytes: usize, now: Instant) {
        let queued = self.pending_bytes();
        if new_bytes > queued {
            trace!(
                new_bytes,
                queued,
                "Pending dequeue covered by the current backlog, no staging"
            );
            return;
        }
        let overhead = self.config.frame_overhead;
        let mut budget = new_bytes;
        let mut marked_count = 0usize;
        let packet_population = self.length();
        let mut iterations = 0usize;
        loop {
            iterations += 1;
            // Every iteration either breaks or retires at least one packet.
            debug_assert!(iterations <= packet_population + 1);
            let classic_fits = self
                .classic
                .head_size()
                .is_some_and(|head| head + overhead <= budget);
            let l4s_fits = self
                .l4s
                .head_size()
                .is_some_and(|head| head + overhead <= budget);
            if !classic_fits && !l4s_fits {
                break;
            }
            match self.schedule(classic_fits, l4s_fits) {
                Some(Traffic::L4s) => {
                    if let Some((packet, marked)) = self.dequeue_from_l4s(now) {
                        if marked {
                            marked_count += 1;
                        }
                        budget = budget.saturating_sub(packet.l3_length() + overhead);
                        self.staged_l4s.push(packet);
                    }
                }
                Some(Traffic::Classic) => {
                    if let Some(packet) = self.dequeue_from_classic(now) {
                        budget = budget.saturating_sub(packet.l3_length() + overhead);
                        self.staged_classic.push(packet);
                    }
                }
                None => break,
            }
        }
        self.notify_bytes_in_queue();
        // Packets left in the live L4S queue will see the coupled mark rate
        // when they are eventually dequeued; the staged batch must carry at
        // least that many marks so the batch path and the per-packet path
        // signal congestion at the same rate.
        let left_behind = self.l4s.len();
        if left_behind > marked_count {
            let mut backfill = left_behind - marked_count;
            for packet in self.staged_l4s.iter_mut() {
                if backfill == 0 {
                    break;
                }
                if packet.ecn() != EcnCodepoint::Ce {
                    packet.set_ecn(EcnCodepoint::Ce);
                    self.stats.l4s_marks += 1;
                    backfill -= 1;
                }
            }
            trace!(
                left_behind,
                marked_count,
                staged = self.staged_l4s.len(),
                "Backfilled CE marks on staged L4S packets"
            );
        }
    }

    // The queue's own notion of what the consumer can still drain: live and
    // staged packets, each inflated by the link framing overhead.
    fn pending_bytes(&self) -> usize {
        let packets = self.length() + self.staged_classic.len() + self.staged_l4s.len();
        self.byte_length()
            + self.staged_classic.bytes()
            + self.staged_l4s.bytes()
            + self.config.frame_overhead * packets
    }

    // Weighted deficit round robin across the two sub-queues. Eligibility is
    // the caller's byte-budget constraint and is distinct from emptiness: an
    // ineligible queue sits out the round, an empty queue also forfeits its
    // deficit.
    fn schedule(&mut self, classic_eligible: bool, l4s_eligible: bool) -> Option<Traffic> {
        let classic_head = self.classic.head_size();
        let l4s_head = self.l4s.head_size();
        let classic_runnable = classic_eligible && classic_head.is_some();
        let l4s_runnable = l4s_eligible && l4s_head.is_some();
        if !classic_runnable && !l4s_runnable {
            if classic_head.is_none() {
                self.classic_deficit = 0;
                self.round.classic = false;
            }
            if l4s_head.is_none() {
                self.l4s_deficit = 0;
                self.round.l4s = false;
            }
            return None;
        }
        let quantum = self.config.drr_quantum;
        let l4s_quantum = self.config.l4s_quantum();
        // Deficits grow by at least one quantum per round, so the largest
        // present head fits within head/quantum further rounds; the slack
        // covers a round already in progress.
        let largest_head = classic_head.unwrap_or(0).max(l4s_head.unwrap_or(0));
        let max_attempts = largest_head / quantum + 3;
        for _ in 0..max_attempts {
            if !self.round.classic && !self.round.l4s {
                self.round.classic = true;
                self.round.l4s = true;
                self.classic_deficit += quantum;
                self.l4s_deficit += l4s_quantum;
                trace!(
                    classic_deficit = self.classic_deficit,
                    l4s_deficit = self.l4s_deficit,
                    "New scheduling round"
                );
            }
            if self.round.l4s {
                match self.l4s.head_size() {
                    Some(head) if l4s_eligible => {
                        if head <= self.l4s_deficit {
                            self.l4s_deficit -= head;
                            return Some(Traffic::L4s);
                        }
                        self.round.l4s = false;
                    }
                    Some(_) => self.round.l4s = false,
                    None => {
                        self.l4s_deficit = 0;
                        self.round.l4s = false;
                    }
                }
            }
            if self.round.classic {
                match self.classic.head_size() {
                    Some(head) if classic_eligible => {
                        if head <= self.classic_deficit {
                            self.classic_deficit -= head;
                            return Some(Traffic::Classic);
                        }
                        self.round.classic = false;
                    }
                    Some(_) => self.round.classic = false,
                    None => {
                        self.classic_deficit = 0;
                        self.round.classic = false;
                    }
                }
            }
        }
        unreachable!("deficit round-robin failed to select despite a runnable queue")
    }

    // Classic AQM action on dequeue: pop, and while the recurrence counter
    // fires, mark ECN-capable packets or drop the rest and try the next
    // head. The small standing queue below the backstop is never dropped.
    fn dequeue_from_classic(&mut self, now: Instant) -> Option<P> {
        while let Some(mut packet) = self.classic.pop() {
            if self.classic.bytes() >= self.config.classic_drop_backstop()
                && recur(&mut self.classic_count, self.prob_c)
            {
                if packet.ecn().is_ect() {
                    packet.set_ecn(EcnCodepoint::Ce);
                    self.stats.classic_marks += 1;
                    trace!(
                        prob_c = self.prob_c,
                        sojourn = ?now.saturating_duration_since(packet.get_timestamp()),
                        "Classic congestion signalled by CE mark"
                    );
                    return Some(packet);
                }
                trace!(
                    prob_c = self.prob_c,
                    after_queue_len = self.classic.len(),
                    after_queue_bytes = self.classic.bytes(),
                    header = ?format!("{:X?}", &packet.as_slice()[0..std::cmp::min(56, packet.length())]),
                    "Unforced classic drop (l3_len: {})",
                    packet.l3_length()
                );
                self.stats.unforced_classic_drops += 1;
                continue;
            }
            return Some(packet);
        }
        None
    }

    // L4S action on dequeue: mark at the greater of the native step
    // probability and the coupled probability. Never drops.
    fn dequeue_from_l4s(&mut self, now: Instant) -> Option<(P, bool)> {
        let mut packet = self.l4s.pop()?;
        let sojourn = now.saturating_duration_since(packet.get_timestamp());
        let native: f64 = if sojourn > self.config.l4s_mark_threshold {
            1.0
        } else {
            0.0
        };
        self.prob_l = match self.config.l4s_mark_policy {
            L4sMarkPolicy::Max => native.max(self.prob_cl),
            L4sMarkPolicy::NativeOnly => native,
            L4sMarkPolicy::CoupledOnly => self.prob_cl,
        }
        .clamp(0.0, 1.0);
        let marked = recur(&mut self.l4s_count, self.prob_l);
        if marked {
            packet.set_ecn(EcnCodepoint::Ce);
            self.stats.l4s_marks += 1;
            trace!(
                prob_l = self.prob_l,
                sojourn = ?sojourn,
                "L4S packet marked CE"
            );
        }
        Some((packet, marked))
    }

    fn observe_sojourn(&mut self, traffic: Traffic, now: Instant, packet: &P) {
        let sojourn = now.saturating_duration_since(packet.get_timestamp());
        if let Some(tracer) = self.tracer.as_mut() {
            match traffic {
                Traffic::Classic => tracer.classic_sojourn(sojourn),
                Traffic::L4s => tracer.l4s_sojourn(sojourn),
            }
        }
    }

    fn notify_bytes_in_queue(&mut self) {
        let bytes = self.byte_length();
        if let Some(tracer) = self.tracer.as_mut() {
            tracer.bytes_in_queue(bytes);
        }
    }
}
