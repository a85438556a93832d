use tokio::time::Duration;

/// Observer for the queue discipline's traced signals. Injected at
/// construction; every hook defaults to a no-op so scenarios subscribe only
/// to what they plot. Fired synchronously from the queue's own callbacks.
pub trait DualPi2Tracer: Send {
    fn bytes_in_queue(&mut self, _bytes: usize) {}
    fn probabilities(&mut self, _prob_c: f64, _prob_cl: f64, _prob_l: f64) {}
    fn classic_sojourn(&mut self, _sojourn: Duration) {}
    fn l4s_sojourn(&mut self, _sojourn: Duration) {}
}

/// Monotonic counters distinguishing the drop/mark taxonomy: a forced drop
/// is admission control, an unforced drop is the AQM signal on Not-ECT
/// traffic, marks leave the packet alive.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DualPi2Stats {
    pub forced_drops: u64,
    pub unforced_classic_drops: u64,
    pub classic_marks: u64,
    pub l4s_marks: u64,
}
