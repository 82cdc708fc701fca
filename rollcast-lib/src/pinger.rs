//! Timed probe sequencing and the mergeable latency statistics both peers
//! agree on after the two-sided exchange.
//!
//! The pinger is a pure state machine: the reactor asks for the next tick
//! deadline, feeds ticks and pongs back in, and sends whatever the pinger
//! tells it to. No I/O happens here.

use std::time::{Duration, Instant};

use getset::CopyGetters;
use serde::{Deserialize, Serialize};

use crate::message::Ping;

pub const NUM_PINGS: u32 = 10;

/// One probe per frame at 60 Hz.
pub const PING_INTERVAL: Duration = Duration::from_micros(1_000_000 / 60);

/// Running latency moments. Serialized whole so the remote side can merge
/// with its own without losing mean, worst, or variance.
#[derive(Clone, Copy, Debug, Default, CopyGetters, Deserialize, Serialize)]
pub struct Statistics {
    #[getset(get_copy = "pub")]
    count: u32,
    #[getset(get_copy = "pub")]
    mean: f64,
    m2: f64,
    #[getset(get_copy = "pub")]
    worst: f64,
}

impl Statistics {
    /// Welford update.
    pub fn record(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / f64::from(self.count);
        self.m2 += delta * (value - self.mean);
        if value > self.worst {
            self.worst = value;
        }
    }

    /// Parallel-moments addition; commutative in mean, worst and variance.
    pub fn merge(&mut self, other: &Statistics) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        let n1 = f64::from(self.count);
        let n2 = f64::from(other.count);
        let n = n1 + n2;
        let delta = other.mean - self.mean;
        self.mean += delta * n2 / n;
        self.m2 += other.m2 + delta * delta * n1 * n2 / n;
        self.worst = self.worst.max(other.worst);
        self.count += other.count;
    }

    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / f64::from(self.count)
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn std_err(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.std_dev() / f64::from(self.count).sqrt()
        }
    }
}

/// What the reactor must do after a tick.
#[derive(Debug)]
pub enum Tick {
    Send(Ping),
    Complete(Statistics, u8),
}

#[derive(Debug)]
pub struct Pinger {
    num_pings: u32,
    interval: Duration,
    next_tick: Option<Instant>,
    in_flight: Vec<Option<Instant>>,
    responses: u32,
    stats: Statistics,
    completed: bool,
}

impl Default for Pinger {
    fn default() -> Self {
        Self::new(NUM_PINGS, PING_INTERVAL)
    }
}

impl Pinger {
    pub fn new(num_pings: u32, interval: Duration) -> Self {
        Self {
            num_pings,
            interval,
            next_tick: None,
            in_flight: Vec::new(),
            responses: 0,
            stats: Statistics::default(),
            completed: false,
        }
    }

    pub fn start(&mut self, now: Instant) {
        self.reset();
        self.next_tick = Some(now);
    }

    pub fn reset(&mut self) {
        self.next_tick = None;
        self.in_flight.clear();
        self.responses = 0;
        self.stats = Statistics::default();
        self.completed = false;
    }

    pub fn is_running(&self) -> bool {
        self.next_tick.is_some()
    }

    pub fn next_tick(&self) -> Option<Instant> {
        self.next_tick
    }

    pub fn stats(&self) -> &Statistics {
        &self.stats
    }

    pub fn packet_loss(&self) -> u8 {
        if self.num_pings == 0 {
            return 0;
        }
        ((self.num_pings - self.responses) * 100 / self.num_pings) as u8
    }

    /// Emit the next probe, or after one trailing interval (the response
    /// window of the last probe) report completion.
    pub fn tick(&mut self, now: Instant) -> Option<Tick> {
        self.next_tick?;
        let sequence = self.in_flight.len() as u32;
        if sequence < self.num_pings {
            self.in_flight.push(Some(now));
            self.next_tick = Some(now + self.interval);
            return Some(Tick::Send(Ping::new(sequence)));
        }
        Some(self.complete())
    }

    /// Record the round trip of an in-flight probe. Duplicates and unknown
    /// sequences are dropped. Completes early once every probe answered.
    pub fn got_pong(&mut self, sequence: u32, now: Instant) -> Option<Tick> {
        let slot = self.in_flight.get_mut(sequence as usize)?;
        let sent = slot.take()?;
        let rtt_ms = now.duration_since(sent).as_secs_f64() * 1000.0;
        self.stats.record(rtt_ms);
        self.responses += 1;
        if self.responses == self.num_pings && self.in_flight.len() as u32 == self.num_pings {
            return Some(self.complete());
        }
        None
    }

    fn complete(&mut self) -> Tick {
        self.completed = true;
        self.next_tick = None;
        Tick::Complete(self.stats, self.packet_loss())
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_pinger(pinger: &mut Pinger, answered: &[u32]) -> (Statistics, u8) {
        let mut now = Instant::now();
        pinger.start(now);
        loop {
            now += pinger.interval;
            match pinger.tick(now) {
                Some(Tick::Send(ping)) => {
                    if answered.contains(&ping.sequence) {
                        let pong_at = now + Duration::from_millis(16);
                        if let Some(Tick::Complete(stats, loss)) =
                            pinger.got_pong(ping.sequence, pong_at)
                        {
                            return (stats, loss);
                        }
                    }
                }
                Some(Tick::Complete(stats, loss)) => return (stats, loss),
                None => panic!("tick on an idle pinger"),
            }
        }
    }

    #[test]
    fn all_pongs_complete_early_with_zero_loss() {
        let mut pinger = Pinger::new(4, Duration::from_millis(1));
        let (stats, loss) = run_pinger(&mut pinger, &[0, 1, 2, 3]);
        assert_eq!(stats.count(), 4);
        assert_eq!(loss, 0);
        assert!((stats.mean() - 16.0).abs() < 1.0);
    }

    #[test]
    fn missing_pongs_count_as_packet_loss() {
        let mut pinger = Pinger::new(10, Duration::from_millis(1));
        let (stats, loss) = run_pinger(&mut pinger, &[0, 2, 4, 6, 8]);
        assert_eq!(stats.count(), 5);
        assert_eq!(loss, 50);
    }

    #[test]
    fn duplicate_and_unknown_sequences_are_dropped() {
        let mut pinger = Pinger::new(3, Duration::from_millis(1));
        let now = Instant::now();
        pinger.start(now);
        assert!(matches!(pinger.tick(now), Some(Tick::Send(_))));
        assert!(pinger.got_pong(0, now + Duration::from_millis(5)).is_none());
        // Duplicate of an already-answered probe.
        assert!(pinger.got_pong(0, now + Duration::from_millis(9)).is_none());
        // Never sent.
        assert!(pinger.got_pong(7, now + Duration::from_millis(9)).is_none());
        assert_eq!(pinger.stats().count(), 1);
    }

    #[test]
    fn merge_is_commutative() {
        let mut a = Statistics::default();
        for v in [12.0, 19.5, 33.0, 14.25] {
            a.record(v);
        }
        let mut b = Statistics::default();
        for v in [45.0, 8.0, 27.5] {
            b.record(v);
        }

        let mut ab = a;
        ab.merge(&b);
        let mut ba = b;
        ba.merge(&a);

        assert!((ab.mean() - ba.mean()).abs() < 1e-9);
        assert!((ab.variance() - ba.variance()).abs() < 1e-9);
        assert_eq!(ab.worst(), ba.worst());
        assert_eq!(ab.count(), ba.count());
    }

    #[test]
    fn merge_matches_recording_everything_on_one_side() {
        let values = [12.0, 19.5, 33.0, 14.25, 45.0, 8.0, 27.5];
        let mut whole = Statistics::default();
        for v in values {
            whole.record(v);
        }
        let mut left = Statistics::default();
        let mut right = Statistics::default();
        for v in &values[..3] {
            left.record(*v);
        }
        for v in &values[3..] {
            right.record(*v);
        }
        left.merge(&right);
        assert!((left.mean() - whole.mean()).abs() < 1e-9);
        assert!((left.variance() - whole.variance()).abs() < 1e-9);
        assert_eq!(left.worst(), whole.worst());
    }

    #[test]
    fn merge_with_empty_side_is_identity() {
        let mut a = Statistics::default();
        a.record(20.0);
        a.record(30.0);
        let before = a;
        a.merge(&Statistics::default());
        assert_eq!(a.count(), before.count());
        assert_eq!(a.mean(), before.mean());

        let mut empty = Statistics::default();
        empty.merge(&before);
        assert_eq!(empty.count(), before.count());
        assert_eq!(empty.mean(), before.mean());
    }
}
