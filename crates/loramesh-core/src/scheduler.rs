//! Duty-cycle-aware transmission scheduler.
//!
//! One deadline per node drives four send categories: own data, forwards,
//! periodic advertisements and discovery control traffic. On each wake the
//! node either defers (channel busy), transmits one packet from a due
//! category, or re-arms for the earliest future work. Category arbitration
//! is probabilistic when several are due at once; duty-cycle enforcement
//! floors every category behind a shared watermark after each transmission.
//!
//! The scheduler owns no clock and no queues; the node tells it what work is
//! pending and when transmissions happen, and an external driver advances it.

use crate::config::NodeConfig;
use crate::time::SimTime;
use rand::Rng;

/// Redeferral delay when the channel is busy at wake time.
pub const CHANNEL_BUSY_RETRY: f64 = 20e-6;

/// Guard added to every armed deadline to avoid exact-time collisions with
/// the channel layer.
pub const WAKE_GUARD: f64 = 1e-3;

/// The four kinds of transmission a node arbitrates between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendCategory {
    OwnData,
    Forward,
    Advert,
    Control,
}

const CATEGORIES: [SendCategory; 4] = [
    SendCategory::OwnData,
    SendCategory::Forward,
    SendCategory::Advert,
    SendCategory::Control,
];

fn index(cat: SendCategory) -> usize {
    match cat {
        SendCategory::OwnData => 0,
        SendCategory::Forward => 1,
        SendCategory::Advert => 2,
        SendCategory::Control => 3,
    }
}

/// Which categories currently have work queued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pending {
    pub own_data: bool,
    pub forward: bool,
    pub advert: bool,
    pub control: bool,
}

impl Pending {
    pub fn any(&self) -> bool {
        self.own_data || self.forward || self.advert || self.control
    }

    fn has(&self, cat: SendCategory) -> bool {
        match cat {
            SendCategory::OwnData => self.own_data,
            SendCategory::Forward => self.forward,
            SendCategory::Advert => self.advert,
            SendCategory::Control => self.control,
        }
    }
}

/// Single-deadline transmission scheduler for one node.
#[derive(Debug)]
pub struct Scheduler {
    next_allowed: [SimTime; 4],
    /// Duty-cycle watermark flooring every category while enforcement is on.
    watermark: SimTime,
    /// Floor under any armed deadline (the airtime of the transmission just
    /// made).
    not_before: SimTime,
    deadline: Option<SimTime>,
    enforce_duty_cycle: bool,
    duty_cycle: f64,
    routing_priority: f64,
    own_data_priority: f64,
}

impl Scheduler {
    pub fn new(cfg: &NodeConfig) -> Self {
        Scheduler {
            next_allowed: [SimTime::ZERO; 4],
            watermark: SimTime::ZERO,
            not_before: SimTime::ZERO,
            deadline: None,
            enforce_duty_cycle: cfg.enforce_duty_cycle,
            duty_cycle: cfg.duty_cycle,
            routing_priority: cfg.routing_priority,
            own_data_priority: cfg.own_data_priority,
        }
    }

    /// The currently armed wake-up, if any.
    pub fn deadline(&self) -> Option<SimTime> {
        self.deadline
    }

    /// Set a category's earliest send time (initial cadence draws).
    pub fn set_next_allowed(&mut self, cat: SendCategory, at: SimTime) {
        self.next_allowed[index(cat)] = at;
    }

    fn effective_next(&self, cat: SendCategory) -> SimTime {
        let t = self.next_allowed[index(cat)];
        if self.enforce_duty_cycle {
            t.max(self.watermark)
        } else {
            t
        }
    }

    /// Choose the category to transmit from at `now`, or `None` when nothing
    /// is due yet. Discovery control wins outright; advertisements compete
    /// with data sends by the routing-priority coin, and own data competes
    /// with forwards by the own-data-priority coin.
    pub fn pick<R: Rng + ?Sized>(&self, now: SimTime, pending: Pending, rng: &mut R) -> Option<SendCategory> {
        let due = |cat: SendCategory| pending.has(cat) && now >= self.effective_next(cat);

        if due(SendCategory::Control) {
            return Some(SendCategory::Control);
        }
        let advert = due(SendCategory::Advert);
        let own = due(SendCategory::OwnData);
        let forward = due(SendCategory::Forward);

        let data = |rng: &mut R| {
            if own && forward {
                if rng.gen_bool(self.own_data_priority) {
                    SendCategory::OwnData
                } else {
                    SendCategory::Forward
                }
            } else if own {
                SendCategory::OwnData
            } else {
                SendCategory::Forward
            }
        };

        match (advert, own || forward) {
            (true, true) => {
                if rng.gen_bool(self.routing_priority) {
                    Some(SendCategory::Advert)
                } else {
                    Some(data(rng))
                }
            }
            (true, false) => Some(SendCategory::Advert),
            (false, true) => Some(data(rng)),
            (false, false) => None,
        }
    }

    /// Account for a transmission of `airtime` seconds from `cat` at `now`.
    ///
    /// The category's next-allowed time moves to
    /// `now + max(interval_draw, enforced ? airtime/duty : airtime)`, and
    /// with enforcement on, the shared watermark moves to
    /// `now + airtime/duty`, flooring every category.
    pub fn on_transmitted(&mut self, cat: SendCategory, now: SimTime, airtime: f64, interval_draw: f64) {
        let silence = if self.enforce_duty_cycle {
            airtime / self.duty_cycle
        } else {
            airtime
        };
        self.next_allowed[index(cat)] = now + interval_draw.max(silence);
        if self.enforce_duty_cycle {
            self.watermark = now + airtime / self.duty_cycle;
        }
        self.not_before = now + airtime;
    }

    /// Re-arm the deadline from current pending work. Never earlier than
    /// `now`, the airtime floor of the latest transmission, or (per
    /// category) the duty-cycle watermark; a guard keeps it off exact
    /// channel-event times.
    pub fn rearm(&mut self, now: SimTime, pending: Pending) -> Option<SimTime> {
        let earliest = CATEGORIES
            .iter()
            .filter(|&&c| pending.has(c))
            .map(|&c| self.effective_next(c))
            .min();
        self.deadline = earliest.map(|t| t.max(now).max(self.not_before) + WAKE_GUARD);
        self.deadline
    }

    /// Push the armed wake-up back by the fixed busy-channel delay.
    pub fn defer_busy(&mut self, now: SimTime) -> SimTime {
        let at = now + CHANNEL_BUSY_RETRY;
        self.deadline = Some(at);
        at
    }

    /// Drop the armed wake-up (node failure).
    pub fn cancel(&mut self) {
        self.deadline = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::NodeId;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn t(secs: f64) -> SimTime {
        SimTime::from_secs(secs)
    }

    fn scheduler(enforce: bool) -> Scheduler {
        let mut cfg = NodeConfig::new(NodeId::new(0), 4);
        cfg.enforce_duty_cycle = enforce;
        cfg.duty_cycle = 0.01;
        Scheduler::new(&cfg)
    }

    #[test]
    fn test_control_wins_outright() {
        let s = scheduler(false);
        let mut rng = SmallRng::seed_from_u64(1);
        let pending = Pending { own_data: true, forward: true, advert: true, control: true };
        for _ in 0..20 {
            assert_eq!(s.pick(t(0.0), pending, &mut rng), Some(SendCategory::Control));
        }
    }

    #[test]
    fn test_nothing_due_before_next_allowed() {
        let mut s = scheduler(false);
        s.set_next_allowed(SendCategory::OwnData, t(10.0));
        let mut rng = SmallRng::seed_from_u64(1);
        let pending = Pending { own_data: true, ..Default::default() };
        assert_eq!(s.pick(t(5.0), pending, &mut rng), None);
        assert_eq!(s.pick(t(10.0), pending, &mut rng), Some(SendCategory::OwnData));
    }

    #[test]
    fn test_priority_coin_is_biased() {
        let mut cfg = NodeConfig::new(NodeId::new(0), 4);
        cfg.enforce_duty_cycle = false;
        cfg.routing_priority = 1.0;
        let s = Scheduler::new(&cfg);
        let mut rng = SmallRng::seed_from_u64(1);
        let pending = Pending { own_data: true, advert: true, ..Default::default() };
        for _ in 0..20 {
            assert_eq!(s.pick(t(0.0), pending, &mut rng), Some(SendCategory::Advert));
        }
    }

    #[test]
    fn test_duty_cycle_watermark_floors_all_categories() {
        let mut s = scheduler(true);
        let airtime = 0.1;
        s.on_transmitted(SendCategory::OwnData, t(0.0), airtime, 0.0);

        // 1% duty cycle: 100x the airtime of silence for every category.
        let mut rng = SmallRng::seed_from_u64(1);
        let pending = Pending { own_data: true, forward: true, advert: true, control: false };
        assert_eq!(s.pick(t(9.9), pending, &mut rng), None);
        assert!(s.pick(t(10.0), pending, &mut rng).is_some());

        let deadline = s.rearm(t(0.1), pending).unwrap();
        assert!(deadline >= t(10.0));
    }

    #[test]
    fn test_unenforced_duty_cycle_only_blocks_airtime() {
        let mut s = scheduler(false);
        s.on_transmitted(SendCategory::OwnData, t(0.0), 0.1, 0.0);
        let mut rng = SmallRng::seed_from_u64(1);
        let pending = Pending { own_data: true, ..Default::default() };
        assert_eq!(s.pick(t(0.05), pending, &mut rng), None);
        assert!(s.pick(t(0.2), pending, &mut rng).is_some());
    }

    #[test]
    fn test_interval_draw_can_exceed_silence() {
        let mut s = scheduler(true);
        s.on_transmitted(SendCategory::OwnData, t(0.0), 0.1, 60.0);
        let mut rng = SmallRng::seed_from_u64(1);
        let pending = Pending { own_data: true, ..Default::default() };
        assert_eq!(s.pick(t(30.0), pending, &mut rng), None);
        assert!(s.pick(t(60.0), pending, &mut rng).is_some());
    }

    #[test]
    fn test_rearm_respects_airtime_floor() {
        let mut s = scheduler(false);
        s.on_transmitted(SendCategory::OwnData, t(5.0), 2.0, 0.0);
        let pending = Pending { forward: true, ..Default::default() };
        // Forward work is allowed immediately, but the wake-up may not land
        // inside the transmission just made.
        let deadline = s.rearm(t(5.0), pending).unwrap();
        assert!(deadline >= t(7.0));
    }

    #[test]
    fn test_busy_deferral() {
        let mut s = scheduler(false);
        let at = s.defer_busy(t(1.0));
        assert_eq!(at, t(1.0) + CHANNEL_BUSY_RETRY);
        assert_eq!(s.deadline(), Some(at));
    }

    #[test]
    fn test_no_pending_disarms() {
        let mut s = scheduler(false);
        assert!(s.rearm(t(0.0), Pending::default()).is_none());
        assert!(s.deadline().is_none());
    }
}
