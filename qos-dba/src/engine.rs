//! The borrow/lend engine.
//!
//! Runs after the tracker, once per tick and direction. Bandwidth moves in two passes:
//!
//! 1. **Rebalance.** A class that has been HIGH for `high_usage_duration` takes a bounded slice
//!    of a LOW class's headroom. Donors are never of strictly higher priority than the borrower.
//! 2. **Auto-return.** A net borrower that has been LOW long enough gives part of its debt back.
//!    The returned bandwidth is credited to the classes that are net lenders, so every
//!    direction's ledger keeps summing to zero.
//!
//! Every move is two or more `tc` writes. If any write fails the already applied ones are rolled
//! back and the ledger is left untouched.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use qos_common::Direction;
use qos_tc::TrafficControl;

use crate::{
    class::{TrafficClass, UsageState},
    config::DbaConfig,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdjustmentKind {
    Borrow,
    Return,
}

/// A committed bandwidth move from one class to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Adjustment {
    pub direction: Direction,
    pub kind: AdjustmentKind,
    pub from: String,
    pub to: String,
    pub kbps: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Untouched,
    Borrower,
    Donor,
    Returner,
    Creditor,
}

/// What each class did during the current tick. A class takes at most one role per tick.
#[derive(Debug, Clone)]
pub struct TickRoles {
    roles: Vec<Role>,
}

impl TickRoles {
    pub fn new(classes: usize) -> Self {
        Self { roles: vec![Role::Untouched; classes] }
    }

    pub fn touched(&self, index: usize) -> bool {
        self.roles.get(index).is_some_and(|role| *role != Role::Untouched)
    }

    fn set(&mut self, index: usize, role: Role) {
        if let Some(slot) = self.roles.get_mut(index) {
            *slot = role;
        }
    }
}

/// Extra allocation a saturated class needs to drop back to the high threshold, floored at
/// `min_borrow_kbps`.
pub fn needed_kbps(used_kbps: u64, current_kbps: u64, high_fraction: f64, min_borrow_kbps: u64) -> u64 {
    let target = if high_fraction > 0.0 { (used_kbps as f64 / high_fraction).ceil() as u64 } else { used_kbps };
    target.saturating_sub(current_kbps).max(min_borrow_kbps)
}

/// Size of a single transfer, or `None` if it would be below the change deadband.
///
/// The offer is `borrow_ratio` of the donor's lendable bandwidth, limited to what the borrower
/// needs and floored at `min_borrow_kbps`; the result never exceeds what the donor can lend or
/// what the borrower may still take.
pub fn transfer_kbps(needed: u64, lendable: u64, room: u64, config: &DbaConfig) -> Option<u64> {
    let offered = (lendable as f64 * config.borrow_ratio).floor() as u64;
    let kbps = needed.min(offered).max(config.min_borrow_kbps).min(lendable).min(room);

    (kbps > 0 && kbps >= config.min_change_kbps).then_some(kbps)
}

/// Size of a single return for a class owing `borrowed` kbit/s, before lender capacity is
/// considered.
pub fn return_kbps(class: &TrafficClass, config: &DbaConfig) -> u64 {
    let borrowed = class.borrowed_kbps.max(0) as u64;
    let step = (borrowed as f64 * config.return_speed_ratio).round() as u64;

    step.max(config.min_change_kbps)
        .min(borrowed)
        .min(class.current_kbps.saturating_sub(class.config_min_kbps))
}

/// Moves bandwidth between the classes of one direction.
#[derive(Clone, Copy)]
pub struct Engine<'a> {
    config: &'a DbaConfig,
    tc: &'a dyn TrafficControl,
    now: Instant,
    ceiling: Option<u64>,
}

impl std::fmt::Debug for Engine<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").field("now", &self.now).field("ceiling", &self.ceiling).finish()
    }
}

impl<'a> Engine<'a> {
    pub fn new(config: &'a DbaConfig, tc: &'a dyn TrafficControl, now: Instant) -> Self {
        Self { config, tc, now, ceiling: None }
    }

    /// Caps every allocation at the link ceiling currently permitted.
    pub fn with_ceiling(mut self, ceiling: Option<u64>) -> Self {
        self.ceiling = ceiling;
        self
    }

    /// Runs both passes over `classes`.
    pub fn run(&self, classes: &mut [TrafficClass]) -> Vec<Adjustment> {
        let mut roles = TickRoles::new(classes.len());
        let mut adjustments = Vec::new();

        self.rebalance(classes, &mut roles, &mut adjustments);
        if self.config.auto_return_enabled {
            self.auto_return(classes, &mut roles, &mut adjustments);
        }

        adjustments
    }

    fn available(&self, class: &TrafficClass, index: usize, roles: &TickRoles) -> bool {
        !roles.touched(index) && !class.in_cooldown(self.now, self.config.cooldown_sec)
    }

    fn can_donate(&self, donor: &TrafficClass, borrower_priority: u8) -> bool {
        donor.sustained(UsageState::Low, self.config.low_usage_duration_sec)
            && donor.current_kbps > donor.config_min_kbps
            && donor.priority >= borrower_priority
            && donor.lendable_kbps() > 0
    }

    /// Lends to every sustained-HIGH class, highest priority first.
    pub fn rebalance(
        &self,
        classes: &mut [TrafficClass],
        roles: &mut TickRoles,
        out: &mut Vec<Adjustment>,
    ) {
        let mut order: Vec<usize> = (0..classes.len()).collect();
        order.sort_by_key(|&i| classes[i].priority);

        for borrower in order {
            let class = &classes[borrower];
            if !class.sustained(UsageState::High, self.config.high_usage_duration_sec)
                || !self.available(class, borrower, roles)
            {
                continue;
            }

            let cap = class.effective_max_kbps(self.ceiling);
            if class.current_kbps >= cap {
                tracing::debug!(class = %class.name, cap, "saturated class already at its cap");
                continue;
            }
            let room = cap - class.current_kbps;
            let needed = needed_kbps(
                class.used_kbps,
                class.current_kbps,
                self.config.high_fraction(),
                self.config.min_borrow_kbps,
            );

            let mut donors: Vec<usize> = (0..classes.len())
                .filter(|&d| {
                    d != borrower
                        && self.available(&classes[d], d, roles)
                        && self.can_donate(&classes[d], class.priority)
                })
                .collect();
            donors.sort_by(|&a, &b| {
                classes[a]
                    .usage_rate
                    .total_cmp(&classes[b].usage_rate)
                    .then(classes[b].priority.cmp(&classes[a].priority))
            });

            for donor in donors {
                let Some(kbps) = transfer_kbps(needed, classes[donor].lendable_kbps(), room, self.config)
                else {
                    continue;
                };

                match self.transfer(classes, donor, borrower, kbps) {
                    Ok(()) => {
                        roles.set(donor, Role::Donor);
                        roles.set(borrower, Role::Borrower);
                        out.push(Adjustment {
                            direction: classes[borrower].direction,
                            kind: AdjustmentKind::Borrow,
                            from: classes[donor].name.clone(),
                            to: classes[borrower].name.clone(),
                            kbps,
                        });
                    }
                    Err(e) => {
                        tracing::warn!(from = %classes[donor].name, to = %classes[borrower].name, kbps, error = %e, "transfer aborted");
                    }
                }
                break;
            }
        }
    }

    fn transfer(
        &self,
        classes: &mut [TrafficClass],
        donor: usize,
        borrower: usize,
        kbps: u64,
    ) -> qos_tc::Result<()> {
        let donor_old = classes[donor].current_kbps;
        let borrower_new = classes[borrower].current_kbps + kbps;

        self.tc.apply_rate(&classes[donor].target, donor_old - kbps)?;

        if let Err(e) = self.tc.apply_rate(&classes[borrower].target, borrower_new) {
            self.restore(&classes[donor], donor_old);
            return Err(e);
        }

        let d = &mut classes[donor];
        d.current_kbps -= kbps;
        d.borrowed_kbps -= kbps as i64;
        d.stamp(self.now);

        let b = &mut classes[borrower];
        b.current_kbps = borrower_new;
        b.borrowed_kbps += kbps as i64;
        b.durations.high = 0;
        b.stamp(self.now);

        tracing::info!(from = %classes[donor].name, to = %classes[borrower].name, kbps, "bandwidth lent");
        Ok(())
    }

    fn restore(&self, class: &TrafficClass, kbps: u64) {
        if let Err(e) = self.tc.apply_rate(&class.target, kbps) {
            tracing::error!(class = %class.name, kbps, error = %e, "rollback failed, shaped rate differs from allocation");
        }
    }

    /// Returns borrowed bandwidth from sustained-LOW borrowers to the net lenders.
    pub fn auto_return(
        &self,
        classes: &mut [TrafficClass],
        roles: &mut TickRoles,
        out: &mut Vec<Adjustment>,
    ) {
        for returner in 0..classes.len() {
            let class = &classes[returner];
            if class.borrowed_kbps <= 0
                || !class.sustained(UsageState::Low, self.config.low_usage_duration_sec)
                || class.usage_rate * 100.0 > self.config.return_threshold_pct as f64
                || !self.available(class, returner, roles)
            {
                continue;
            }

            let amount = return_kbps(class, self.config);
            if amount == 0 {
                continue;
            }

            let mut lenders: Vec<usize> = (0..classes.len())
                .filter(|&l| {
                    l != returner
                        && classes[l].borrowed_kbps < 0
                        && self.available(&classes[l], l, roles)
                })
                .collect();
            lenders.sort_by_key(|&l| classes[l].borrowed_kbps);

            let mut remaining = amount;
            let mut plan = Vec::new();
            for lender in lenders {
                if remaining == 0 {
                    break;
                }
                let l = &classes[lender];
                let share = remaining
                    .min(l.borrowed_kbps.unsigned_abs())
                    .min(l.effective_max_kbps(self.ceiling).saturating_sub(l.current_kbps));
                if share > 0 {
                    plan.push((lender, share));
                    remaining -= share;
                }
            }

            if plan.is_empty() {
                tracing::debug!(class = %classes[returner].name, amount, "no lender can take the return, deferring");
                continue;
            }

            match self.settle(classes, returner, &plan) {
                Ok(()) => {
                    roles.set(returner, Role::Returner);
                    for &(lender, kbps) in &plan {
                        roles.set(lender, Role::Creditor);
                        out.push(Adjustment {
                            direction: classes[returner].direction,
                            kind: AdjustmentKind::Return,
                            from: classes[returner].name.clone(),
                            to: classes[lender].name.clone(),
                            kbps,
                        });
                    }
                }
                Err(e) => {
                    tracing::warn!(class = %classes[returner].name, amount, error = %e, "return aborted");
                }
            }
        }
    }

    fn settle(
        &self,
        classes: &mut [TrafficClass],
        returner: usize,
        plan: &[(usize, u64)],
    ) -> qos_tc::Result<()> {
        let returned: u64 = plan.iter().map(|(_, kbps)| kbps).sum();
        let returner_old = classes[returner].current_kbps;

        self.tc.apply_rate(&classes[returner].target, returner_old - returned)?;

        for (done, &(lender, kbps)) in plan.iter().enumerate() {
            let l = &classes[lender];
            if let Err(e) = self.tc.apply_rate(&l.target, l.current_kbps + kbps) {
                for &(applied, _) in plan[..done].iter().rev() {
                    self.restore(&classes[applied], classes[applied].current_kbps);
                }
                self.restore(&classes[returner], returner_old);
                return Err(e);
            }
        }

        let r = &mut classes[returner];
        r.current_kbps -= returned;
        r.borrowed_kbps -= returned as i64;
        r.stamp(self.now);

        for &(lender, kbps) in plan {
            let l = &mut classes[lender];
            l.current_kbps += kbps;
            l.borrowed_kbps += kbps as i64;
            l.stamp(self.now);
        }

        tracing::info!(class = %classes[returner].name, kbps = returned, remaining = classes[returner].borrowed_kbps, "borrowed bandwidth returned");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::ClassSpec;
    use qos_tc::{ClassId, ClassTarget, MemoryTc};

    fn class(name: &str, minor: u16, priority: u8, current: u64) -> TrafficClass {
        let spec = ClassSpec {
            name: name.into(),
            classid: ClassId::new(1, minor),
            priority,
            percent: 0,
            min_kbps: 100,
            max_kbps: 1000,
            initial_kbps: current,
        };
        TrafficClass::new(Direction::Upload, ClassTarget::new("eth0", spec.classid), &spec)
    }

    fn hold(class: &mut TrafficClass, state: UsageState, secs: u64, used: u64) {
        class.used_kbps = used;
        class.usage_rate = used as f64 / class.current_kbps as f64;
        class.state = state;
        class.durations.reset();
        class.durations.add(state, secs);
    }

    fn provisioned(classes: &[TrafficClass]) -> MemoryTc {
        let tc = MemoryTc::new();
        for c in classes {
            tc.provision(&c.target, c.current_kbps);
        }
        tc
    }

    #[test]
    fn needed_and_transfer_sizes() {
        let config = DbaConfig::default();
        assert_eq!(needed_kbps(490, 500, 0.9, 64), 64);
        assert_eq!(needed_kbps(900, 500, 0.9, 64), 500);

        // 20% of 200 is 40, floored at the 64 minimum
        assert_eq!(transfer_kbps(64, 200, 1000, &config), Some(64));
        // donor can only lend 50, below the change deadband
        assert_eq!(transfer_kbps(64, 50, 1000, &config), None);
        assert_eq!(transfer_kbps(500, 1000, 150, &config), Some(150));
        assert_eq!(transfer_kbps(500, 1000, 0, &config), None);
    }

    #[test]
    fn lends_from_low_to_high() {
        let config = DbaConfig::default();
        let mut classes = vec![class("realtime", 0x10, 0, 500), class("bulk", 0x20, 2, 500)];
        hold(&mut classes[0], UsageState::High, 5, 495);
        hold(&mut classes[1], UsageState::Low, 5, 20);
        let tc = provisioned(&classes);

        let adjustments = Engine::new(&config, &tc, Instant::now()).run(&mut classes);

        assert_eq!(adjustments.len(), 1);
        assert_eq!(adjustments[0].kind, AdjustmentKind::Borrow);
        assert_eq!(adjustments[0].kbps, 64);
        assert_eq!(classes[0].current_kbps, 564);
        assert_eq!(classes[1].current_kbps, 436);
        assert_eq!(classes[0].borrowed_kbps + classes[1].borrowed_kbps, 0);
        assert_eq!(classes[0].durations.high, 0);
        assert_eq!(tc.rate(&classes[0].target), Some(564));
        assert_eq!(tc.rate(&classes[1].target), Some(436));
    }

    #[test]
    fn never_robs_higher_priority() {
        let config = DbaConfig::default();
        let mut classes = vec![class("realtime", 0x10, 0, 500), class("bulk", 0x20, 2, 500)];
        hold(&mut classes[0], UsageState::Low, 10, 10);
        hold(&mut classes[1], UsageState::High, 10, 500);
        let tc = provisioned(&classes);

        assert!(Engine::new(&config, &tc, Instant::now()).run(&mut classes).is_empty());
        assert_eq!(tc.write_count(), 0);
    }

    #[test]
    fn prefers_least_used_then_lowest_priority_donor() {
        let config = DbaConfig::default();
        let mut classes = vec![
            class("realtime", 0x10, 0, 500),
            class("normal", 0x20, 1, 500),
            class("bulk", 0x30, 2, 500),
            class("idle", 0x40, 2, 500),
        ];
        hold(&mut classes[0], UsageState::High, 5, 500);
        hold(&mut classes[1], UsageState::Low, 5, 50);
        hold(&mut classes[2], UsageState::Low, 5, 50);
        hold(&mut classes[3], UsageState::Low, 5, 100);
        let tc = provisioned(&classes);

        let adjustments = Engine::new(&config, &tc, Instant::now()).run(&mut classes);
        assert_eq!(adjustments.len(), 1);
        assert_eq!(adjustments[0].from, "bulk");
    }

    #[test]
    fn failed_write_rolls_back() {
        let config = DbaConfig::default();
        let mut classes = vec![class("realtime", 0x10, 0, 500), class("bulk", 0x20, 2, 500)];
        hold(&mut classes[0], UsageState::High, 5, 495);
        hold(&mut classes[1], UsageState::Low, 5, 20);
        let tc = provisioned(&classes);
        tc.fail_writes_to(classes[0].target.classid, true);

        let adjustments = Engine::new(&config, &tc, Instant::now()).run(&mut classes);

        assert!(adjustments.is_empty());
        assert_eq!(classes[0].current_kbps, 500);
        assert_eq!(classes[1].current_kbps, 500);
        assert_eq!(classes[1].borrowed_kbps, 0);
        assert_eq!(tc.rate(&classes[1].target), Some(500));
        assert!(classes[1].last_adjust.is_none());
    }

    #[test]
    fn cooldown_blocks_second_adjustment() {
        let config = DbaConfig::default();
        let mut classes = vec![class("realtime", 0x10, 0, 500), class("bulk", 0x20, 2, 500)];
        hold(&mut classes[0], UsageState::High, 5, 495);
        hold(&mut classes[1], UsageState::Low, 5, 20);
        let tc = provisioned(&classes);
        let now = Instant::now();

        assert_eq!(Engine::new(&config, &tc, now).run(&mut classes).len(), 1);

        hold(&mut classes[0], UsageState::High, 5, 560);
        let later = now + Duration::from_secs(config.cooldown_sec - 1);
        assert!(Engine::new(&config, &tc, later).run(&mut classes).is_empty());

        let after = now + Duration::from_secs(config.cooldown_sec);
        assert_eq!(Engine::new(&config, &tc, after).run(&mut classes).len(), 1);
    }

    #[test]
    fn ceiling_caps_borrower() {
        let config = DbaConfig::default();
        let mut classes = vec![class("realtime", 0x10, 0, 500), class("bulk", 0x20, 2, 500)];
        hold(&mut classes[0], UsageState::High, 5, 500);
        hold(&mut classes[1], UsageState::Low, 5, 0);
        let tc = provisioned(&classes);

        let engine = Engine::new(&config, &tc, Instant::now()).with_ceiling(Some(500));
        assert!(engine.run(&mut classes).is_empty());
    }

    #[test]
    fn returns_to_lenders() {
        let config = DbaConfig::default();
        let mut classes = vec![class("realtime", 0x10, 0, 800), class("bulk", 0x20, 2, 200)];
        classes[0].borrowed_kbps = 300;
        classes[1].borrowed_kbps = -300;
        hold(&mut classes[0], UsageState::Low, 5, 40);
        hold(&mut classes[1], UsageState::Normal, 5, 150);
        let tc = provisioned(&classes);

        let adjustments = Engine::new(&config, &tc, Instant::now()).run(&mut classes);

        assert_eq!(adjustments.len(), 1);
        assert_eq!(adjustments[0].kind, AdjustmentKind::Return);
        assert_eq!(adjustments[0].kbps, 64);
        assert_eq!(classes[0].borrowed_kbps, 236);
        assert_eq!(classes[1].borrowed_kbps, -236);
        assert_eq!(classes[0].current_kbps, 736);
        assert_eq!(classes[1].current_kbps, 264);
    }

    #[test]
    fn return_never_crosses_minimum() {
        let config = DbaConfig::default();
        let mut c = class("realtime", 0x10, 0, 130);
        c.borrowed_kbps = 500;
        assert_eq!(return_kbps(&c, &config), 30);

        c.current_kbps = 1000;
        c.borrowed_kbps = 20;
        assert_eq!(return_kbps(&c, &config), 20);
    }

    #[test]
    fn return_without_lender_is_deferred() {
        let config = DbaConfig::default();
        let mut classes = vec![class("realtime", 0x10, 0, 800), class("bulk", 0x20, 2, 200)];
        classes[0].borrowed_kbps = 300;
        hold(&mut classes[0], UsageState::Low, 5, 40);
        let tc = provisioned(&classes);

        assert!(Engine::new(&config, &tc, Instant::now()).run(&mut classes).is_empty());
        assert_eq!(classes[0].borrowed_kbps, 300);
    }
}
