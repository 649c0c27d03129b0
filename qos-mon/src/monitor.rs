//! The monitor loop.
//!
//! Single threaded and cooperative: each iteration sends a probe when one is due, samples the
//! link load and runs the controller on their own cadences, then waits for a reply until the
//! earliest of those deadlines. Signals are delivered as [`ControlFlags`] and checked at the top
//! of every iteration.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use qos_common::status::StatusFile;
use qos_tc::TrafficControl;

use crate::{controller::Controller, icmp::Prober, status::MonitorStatus};

/// Requests delivered to a running [`Monitor`], usually from signal handlers.
#[derive(Debug, Default)]
pub struct ControlFlags {
    terminate: AtomicBool,
    reset: AtomicBool,
    toggle_safe_mode: AtomicBool,
}

impl ControlFlags {
    pub fn terminate(&self) {
        self.terminate.store(true, Ordering::SeqCst);
    }

    /// Asks for the ceiling to be reset to the safe default.
    pub fn reset(&self) {
        self.reset.store(true, Ordering::SeqCst);
    }

    pub fn toggle_safe_mode(&self) {
        self.toggle_safe_mode.store(true, Ordering::SeqCst);
    }

    pub fn terminated(&self) -> bool {
        self.terminate.load(Ordering::SeqCst)
    }

    fn take_reset(&self) -> bool {
        self.reset.swap(false, Ordering::SeqCst)
    }

    fn take_toggle(&self) -> bool {
        self.toggle_safe_mode.swap(false, Ordering::SeqCst)
    }
}

/// Drives a [`Controller`] with probes and load samples.
pub struct Monitor<P> {
    controller: Controller,
    prober: P,
    tc: Arc<dyn TrafficControl>,
    flags: Arc<ControlFlags>,
    status: Option<StatusFile>,
    sequence: u16,
    outstanding: Option<u16>,
}

impl<P> std::fmt::Debug for Monitor<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("controller", &self.controller)
            .field("sequence", &self.sequence)
            .field("outstanding", &self.outstanding)
            .finish_non_exhaustive()
    }
}

impl<P: Prober> Monitor<P> {
    pub fn new(controller: Controller, prober: P, tc: Arc<dyn TrafficControl>) -> Self {
        Self {
            controller,
            prober,
            tc,
            flags: Arc::default(),
            status: None,
            sequence: 0,
            outstanding: None,
        }
    }

    pub fn with_status_file(mut self, file: StatusFile) -> Self {
        self.status = Some(file);
        self
    }

    /// Flags that control this monitor. Share them with signal handlers before calling
    /// [`Monitor::run`].
    pub fn flags(&self) -> Arc<ControlFlags> {
        Arc::clone(&self.flags)
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    fn send_probe(&mut self) {
        if self.outstanding.take().is_some() {
            self.controller.on_timeout();
        }

        self.sequence = self.sequence.wrapping_add(1);
        match self.prober.send(self.sequence) {
            Ok(()) => self.outstanding = Some(self.sequence),
            Err(e) => {
                tracing::warn!(error = %e, "failed to send probe");
                self.controller.on_timeout();
            }
        }
    }

    fn receive(&mut self, timeout: Duration) {
        match self.prober.recv(timeout) {
            Ok(Some(reply)) if Some(reply.sequence) == self.outstanding => {
                self.outstanding = None;
                tracing::trace!(sequence = reply.sequence, rtt = ?reply.rtt, "probe answered");
                self.controller.on_reply(reply.rtt);
            }
            Ok(Some(reply)) => {
                tracing::debug!(sequence = reply.sequence, "ignoring stale reply");
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "probe receive failed");
                // keep a persistent socket error from spinning the loop
                std::thread::sleep(timeout);
            }
        }
    }

    /// Probes the target until it answers. Returns `false` if every attempt went unanswered.
    pub fn check_connectivity(&mut self) -> bool {
        let tuning = &self.controller.config().tuning;
        let (attempts, interval) = (tuning.connectivity_attempts, tuning.connectivity_interval);

        for attempt in 1..=attempts {
            if self.flags.terminated() {
                return false;
            }

            self.send_probe();
            let deadline = Instant::now() + interval;
            while self.outstanding.is_some() {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                self.receive(remaining);
            }

            if self.outstanding.is_none() {
                tracing::info!(attempt, "target reachable");
                return true;
            }
            tracing::warn!(attempt, attempts, "no reply from target");
        }

        self.outstanding = None;
        false
    }

    fn sample_load(&mut self) {
        let target = self.controller.config().link_target();
        match self.tc.read_used_kbps(&target) {
            Ok(kbps) => self.controller.on_load_sample(kbps),
            Err(e) => tracing::debug!(error = %e, "load read failed"),
        }
    }

    fn write_status(&self) {
        let Some(file) = &self.status else { return };
        if let Err(e) = file.write(&self.controller.snapshot()) {
            tracing::warn!(path = %file.path().display(), error = %e, "failed to write status");
        }
    }

    fn handle_flags(&mut self) {
        if self.flags.take_reset() {
            self.controller.reset_ceiling(&*self.tc);
        }
        if self.flags.take_toggle() {
            self.controller.toggle_safe_mode();
        }
    }

    /// Runs until [`ControlFlags::terminate`] is called, then restores the link and returns the
    /// final status.
    pub fn run(mut self) -> MonitorStatus {
        if !self.check_connectivity() && !self.flags.terminated() {
            tracing::error!(host = %self.controller.config().target, "target unreachable, starting in safe mode");
            self.controller.enter_safe_mode();
        }
        self.write_status();

        let (interval, stats, control) = {
            let config = self.controller.config();
            (config.ping_interval, config.tuning.stats_interval, config.tuning.control_interval)
        };
        let start = Instant::now();
        let mut next_probe = start;
        let mut next_stats = start;
        let mut next_control = start + control;

        while !self.flags.terminated() {
            self.handle_flags();
            let now = Instant::now();

            if self.controller.ping_on() && now >= next_probe {
                self.send_probe();
                next_probe = now + interval;
            }
            if now >= next_stats {
                self.sample_load();
                next_stats = now + stats;
            }
            if now >= next_control {
                self.controller.evaluate(now, &*self.tc);
                self.write_status();
                next_control = now + control;
            }

            let mut deadline = next_stats.min(next_control);
            if self.controller.ping_on() {
                deadline = deadline.min(next_probe);
            }
            let wait = deadline.saturating_duration_since(Instant::now());
            if wait.is_zero() {
                continue;
            }
            self.receive(wait);
        }

        self.controller.shutdown(&*self.tc);
        self.write_status();
        tracing::info!("monitor stopped");
        self.controller.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::{config::MonitorConfig, icmp::EchoReply};
    use qos_tc::MemoryTc;

    /// Answers each probe after a fixed delay.
    struct Echo {
        rtt: Duration,
        pending: VecDeque<u16>,
    }

    impl Prober for Echo {
        fn send(&mut self, sequence: u16) -> std::io::Result<()> {
            self.pending.push_back(sequence);
            Ok(())
        }

        fn recv(&mut self, timeout: Duration) -> std::io::Result<Option<EchoReply>> {
            match self.pending.pop_front() {
                Some(sequence) => Ok(Some(EchoReply { sequence, rtt: self.rtt })),
                None => {
                    std::thread::sleep(timeout);
                    Ok(None)
                }
            }
        }
    }

    #[test]
    fn connectivity_ok() {
        let config = MonitorConfig::new(Duration::from_millis(100), "192.0.2.1", 10_000, "eth0");
        let tc: Arc<dyn TrafficControl> = Arc::new(MemoryTc::new());
        let echo = Echo { rtt: Duration::from_millis(12), pending: VecDeque::new() };
        let mut monitor = Monitor::new(Controller::new(config), echo, tc);

        assert!(monitor.check_connectivity());
        assert_eq!(monitor.controller().link().raw_ping_us, Some(12_000));
    }

    #[test]
    fn stale_replies_are_ignored() {
        let config = MonitorConfig::new(Duration::from_millis(100), "192.0.2.1", 10_000, "eth0");
        let tc: Arc<dyn TrafficControl> = Arc::new(MemoryTc::new());
        let echo = Echo { rtt: Duration::from_millis(12), pending: VecDeque::from([40]) };
        let mut monitor = Monitor::new(Controller::new(config), echo, tc);

        monitor.send_probe();
        monitor.receive(Duration::from_millis(1));
        assert_eq!(monitor.outstanding, Some(1));
        monitor.receive(Duration::from_millis(1));
        assert_eq!(monitor.outstanding, None);
        assert_eq!(monitor.controller().link().raw_ping_us, Some(12_000));
    }

    #[test]
    fn flags_are_one_shot() {
        let flags = ControlFlags::default();
        flags.reset();
        assert!(flags.take_reset());
        assert!(!flags.take_reset());
        assert!(!flags.terminated());
        flags.terminate();
        assert!(flags.terminated());
    }
}
