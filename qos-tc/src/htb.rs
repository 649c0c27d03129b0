//! `tc(8)` backed implementation of [`TrafficControl`].

use std::{collections::HashMap, process::Command, time::Instant};

use parking_lot::Mutex;

use crate::{
    command::Runner, parse_class_show, ClassStats, ClassTarget, Error, RateMeter, Result,
    TrafficControl,
};

/// HTB cannot usefully shape below this rate; smaller requests are raised to it.
pub const MIN_RATE_KBPS: u64 = 8;

/// How a rate change is submitted to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyVerb {
    /// `tc class change`, modifies an existing class in place.
    Change,
    /// `tc class replace`, creates the class if it is missing.
    Replace,
}

impl ApplyVerb {
    const fn as_str(&self) -> &'static str {
        match self {
            Self::Change => "change",
            Self::Replace => "replace",
        }
    }
}

/// Builds `tc class <verb> dev <if> [parent <p>] classid <c> htb rate <R>kbit ceil <R>kbit`.
#[derive(Debug, Clone)]
pub struct ClassRateRequest<'a> {
    program: &'a str,
    target: &'a ClassTarget,
    kbps: u64,
    verb: ApplyVerb,
}

impl<'a> ClassRateRequest<'a> {
    pub fn new(target: &'a ClassTarget, kbps: u64) -> Self {
        Self { program: "tc", target, kbps, verb: ApplyVerb::Change }
    }

    pub fn program(mut self, program: &'a str) -> Self {
        self.program = program;
        self
    }

    pub fn verb(mut self, verb: ApplyVerb) -> Self {
        self.verb = verb;
        self
    }

    pub fn build(&self) -> Command {
        let mut cmd = Command::new(self.program);
        cmd.arg("class").arg(self.verb.as_str()).arg("dev").arg(&self.target.interface);

        if let Some(parent) = self.target.parent {
            cmd.arg("parent").arg(parent.to_string());
        }

        let rate = format!("{}kbit", self.kbps);
        cmd.arg("classid")
            .arg(self.target.classid.to_string())
            .arg("htb")
            .arg("rate")
            .arg(&rate)
            .arg("ceil")
            .arg(&rate);

        cmd
    }
}

/// Builds `tc -s class show dev <if> classid <c>`.
#[derive(Debug, Clone)]
pub struct ClassShowRequest<'a> {
    program: &'a str,
    target: &'a ClassTarget,
}

impl<'a> ClassShowRequest<'a> {
    pub fn new(target: &'a ClassTarget) -> Self {
        Self { program: "tc", target }
    }

    pub fn program(mut self, program: &'a str) -> Self {
        self.program = program;
        self
    }

    pub fn build(&self) -> Command {
        let mut cmd = Command::new(self.program);
        cmd.arg("-s")
            .arg("class")
            .arg("show")
            .arg("dev")
            .arg(&self.target.interface)
            .arg("classid")
            .arg(self.target.classid.to_string());
        cmd
    }
}

/// Drives HTB classes through the `tc` binary.
///
/// Remembers the last rate it applied per class so repeated writes of the same value do not
/// spawn a process, and keeps a [`RateMeter`] per class for usage reads.
#[derive(Debug)]
pub struct TcCli {
    program: String,
    applied: Mutex<HashMap<ClassTarget, u64>>,
    meter: Mutex<RateMeter<ClassTarget>>,
}

impl Default for TcCli {
    fn default() -> Self {
        Self::new()
    }
}

impl TcCli {
    pub fn new() -> Self {
        Self::with_program("tc")
    }

    /// Uses a different `tc` binary, e.g. a full path or a wrapper script.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            applied: Mutex::new(HashMap::new()),
            meter: Mutex::new(RateMeter::default()),
        }
    }

    /// Forgets the cached last-applied rate for `target`, forcing the next write through.
    pub fn invalidate(&self, target: &ClassTarget) {
        self.applied.lock().remove(target);
    }

    pub fn show(&self, target: &ClassTarget) -> Result<ClassStats> {
        let output = Runner::run(ClassShowRequest::new(target).program(&self.program).build())?;
        if output.stdout.trim().is_empty() {
            return Err(Error::UnknownClass(target.clone()));
        }
        parse_class_show(&output.stdout)
    }
}

impl TrafficControl for TcCli {
    fn apply_rate(&self, target: &ClassTarget, kbps: u64) -> Result<()> {
        let kbps = kbps.max(MIN_RATE_KBPS);

        if self.applied.lock().get(target) == Some(&kbps) {
            tracing::trace!(%target, kbps, "rate unchanged, skipping");
            return Ok(());
        }

        let request = ClassRateRequest::new(target, kbps).program(&self.program);

        if let Err(e) = Runner::run(request.build()) {
            tracing::warn!(%target, kbps, error = %e, "tc class change failed, trying replace");

            if let Err(source) = Runner::run(request.verb(ApplyVerb::Replace).build()) {
                self.invalidate(target);
                return Err(Error::Apply { target: target.clone(), kbps, source });
            }
        }

        tracing::debug!(%target, kbps, "rate applied");
        self.applied.lock().insert(target.clone(), kbps);
        Ok(())
    }

    fn read_used_kbps(&self, target: &ClassTarget) -> Result<u64> {
        let stats = self.show(target)?;
        Ok(self.meter.lock().sample(target.clone(), stats.sent_bytes, Instant::now()))
    }

    fn read_current_kbps(&self, target: &ClassTarget) -> Result<u64> {
        Ok(self.show(target)?.rate_kbps)
    }
}
