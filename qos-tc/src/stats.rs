use std::{collections::HashMap, hash::Hash, time::Instant};

use qos_common::parse_bandwidth_kbps;

use crate::{Error, Result};

/// What `tc -s class show` reports for a single class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassStats {
    /// Configured `rate`, in kbit/s.
    pub rate_kbps: u64,
    /// Configured `ceil`, in kbit/s, if printed.
    pub ceil_kbps: Option<u64>,
    /// Cumulative `Sent N bytes` counter.
    pub sent_bytes: u64,
}

/// Parses the output of `tc -s class show dev <if> classid <id>`.
///
/// ```text
/// class htb 1:10 parent 1:1 prio 0 rate 500Kbit ceil 500Kbit burst 1600b cburst 1600b
///  Sent 123456 bytes 789 pkt (dropped 0, overlimits 0 requeues 0)
///  rate 12Kbit 3pps backlog 0b 0p requeues 0
/// ```
///
/// Only the first `rate` token is the configured rate; the one on the statistics line is the
/// kernel's own estimator and is ignored.
pub fn parse_class_show(output: &str) -> Result<ClassStats> {
    let mut tokens = output.split_whitespace();
    let mut rate = None;
    let mut ceil = None;
    let mut sent = None;

    while let Some(token) = tokens.next() {
        match token {
            "rate" if rate.is_none() => rate = tokens.next().map(parse_rate).transpose()?,
            "ceil" if ceil.is_none() => ceil = tokens.next().map(parse_rate).transpose()?,
            "Sent" if sent.is_none() => {
                let value = tokens.next().ok_or_else(|| Error::Parse(output.to_string()))?;
                sent = Some(value.parse().map_err(|_| Error::Parse(value.to_string()))?);
            }
            _ => {}
        }
    }

    let rate_kbps = rate.ok_or_else(|| Error::Parse(format!("no rate in {output:?}")))?;
    Ok(ClassStats { rate_kbps, ceil_kbps: ceil, sent_bytes: sent.unwrap_or_default() })
}

fn parse_rate(token: &str) -> Result<u64> {
    parse_bandwidth_kbps(token).map_err(|_| Error::Parse(token.to_string()))
}

#[derive(Debug, Clone, Copy)]
struct Baseline {
    bytes: u64,
    at: Instant,
    last_kbps: u64,
}

/// Turns cumulative byte counters into kbit/s by differencing successive reads.
///
/// The first read of a key, and any read where the counter went backwards (class recreated,
/// counters reset), re-baselines and yields 0.
#[derive(Debug)]
pub struct RateMeter<K> {
    baselines: HashMap<K, Baseline>,
}

impl<K> Default for RateMeter<K> {
    fn default() -> Self {
        Self { baselines: HashMap::new() }
    }
}

impl<K: Eq + Hash> RateMeter<K> {
    pub fn sample(&mut self, key: K, bytes: u64, now: Instant) -> u64 {
        let Some(prev) = self.baselines.get_mut(&key) else {
            self.baselines.insert(key, Baseline { bytes, at: now, last_kbps: 0 });
            return 0;
        };

        if bytes < prev.bytes {
            tracing::debug!(prev = prev.bytes, bytes, "byte counter reset");
            *prev = Baseline { bytes, at: now, last_kbps: 0 };
            return 0;
        }

        let elapsed = now.saturating_duration_since(prev.at).as_secs_f64();
        if elapsed <= 0.0 {
            return prev.last_kbps;
        }

        let kbps = ((bytes - prev.bytes) as f64 * 8.0 / 1000.0 / elapsed).round() as u64;
        *prev = Baseline { bytes, at: now, last_kbps: kbps };
        kbps
    }

    pub fn forget(&mut self, key: &K) {
        self.baselines.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    const SHOW: &str = "class htb 1:10 parent 1:1 prio 0 rate 500Kbit ceil 500Kbit burst 1600b cburst 1600b \n Sent 123456 bytes 789 pkt (dropped 0, overlimits 0 requeues 0) \n rate 12Kbit 3pps backlog 0b 0p requeues 0\n lended: 10 borrowed: 0 giants: 0\n";

    #[test]
    fn parses_htb_class() {
        let stats = parse_class_show(SHOW).unwrap();
        assert_eq!(stats.rate_kbps, 500);
        assert_eq!(stats.ceil_kbps, Some(500));
        assert_eq!(stats.sent_bytes, 123_456);
    }

    #[test]
    fn parses_units() {
        let stats = parse_class_show("class htb 1:1 root rate 20Mbit ceil 1Gbit\n Sent 0 bytes 0 pkt").unwrap();
        assert_eq!(stats.rate_kbps, 20_000);
        assert_eq!(stats.ceil_kbps, Some(1_000_000));

        let stats = parse_class_show("class htb 1:1 root rate 8000bit").unwrap();
        assert_eq!(stats.rate_kbps, 8);
        assert_eq!(stats.sent_bytes, 0);
    }

    #[test]
    fn empty_output_is_an_error() {
        assert!(parse_class_show("").is_err());
        assert!(parse_class_show("class htb 1:10 rate fast").is_err());
    }

    #[test]
    fn meter_differencing() {
        let mut meter = RateMeter::default();
        let t0 = Instant::now();

        assert_eq!(meter.sample("1:10", 1_000, t0), 0);
        // 125_000 bytes in one second is 1000 kbit/s
        assert_eq!(meter.sample("1:10", 126_000, t0 + Duration::from_secs(1)), 1_000);
        assert_eq!(meter.sample("1:10", 126_000, t0 + Duration::from_secs(1)), 1_000);
        assert_eq!(meter.sample("1:10", 126_000, t0 + Duration::from_secs(2)), 0);
    }

    #[test]
    fn meter_counter_reset() {
        let mut meter = RateMeter::default();
        let t0 = Instant::now();

        meter.sample("1:20", 50_000, t0);
        assert_eq!(meter.sample("1:20", 10, t0 + Duration::from_secs(1)), 0);
        assert_eq!(meter.sample("1:20", 12_510, t0 + Duration::from_secs(2)), 100);
    }
}
