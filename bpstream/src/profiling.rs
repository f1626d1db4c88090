use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timer {
    pub total: Duration,
    pub calls: u64,
}

/// Named timers and byte counters. An inactive profiler records nothing.
#[derive(Debug, Clone, Default)]
pub struct Profiler {
    active: bool,
    timers: BTreeMap<&'static str, Timer>,
    running: BTreeMap<&'static str, Instant>,
    bytes: BTreeMap<&'static str, u64>,
}

impl Profiler {
    pub fn new(active: bool) -> Self {
        Profiler {
            active,
            ..Profiler::default()
        }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn start(&mut self, name: &'static str) {
        if self.active {
            self.running.insert(name, Instant::now());
        }
    }

    pub fn stop(&mut self, name: &'static str) {
        if !self.active {
            return;
        }
        if let Some(started) = self.running.remove(name) {
            let timer = self.timers.entry(name).or_default();
            timer.total += started.elapsed();
            timer.calls += 1;
        }
    }

    pub fn add_bytes(&mut self, name: &'static str, bytes: u64) {
        if self.active {
            *self.bytes.entry(name).or_default() += bytes;
        }
    }

    pub fn timer(&self, name: &str) -> Option<Timer> {
        self.timers.get(name).copied()
    }

    pub fn bytes(&self, name: &str) -> u64 {
        self.bytes.get(name).copied().unwrap_or(0)
    }

    /// `{"<timer>_us": .., "<timer>_calls": .., "<counter>_bytes": ..}`
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for (name, timer) in &self.timers {
            map.insert(format!("{}_us", name), json!(timer.total.as_micros() as u64));
            map.insert(format!("{}_calls", name), json!(timer.calls));
        }
        for (name, bytes) in &self.bytes {
            map.insert(format!("{}_bytes", name), json!(bytes));
        }
        Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inactive_records_nothing() {
        let mut p = Profiler::new(false);
        p.start("write");
        p.stop("write");
        p.add_bytes("write", 10);
        assert_eq!(p.timer("write"), None);
        assert_eq!(p.bytes("write"), 0);
        assert_eq!(p.to_json(), json!({}));
    }

    #[test]
    fn active_accumulates() {
        let mut p = Profiler::new(true);
        for _ in 0..3 {
            p.start("write");
            p.stop("write");
        }
        p.stop("close");
        p.add_bytes("write", 10);
        p.add_bytes("write", 5);
        assert_eq!(p.timer("write").unwrap().calls, 3);
        assert_eq!(p.timer("close"), None);
        assert_eq!(p.bytes("write"), 15);
        assert_eq!(p.to_json()["write_calls"], json!(3));
        assert_eq!(p.to_json()["write_bytes"], json!(15));
    }
}
