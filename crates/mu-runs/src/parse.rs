//! Line classification for run subprocess output.

use regex_lite::Regex;

/// What one output line means to the supervisor.
#[derive(Debug, Clone, PartialEq)]
pub enum LineSignal {
    /// `Root: mu-...` — the orchestrator announced its root issue.
    RootDiscovered(String),
    /// `Step 3/10 ...` or `Done 10/10 ...` — progress marker.
    Progress(String),
    /// `logs: <path>` — a log location hint.
    LogHint(String),
    Plain,
}

pub struct LineMatcher {
    root: Regex,
    progress: Regex,
    logs: Regex,
}

impl Default for LineMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl LineMatcher {
    pub fn new() -> Self {
        Self {
            root: Regex::new(r"(?i)\bRoot:\s*(mu-[a-z0-9-]+)\b").expect("root pattern"),
            progress: Regex::new(r"^(Step|Done)\s+\d+/\d+\s+").expect("progress pattern"),
            logs: Regex::new(r"(?i)\blogs:\s+(\S+)").expect("logs pattern"),
        }
    }

    pub fn classify(&self, line: &str) -> LineSignal {
        if let Some(caps) = self.root.captures(line) {
            if let Some(m) = caps.get(1) {
                return LineSignal::RootDiscovered(m.as_str().to_string());
            }
        }
        if self.progress.is_match(line) {
            return LineSignal::Progress(line.trim_end().to_string());
        }
        if let Some(caps) = self.logs.captures(line) {
            if let Some(m) = caps.get(1) {
                return LineSignal::LogHint(m.as_str().to_string());
            }
        }
        LineSignal::Plain
    }
}

/// Bounded line ring: oldest lines fall off once the cap is reached.
#[derive(Debug)]
pub struct LineRing {
    lines: std::collections::VecDeque<String>,
    cap: usize,
}

impl LineRing {
    /// Caps below 50 are clamped up — a tiny ring makes failures
    /// undiagnosable.
    pub fn new(cap: usize) -> Self {
        Self {
            lines: std::collections::VecDeque::new(),
            cap: cap.max(50),
        }
    }

    pub fn push(&mut self, line: String) {
        if self.lines.len() == self.cap {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_root_line() {
        let m = LineMatcher::new();
        assert_eq!(
            m.classify("orchestrator ready, Root: mu-ab12-cd"),
            LineSignal::RootDiscovered("mu-ab12-cd".to_string())
        );
        assert_eq!(
            m.classify("ROOT: mu-x"),
            LineSignal::RootDiscovered("mu-x".to_string())
        );
    }

    #[test]
    fn classifies_progress_only_at_line_start() {
        let m = LineMatcher::new();
        assert!(matches!(
            m.classify("Step 3/10 expanding plan"),
            LineSignal::Progress(_)
        ));
        assert!(matches!(
            m.classify("Done 10/10 finished"),
            LineSignal::Progress(_)
        ));
        assert_eq!(m.classify("  Step 3/10 indented"), LineSignal::Plain);
        assert_eq!(m.classify("Stepping 3/10"), LineSignal::Plain);
    }

    #[test]
    fn classifies_log_hint() {
        let m = LineMatcher::new();
        assert_eq!(
            m.classify("see logs: /tmp/run-1.log for details"),
            LineSignal::LogHint("/tmp/run-1.log".to_string())
        );
    }

    #[test]
    fn ring_drops_oldest_beyond_cap() {
        let mut ring = LineRing::new(50);
        for i in 0..60 {
            ring.push(format!("line-{i}"));
        }
        assert_eq!(ring.len(), 50);
        let lines = ring.to_vec();
        assert_eq!(lines.first().unwrap(), "line-10");
        assert_eq!(lines.last().unwrap(), "line-59");
    }

    #[test]
    fn ring_clamps_tiny_caps_to_floor() {
        let ring = LineRing::new(1);
        assert_eq!(ring.cap, 50);
    }
}
