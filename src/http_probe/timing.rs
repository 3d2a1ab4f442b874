use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::result::PhaseTiming;

/// Network lifecycle milestones recorded during one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Milestone {
    DnsStart,
    DnsDone,
    ConnectStart,
    ConnectDone,
    TlsStart,
    TlsDone,
    ConnAcquired,
    HeadersWritten,
    FirstByte,
}

#[derive(Debug, Default, Clone, Copy)]
struct Marks {
    dns_start: Option<Instant>,
    dns_done: Option<Instant>,
    connect_start: Option<Instant>,
    connect_done: Option<Instant>,
    tls_start: Option<Instant>,
    tls_done: Option<Instant>,
    conn_acquired: Option<Instant>,
    headers_written: Option<Instant>,
    first_byte: Option<Instant>,
}

impl Marks {
    fn slot(&mut self, milestone: Milestone) -> &mut Option<Instant> {
        match milestone {
            Milestone::DnsStart => &mut self.dns_start,
            Milestone::DnsDone => &mut self.dns_done,
            Milestone::ConnectStart => &mut self.connect_start,
            Milestone::ConnectDone => &mut self.connect_done,
            Milestone::TlsStart => &mut self.tls_start,
            Milestone::TlsDone => &mut self.tls_done,
            Milestone::ConnAcquired => &mut self.conn_acquired,
            Milestone::HeadersWritten => &mut self.headers_written,
            Milestone::FirstByte => &mut self.first_byte,
        }
    }
}

/// Collects milestone timestamps for a single probe attempt.
///
/// Clones share the same marks, so the transport and the stream wrapper can
/// both record into it while the engine reads the outcome.
#[derive(Debug, Clone, Default)]
pub struct PhaseTimer {
    marks: Arc<Mutex<Marks>>,
}

/// Phase durations plus the total time of the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingReport {
    pub phases: PhaseTiming,
    pub total: Duration,
}

fn between(start: Option<Instant>, end: Option<Instant>) -> Option<Duration> {
    Some(truncate(end?.saturating_duration_since(start?)))
}

fn truncate(d: Duration) -> Duration {
    Duration::from_millis(d.as_millis() as u64)
}

impl PhaseTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, milestone: Milestone) {
        self.mark_at(milestone, Instant::now());
    }

    pub fn mark_at(&self, milestone: Milestone, at: Instant) {
        *self.marks.lock().slot(milestone) = Some(at);
    }

    /// Forget everything recorded so far; used at the start of each redirect hop.
    pub fn reset(&self) {
        *self.marks.lock() = Marks::default();
    }

    /// A write to the connection completed. The last write before the first
    /// response byte marks the point the request was fully written.
    pub(crate) fn wrote(&self) {
        let mut marks = self.marks.lock();
        if marks.conn_acquired.is_some() && marks.first_byte.is_none() {
            marks.headers_written = Some(Instant::now());
        }
    }

    /// A non-empty read from the connection completed.
    pub(crate) fn read(&self) {
        let mut marks = self.marks.lock();
        if marks.headers_written.is_some() && marks.first_byte.is_none() {
            marks.first_byte = Some(Instant::now());
        }
    }

    /// Derive the phase durations, given the instant the body finished reading.
    pub fn finish(&self, body_done: Instant) -> TimingReport {
        let m = *self.marks.lock();

        // A literal address target never resolves; DNS then takes no time at all.
        let dns = match (m.dns_start, m.dns_done) {
            (Some(_), Some(_)) => between(m.dns_start, m.dns_done),
            (None, None) if m.connect_start.is_some() => Some(Duration::ZERO),
            _ => None,
        };

        let phases = PhaseTiming {
            dns,
            connecting: between(m.connect_start, m.connect_done),
            tls: between(m.tls_start, m.tls_done),
            sending: between(m.conn_acquired, m.headers_written),
            waiting: between(m.headers_written, m.first_byte),
            receiving: between(m.first_byte, Some(body_done)),
        };

        let baseline = m.dns_done.or(m.connect_start).or(m.conn_acquired);
        let total = between(baseline, Some(body_done)).unwrap_or_default();

        TimingReport { phases, total }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_full_exchange_phases() {
        let t0 = Instant::now();
        let timer = PhaseTimer::new();
        timer.mark_at(Milestone::DnsStart, t0);
        timer.mark_at(Milestone::DnsDone, t0 + ms(10));
        timer.mark_at(Milestone::ConnectStart, t0 + ms(10));
        timer.mark_at(Milestone::ConnectDone, t0 + ms(30));
        timer.mark_at(Milestone::TlsStart, t0 + ms(30));
        timer.mark_at(Milestone::TlsDone, t0 + ms(70));
        timer.mark_at(Milestone::ConnAcquired, t0 + ms(70));
        timer.mark_at(Milestone::HeadersWritten, t0 + ms(71));
        timer.mark_at(Milestone::FirstByte, t0 + ms(171));

        let report = timer.finish(t0 + ms(200));
        assert_eq!(report.phases.dns, Some(ms(10)));
        assert_eq!(report.phases.connecting, Some(ms(20)));
        assert_eq!(report.phases.tls, Some(ms(40)));
        assert_eq!(report.phases.sending, Some(ms(1)));
        assert_eq!(report.phases.waiting, Some(ms(100)));
        assert_eq!(report.phases.receiving, Some(ms(29)));
        assert_eq!(report.total, ms(190));
    }

    #[test]
    fn test_literal_address_reports_zero_dns() {
        let t0 = Instant::now();
        let timer = PhaseTimer::new();
        timer.mark_at(Milestone::ConnectStart, t0);
        timer.mark_at(Milestone::ConnectDone, t0 + ms(5));
        timer.mark_at(Milestone::ConnAcquired, t0 + ms(5));

        let report = timer.finish(t0 + ms(50));
        assert_eq!(report.phases.dns, Some(Duration::ZERO));
        assert_eq!(report.phases.tls, None);
        assert_eq!(report.total, ms(50));
    }

    #[test]
    fn test_reused_connection_has_no_connection_phases() {
        let t0 = Instant::now();
        let timer = PhaseTimer::new();
        timer.mark_at(Milestone::ConnAcquired, t0);
        timer.mark_at(Milestone::HeadersWritten, t0 + ms(2));

        let report = timer.finish(t0 + ms(20));
        assert_eq!(report.phases.dns, None);
        assert_eq!(report.phases.connecting, None);
        assert_eq!(report.phases.tls, None);
        assert_eq!(report.phases.sending, Some(ms(2)));
        assert_eq!(report.phases.waiting, None);
        assert_eq!(report.phases.receiving, None);
        assert_eq!(report.total, ms(20));
    }

    #[test]
    fn test_durations_truncate_to_milliseconds() {
        let t0 = Instant::now();
        let timer = PhaseTimer::new();
        timer.mark_at(Milestone::ConnectStart, t0);
        timer.mark_at(Milestone::ConnectDone, t0 + Duration::from_micros(2_999));
        let report = timer.finish(t0 + ms(3));
        assert_eq!(report.phases.connecting, Some(ms(2)));
    }

    #[test]
    fn test_reset_discards_previous_hop() {
        let timer = PhaseTimer::new();
        timer.mark(Milestone::TlsStart);
        timer.mark(Milestone::TlsDone);
        timer.reset();
        assert_eq!(timer.finish(Instant::now()).phases.tls, None);
    }

    #[test]
    fn test_stream_events_require_an_acquired_connection() {
        let timer = PhaseTimer::new();
        timer.wrote();
        timer.read();
        let report = timer.finish(Instant::now());
        assert_eq!(report.phases.sending, None);
        assert_eq!(report.phases.waiting, None);

        timer.mark(Milestone::ConnAcquired);
        timer.wrote();
        timer.read();
        let report = timer.finish(Instant::now());
        assert!(report.phases.sending.is_some());
        assert!(report.phases.waiting.is_some());
    }
}
