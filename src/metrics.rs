//! In-process counters exposed on the admin `/metrics` endpoint in the
//! Prometheus text format.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::filter::Phase;

/// Latency histogram bucket upper bounds in milliseconds.
const BUCKETS_MS: [u64; 11] = [1, 2, 5, 10, 20, 50, 100, 200, 500, 1000, 2000];

const PHASES: [Phase; 6] = [
    Phase::RequestHeaders,
    Phase::RequestBody,
    Phase::RequestTrailers,
    Phase::ResponseHeaders,
    Phase::ResponseBody,
    Phase::ResponseTrailers,
];

#[derive(Debug)]
struct Histogram {
    counts: Vec<AtomicU64>,
    sum_ms: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            counts: BUCKETS_MS.iter().map(|_| AtomicU64::new(0)).collect(),
            sum_ms: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    fn observe(&self, ms: u64) {
        if let Some(idx) = BUCKETS_MS.iter().position(|ub| ms <= *ub) {
            self.counts[idx].fetch_add(1, Ordering::Relaxed);
        }
        self.sum_ms.fetch_add(ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn render(&self, buf: &mut String, family: &str, labels: &str) {
        let sep = if labels.is_empty() { "" } else { "," };
        let mut cumulative = 0;
        for (i, ub) in BUCKETS_MS.iter().enumerate() {
            cumulative += self.counts[i].load(Ordering::Relaxed);
            writeln!(buf, "{family}_bucket{{{labels}{sep}le=\"{ub}\"}} {cumulative}").ok();
        }
        let count = self.count.load(Ordering::Relaxed);
        writeln!(buf, "{family}_bucket{{{labels}{sep}le=\"+Inf\"}} {count}").ok();
        let sum = self.sum_ms.load(Ordering::Relaxed);
        if labels.is_empty() {
            writeln!(buf, "{family}_sum {sum}").ok();
            writeln!(buf, "{family}_count {count}").ok();
        } else {
            writeln!(buf, "{family}_sum{{{labels}}} {sum}").ok();
            writeln!(buf, "{family}_count{{{labels}}} {count}").ok();
        }
    }
}

/// Counters for one registered filter.
#[derive(Debug)]
pub struct FilterMetrics {
    name: String,
    invocations: AtomicU64,
    errors: AtomicU64,
    immediate_responses: AtomicU64,
    latency: Histogram,
}

/// How a single filter invocation ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterOutcome {
    Continue,
    ImmediateResponse,
    Error,
}

impl FilterMetrics {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            invocations: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            immediate_responses: AtomicU64::new(0),
            latency: Histogram::new(),
        }
    }

    pub fn observe(&self, elapsed_ms: u64, outcome: FilterOutcome) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        match outcome {
            FilterOutcome::Continue => {}
            FilterOutcome::ImmediateResponse => {
                self.immediate_responses.fetch_add(1, Ordering::Relaxed);
            }
            FilterOutcome::Error => {
                self.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.latency.observe(elapsed_ms);
    }

    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Immediate responses this filter returned, sent or only observed.
    pub fn immediate_responses(&self) -> u64 {
        self.immediate_responses.load(Ordering::Relaxed)
    }
}

/// Process-wide counters of one [`ExtProcessor`](crate::ExtProcessor).
/// Filter entries are index aligned with the filter chain.
#[derive(Debug)]
pub struct ServiceMetrics {
    streams_total: AtomicU64,
    streams_active: AtomicU64,
    streams_failed: AtomicU64,
    immediate_responses_total: AtomicU64,
    messages: [AtomicU64; 6],
    stream_duration: Histogram,
    filters: Vec<FilterMetrics>,
    process_start_epoch: f64,
    process_start: Instant,
}

impl ServiceMetrics {
    pub fn new<S: AsRef<str>>(filter_names: &[S]) -> Self {
        let start = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            streams_total: AtomicU64::new(0),
            streams_active: AtomicU64::new(0),
            streams_failed: AtomicU64::new(0),
            immediate_responses_total: AtomicU64::new(0),
            messages: Default::default(),
            stream_duration: Histogram::new(),
            filters: filter_names
                .iter()
                .map(|n| FilterMetrics::new(n.as_ref()))
                .collect(),
            process_start_epoch: start.as_secs_f64(),
            process_start: Instant::now(),
        }
    }

    pub fn stream_started(&self) {
        self.streams_total.fetch_add(1, Ordering::Relaxed);
        self.streams_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stream_finished(&self, elapsed_ms: u64, failed: bool) {
        self.streams_active.fetch_sub(1, Ordering::Relaxed);
        if failed {
            self.streams_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.stream_duration.observe(elapsed_ms);
    }

    pub fn message_received(&self, phase: Phase) {
        if let Some(idx) = PHASES.iter().position(|p| *p == phase) {
            self.messages[idx].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn immediate_response_sent(&self) {
        self.immediate_responses_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn filter(&self, idx: usize) -> Option<&FilterMetrics> {
        self.filters.get(idx)
    }

    pub fn streams_total(&self) -> u64 {
        self.streams_total.load(Ordering::Relaxed)
    }

    pub fn streams_active(&self) -> u64 {
        self.streams_active.load(Ordering::Relaxed)
    }

    pub fn streams_failed(&self) -> u64 {
        self.streams_failed.load(Ordering::Relaxed)
    }

    pub fn immediate_responses_total(&self) -> u64 {
        self.immediate_responses_total.load(Ordering::Relaxed)
    }

    pub fn messages(&self, phase: Phase) -> u64 {
        PHASES
            .iter()
            .position(|p| *p == phase)
            .map(|idx| self.messages[idx].load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Prometheus text exposition. HELP/TYPE lines appear once per family.
    pub fn render_prometheus(&self) -> String {
        let mut buf = String::new();
        counter(&mut buf, "extproc_streams_total", "Streams accepted", self.streams_total());
        writeln!(
            buf,
            "# HELP extproc_streams_active Streams currently open\n# TYPE extproc_streams_active gauge"
        )
        .ok();
        writeln!(buf, "extproc_streams_active {}", self.streams_active()).ok();
        counter(
            &mut buf,
            "extproc_streams_failed_total",
            "Streams that ended with an error",
            self.streams_failed(),
        );
        counter(
            &mut buf,
            "extproc_immediate_responses_total",
            "Streams short-circuited by an immediate response",
            self.immediate_responses_total(),
        );

        writeln!(
            buf,
            "# HELP extproc_messages_total Inbound messages per phase\n# TYPE extproc_messages_total counter"
        )
        .ok();
        for (idx, phase) in PHASES.iter().enumerate() {
            let n = self.messages[idx].load(Ordering::Relaxed);
            writeln!(buf, "extproc_messages_total{{phase=\"{phase}\"}} {n}").ok();
        }

        writeln!(
            buf,
            "# HELP extproc_stream_duration_ms Stream duration histogram milliseconds\n# TYPE extproc_stream_duration_ms histogram"
        )
        .ok();
        self.stream_duration
            .render(&mut buf, "extproc_stream_duration_ms", "");

        writeln!(
            buf,
            "# HELP extproc_filter_invocations_total Hook invocations per filter\n# TYPE extproc_filter_invocations_total counter"
        )
        .ok();
        writeln!(
            buf,
            "# HELP extproc_filter_errors_total Hook errors per filter\n# TYPE extproc_filter_errors_total counter"
        )
        .ok();
        writeln!(
            buf,
            "# HELP extproc_filter_immediate_responses_total Immediate responses per filter\n# TYPE extproc_filter_immediate_responses_total counter"
        )
        .ok();
        writeln!(
            buf,
            "# HELP extproc_filter_latency_ms Hook latency histogram (ms) per filter\n# TYPE extproc_filter_latency_ms histogram"
        )
        .ok();
        for fm in &self.filters {
            let name = &fm.name;
            writeln!(
                buf,
                "extproc_filter_invocations_total{{filter=\"{name}\"}} {}",
                fm.invocations()
            )
            .ok();
            writeln!(
                buf,
                "extproc_filter_errors_total{{filter=\"{name}\"}} {}",
                fm.errors()
            )
            .ok();
            writeln!(
                buf,
                "extproc_filter_immediate_responses_total{{filter=\"{name}\"}} {}",
                fm.immediate_responses.load(Ordering::Relaxed)
            )
            .ok();
            fm.latency.render(
                &mut buf,
                "extproc_filter_latency_ms",
                &format!("filter=\"{name}\""),
            );
        }

        writeln!(
            buf,
            "# HELP extproc_build_info Build information\n# TYPE extproc_build_info gauge"
        )
        .ok();
        writeln!(
            buf,
            "extproc_build_info{{version=\"{}\"}} 1",
            env!("CARGO_PKG_VERSION")
        )
        .ok();
        writeln!(
            buf,
            "# HELP extproc_process_start_time_seconds Process start time (Unix epoch seconds)\n# TYPE extproc_process_start_time_seconds gauge"
        )
        .ok();
        writeln!(
            buf,
            "extproc_process_start_time_seconds {}",
            self.process_start_epoch
        )
        .ok();
        writeln!(
            buf,
            "# HELP extproc_process_uptime_seconds Process uptime seconds\n# TYPE extproc_process_uptime_seconds gauge"
        )
        .ok();
        writeln!(
            buf,
            "extproc_process_uptime_seconds {}",
            self.process_start.elapsed().as_secs_f64()
        )
        .ok();
        buf
    }
}

fn counter(buf: &mut String, name: &str, help: &str, value: u64) {
    writeln!(buf, "# HELP {name} {help}\n# TYPE {name} counter").ok();
    writeln!(buf, "{name} {value}").ok();
}
