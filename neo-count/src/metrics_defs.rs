//! Metrics definitions for the count service.

use shared::metrics_defs::{MetricDef, MetricType};

pub const LOOKUPS: MetricDef = MetricDef {
    name: "catalog.lookups",
    metric_type: MetricType::Counter,
    description: "Per-date catalog lookups. Tagged with outcome (success, failure, cancelled).",
};

pub const AGGREGATE_DURATION: MetricDef = MetricDef {
    name: "aggregate.duration",
    metric_type: MetricType::Histogram,
    description: "Time to fan out and sum one read request, in seconds",
};

pub const AGGREGATE_DATES: MetricDef = MetricDef {
    name: "aggregate.dates",
    metric_type: MetricType::Histogram,
    description: "Number of dates requested by one read request",
};

pub const UPSERT_ROWS: MetricDef = MetricDef {
    name: "store.upsert.rows",
    metric_type: MetricType::Counter,
    description: "Rows written to the count store. Tagged with outcome (success, failure).",
};

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "request.duration",
    metric_type: MetricType::Histogram,
    description: "Request duration in seconds. Tagged with method, status.",
};

pub const REQUESTS_INFLIGHT: MetricDef = MetricDef {
    name: "requests.inflight",
    metric_type: MetricType::Gauge,
    description: "Number of requests currently being processed",
};

pub const ALL_METRICS: &[MetricDef] = &[
    LOOKUPS,
    AGGREGATE_DURATION,
    AGGREGATE_DATES,
    UPSERT_ROWS,
    REQUEST_DURATION,
    REQUESTS_INFLIGHT,
];
