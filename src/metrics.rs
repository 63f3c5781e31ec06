//! Server metrics.

use metriken::{Counter, Gauge, metric};

#[metric(
    name = "grpc_sessions_accepted",
    description = "Total number of HTTP/2 sessions accepted"
)]
pub static SESSIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "grpc_sessions_active",
    description = "Number of currently live HTTP/2 sessions"
)]
pub static SESSIONS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "grpc_calls_dispatched",
    description = "Total number of streams dispatched to handlers"
)]
pub static CALLS_DISPATCHED: Counter = Counter::new();

#[metric(
    name = "grpc_calls_failed",
    description = "Total number of calls that terminated with a non-OK status"
)]
pub static CALLS_FAILED: Counter = Counter::new();

#[metric(
    name = "grpc_keepalive_timeouts",
    description = "Total number of sessions destroyed by keepalive ping timeout"
)]
pub static KEEPALIVE_TIMEOUTS: Counter = Counter::new();
