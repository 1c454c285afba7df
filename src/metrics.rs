//! Engine metrics.

use metriken::{Counter, Gauge, metric};

#[metric(
    name = "connections_accepted",
    description = "Total number of connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "connections_active",
    description = "Number of connections currently joined to a registry"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "bytes_received",
    description = "Total bytes consumed by receive handlers"
)]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(
    name = "bytes_sent",
    description = "Total bytes produced by send handlers"
)]
pub static BYTES_SENT: Counter = Counter::new();

#[metric(
    name = "accept_overloads",
    description = "Times an acceptor backed off after file-table exhaustion"
)]
pub static ACCEPT_OVERLOADS: Counter = Counter::new();
