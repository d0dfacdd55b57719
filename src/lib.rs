//! pg-muster — a fleet-wide PostgreSQL telemetry collector.
//!
//! Periodically connects to a dynamically discovered set of Postgres
//! backends, executes a curated, version-gated catalog of introspection
//! queries against each, transforms the result rows into counters, gauges,
//! and histograms, and exposes the aggregate as a Prometheus-format scrape
//! endpoint.
//!
//! # Pipeline
//!
//! ```text
//! discovery -> pool -> bootstrap -> poll -> delta -> registry -> exposer
//! ```
//!
//! - [`discovery`] emits `added`/`removed` events as backends join and leave
//!   the fleet.
//! - [`bootstrap`] installs a restricted monitoring role and helper views on
//!   first contact with each backend (as superuser), and resolves the
//!   version-applicable query set from [`catalog`].
//! - [`engine`] runs the periodic tick: bounded fan-out across backends,
//!   sequential per-backend query execution over a single connection from
//!   [`pool`] (built on [`client`]).
//! - [`delta`] turns raw result rows into counter-delta / gauge-set updates
//!   against the prior tick's observation of the same row.
//! - [`registry`] holds the aggregate metric state; [`exposer`] serves it as
//!   Prometheus text format over HTTP.
//!
//! [`backend`] and [`config`] are shared data models; [`error`] is the
//! crate-wide error taxonomy; [`logging`] wires up `tracing`.

pub mod backend;
pub mod bootstrap;
pub mod catalog;
pub mod client;
pub mod config;
pub mod delta;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod exposer;
pub mod logging;
pub mod pool;
pub mod registry;
