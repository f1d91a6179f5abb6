#[macro_use]
extern crate tracing;

pub mod annotations;
pub mod controller;
pub mod dns;
pub mod entry;
pub mod k8s;
pub mod metrics;
pub mod normalize;
pub mod watch;
