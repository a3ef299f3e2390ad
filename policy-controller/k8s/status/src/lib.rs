//! Writes the outcome of each reconciliation back to the status of the
//! `TrafficPolicy` resources that produced it.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod controller;
mod results;

pub use self::{
    controller::{make_patch, Controller, ControllerMetrics, Update},
    results::Results,
};
