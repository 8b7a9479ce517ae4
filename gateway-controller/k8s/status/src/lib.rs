//! Gateway Controller status writer
//!
//! Translation reports describe what went wrong while building each gateway.
//! The [`Controller`] turns them into `status` subresources on the Gateways,
//! routes and policies they describe, writing only while this replica holds
//! the write lease.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod controller;
mod status;


pub use self::{
    controller::{merge_reports, Controller, ControllerMetrics},
    status::{
        eq_time_insensitive_conditions, eq_time_insensitive_gateway_status,
        eq_time_insensitive_policy_status, eq_time_insensitive_route_status, gateway_status,
        policy_status, route_status,
    },
};
