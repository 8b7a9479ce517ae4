#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod client;
pub mod collection;
pub mod errors;
pub mod hash;
pub mod http_route;
pub mod ir;
pub mod labels;
pub mod reports;

pub use self::{
    client::UniqueClient,
    collection::{Collection, Equals, HandlerContext, Index, Keyed},
};

/// The controller name written to route and policy statuses.
pub const DEFAULT_CONTROLLER_NAME: &str = "gateway.dev/gateway-controller";

/// The default gateway class served by this controller.
pub const DEFAULT_GATEWAY_CLASS: &str = "gateway";
