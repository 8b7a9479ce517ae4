#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use gateway_controller_core as core;
pub use gateway_controller_k8s_api as k8s;
pub use gateway_controller_k8s_index as index;
pub use gateway_controller_k8s_status as status;
pub use gateway_controller_translator as translator;
pub use gateway_controller_xds as xds;

mod args;
mod lease;

pub use self::args::Args;
