#![allow(clippy::uninlined_format_args)]

pub mod capture;
pub mod output;
pub mod protocol;
pub mod reassembly;
pub mod tls;
