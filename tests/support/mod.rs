#![allow(dead_code)]

mod harness;
mod http_utils;
mod upstream;

pub use harness::*;
pub use http_utils::*;
pub use upstream::*;
