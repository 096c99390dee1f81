#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

pub mod encoding;
pub mod error;
pub mod raft;
pub mod storage;

pub use error::{Error, Result};
