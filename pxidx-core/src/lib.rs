#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![forbid(unsafe_code)]

pub mod caches;
pub mod entities;
pub mod events;
pub mod framework;
pub mod handlers;
pub mod mutation;
pub mod processors;
pub mod store;
pub mod utils;
