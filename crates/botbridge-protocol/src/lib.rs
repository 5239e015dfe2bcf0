mod bot;
mod client;
mod error;

pub use bot::*;
pub use client::*;
pub use error::*;
