pub mod client;

pub use client::{AccessToken, GatewayClient, Summarizer};
