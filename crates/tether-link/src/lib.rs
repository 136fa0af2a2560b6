mod client;
mod error;
mod hub;
mod netif;
mod stream;
mod timing;

pub use client::{Client, ClientConfig};
pub use error::LinkError;
pub use hub::{Connection, Hub, HubConfig};
pub use netif::{AlwaysUp, FatalOnFirstAttempt, NetworkInterface, Recovery};
pub use timing::{Deadline, Repeater};
