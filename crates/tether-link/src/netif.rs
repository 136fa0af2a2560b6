use auto_impl::auto_impl;

use crate::error::LinkError;

/// Network-layer collaborator for the client endpoint.
///
/// The engine only needs to ask for the link, check it, and drop it during
/// an outage hold. Platform specifics (credentials, radios, drivers) live
/// behind this seam.
#[auto_impl(&mut, Box)]
pub trait NetworkInterface {
    /// Kick off an attempt to (re)acquire the network link. Returns false if
    /// the attempt could not even be started.
    fn bring_up(&mut self) -> bool;

    fn is_connected(&self) -> bool;

    /// Drop the link at the start of an outage hold so reacquisition starts
    /// clean. Returns true if the link was actually dropped and must be
    /// reacquired before reconnecting.
    fn drop_link(&mut self) -> bool {
        false
    }
}

/// Wired/host networking: the link is always present.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysUp;

impl NetworkInterface for AlwaysUp {
    fn bring_up(&mut self) -> bool {
        true
    }

    fn is_connected(&self) -> bool {
        true
    }
}

/// Strategy invoked when the very first network or server acquisition fails.
///
/// Returning `Ok(())` tells the supervisor to keep retrying as if the
/// failure had happened after a successful connect.
pub trait Recovery {
    fn bad_network(&mut self) -> Result<(), LinkError> {
        Err(LinkError::NoInitialNetwork)
    }

    fn bad_server(&mut self) -> Result<(), LinkError> {
        Err(LinkError::NoInitialServer)
    }
}

/// Default recovery: a failure on the very first attempt is fatal, anything
/// later is absorbed by reconnection.
#[derive(Clone, Copy, Debug, Default)]
pub struct FatalOnFirstAttempt;

impl Recovery for FatalOnFirstAttempt {}
