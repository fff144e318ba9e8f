//! Command handlers for the devstrap binary.

pub(crate) mod logging;
pub(crate) mod plugin;
pub(crate) mod status;
