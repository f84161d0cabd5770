//! Process-wide clock and thread identity.

pub(crate) mod clock;
pub(crate) mod thread;
