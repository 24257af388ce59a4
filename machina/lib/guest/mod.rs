//! Guest control-channel client.

mod channel;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use channel::*;
