//! Root filesystem image assembly.

mod ext4;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use ext4::*;
