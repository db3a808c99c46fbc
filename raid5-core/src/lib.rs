// vim: tw=80

pub mod bio;
pub mod cache;
pub mod codec;
pub mod disk;
pub mod layout;
pub mod stripe;
pub mod types;
pub mod util;
pub mod volume;
pub mod xor;

pub use crate::types::*;
pub use crate::util::*;
