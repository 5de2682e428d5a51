mod common;
mod kinds;

pub use self::common::{Bounds, Common, DEFAULT_VERSION, Record};
pub use self::kinds::*;
