mod extensions;
mod sync;

pub use extensions::*;
pub use sync::*;
