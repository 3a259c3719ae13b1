pub mod audit;
pub mod circuit;
pub mod proxy;

pub use audit::*;
pub use circuit::*;
pub use proxy::*;
