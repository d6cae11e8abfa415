pub mod browser;
pub mod publisher;
pub mod transport;
pub mod txt;

pub use browser::*;
pub use publisher::*;
pub use transport::*;
pub use txt::*;
