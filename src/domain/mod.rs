pub mod outcome;
pub mod price;
pub mod target;

pub use outcome::*;
pub use price::*;
pub use target::*;
