#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
// #![warn(clippy::cargo)]

pub mod collate;
pub mod drift;
pub mod error;
pub mod fit;
pub mod math;
pub mod persist;
pub mod run;
pub mod scheme;
pub mod solver;
pub mod weights;

pub use error::Error;

pub type Result<T> = ::std::result::Result<T, Error>;
