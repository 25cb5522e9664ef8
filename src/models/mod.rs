pub mod deployment;
pub mod filter;
pub mod package;

pub use deployment::*;
pub use filter::Filter;
pub use package::*;
