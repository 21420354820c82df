pub mod book;
pub mod types;
pub use types::*;
