pub mod accounts;
pub mod token;

pub use token::{Claims, TokenSigner};
