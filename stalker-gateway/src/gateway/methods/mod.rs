pub mod status;
pub mod wallets;

pub use status::*;
pub use wallets::*;
