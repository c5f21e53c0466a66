pub mod aes128;
pub mod validate;

pub use aes128::AesCtx;
pub use validate::Validation;
