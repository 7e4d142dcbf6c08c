//! Built-in session supplements
//!
//! - [`caller_id`]: caller identity from and to identity headers
//! - [`header_funcs`]: application access to INVITE headers

pub mod caller_id;
pub mod header_funcs;

pub use caller_id::CallerIdSupplement;
pub use header_funcs::{HeaderAction, HeaderFuncsSupplement};
