//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `serve`  | `Serve`          |
//! | `client` | `Client`         |
//! | `check`  | `Check`          |

pub mod check;
pub mod client;
pub mod serve;

pub use check::cmd_check;
pub use client::cmd_client;
pub use serve::cmd_serve;
