//! CLI command implementations.
//!
//! | Module    | Commands handled |
//! |-----------|------------------|
//! | `serve`   | `Serve`          |
//! | `init`    | `Init`           |
//! | `status`  | `Status`         |

pub mod init;
pub mod serve;
pub mod status;

pub use init::cmd_init;
pub use serve::cmd_serve;
pub use status::cmd_status;
