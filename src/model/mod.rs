//! Plain data types shared by every layer of the launcher.

pub mod service;
pub mod status;
pub mod users;

pub use service::*;
pub use status::*;
pub use users::*;
