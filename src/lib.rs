pub mod config;
pub mod conn;
pub mod error;
pub mod fcall;
pub mod fid;
pub mod handlers;
pub mod server;
pub mod tree;
pub mod users;

pub use config::{Config, Network};
pub use error::{Result, VufsError};
pub use server::{Server, VuFs};
pub use users::UserDb;
