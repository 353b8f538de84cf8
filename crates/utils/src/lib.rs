pub mod address;
pub mod auth;
pub mod config;
pub mod handler;
pub mod message;
pub mod mime;
pub mod session;
pub mod tls;
pub mod upstream;

pub use address::*;
pub use auth::*;
pub use config::*;
pub use handler::*;
pub use message::*;
pub use mime::*;
pub use session::*;
pub use tls::*;
pub use upstream::*;
