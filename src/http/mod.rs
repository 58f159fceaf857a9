//! Component I (HTTP codec) and J (HTTP connection buffer).

pub mod codec;
pub mod conn;

pub use codec::{BodyFraming, HeaderTable, Method, Request, Response, Version};
pub use conn::HttpConn;
