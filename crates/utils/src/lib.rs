pub mod address;
pub mod config;
pub mod dispatcher;
pub mod forward;
pub mod forwarders;
pub mod message;
pub mod mime;
pub mod tls;
pub mod worker;

pub use address::*;
pub use config::*;
pub use dispatcher::*;
pub use forward::*;
pub use forwarders::*;
pub use message::*;
pub use mime::*;
pub use tls::*;
pub use worker::*;
