pub mod constants;
pub mod crypto;
pub mod device;
pub mod error;
pub mod gateway;
pub mod message;
pub mod packet;
pub mod pairing;
pub mod radio;
pub mod registry;
pub mod response;

// Re-export the gateway entry points for easy access
pub use error::GatewayError;
pub use gateway::{Gateway, GatewayConfig};
pub use packet::{Address, Command, Frame};
