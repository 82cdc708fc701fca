pub mod codec;
pub mod message;
pub mod pinger;
pub mod smart_socket;
pub mod version;
