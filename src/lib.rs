pub mod bridge;
pub mod config;
pub mod netif;
pub mod probe;
pub mod session;
pub mod stun;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;
