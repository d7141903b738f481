pub mod crypto;
pub mod dirs;
pub mod encode;
pub mod fs;
pub mod http;
pub mod identity;
pub mod json;
pub mod store;
pub mod types;
