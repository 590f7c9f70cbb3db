pub mod args;
pub mod error;
pub mod file_info;
pub mod server;
pub mod shfl;
