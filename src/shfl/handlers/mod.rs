pub mod create;
pub mod dir_ops;
pub mod file_ops;
pub mod path_ops;
