pub mod case_fold;
pub mod error_style;
pub mod metadata;
pub mod path_resolver;
