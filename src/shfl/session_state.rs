use std::collections::HashMap;

use crate::shfl::types::{ClientId, Root};
use crate::shfl::utils::error_style::ErrorStyle;

/// Per-connection flags and mapping references.
#[derive(Debug)]
pub struct SessionState {
    pub id: ClientId,
    /// Paths and names travel as UTF-8 instead of UTF-16.
    pub utf8: bool,
    /// The guest understands symlinks.
    pub symlinks: bool,
    pub error_style: ErrorStyle,
    /// Fixed by the first successful map call.
    pub delimiter: Option<char>,
    pub mapping_counts: HashMap<Root, u32>,
    /// The connection was restored since its last wait for mapping changes.
    pub restored: bool,
}

impl SessionState {
    pub fn new(id: ClientId) -> Self {
        Self {
            id,
            utf8: false,
            symlinks: false,
            error_style: ErrorStyle::NATIVE,
            delimiter: None,
            mapping_counts: HashMap::new(),
            restored: false,
        }
    }

    pub fn delimiter(&self) -> char {
        self.delimiter.unwrap_or('/')
    }
}
