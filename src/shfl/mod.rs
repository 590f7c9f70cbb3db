pub mod handle_table;
pub mod handlers;
pub mod mappings;
pub mod notify;
pub mod saved_state;
pub mod session;
pub mod session_state;
pub mod types;
pub mod utils;

pub use session::{ShflSession, WriteReply};
pub use session_state::*;
pub use types::*;
