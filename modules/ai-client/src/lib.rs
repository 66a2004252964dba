pub mod chat;
pub mod error;
pub mod util;

pub use chat::OpenAi;
pub use error::{AiError, Result};
pub use util::{strip_code_blocks, truncate_to_char_boundary};
