// Defaults loaded from the environment (a `.env` file is read by main).

use std::env;
use std::time::Duration;

lazy_static::lazy_static! {
    pub static ref REQUEST_TIMEOUT: Duration = Duration::from_secs(
        env::var("GUIDECHAT_REQUEST_TIMEOUT_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(10)
    );
    // Pause before the acknowledgement is appended, mimicking a typing bot.
    pub static ref REPLY_DELAY: Duration = Duration::from_millis(
        env::var("GUIDECHAT_REPLY_DELAY_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(1000)
    );
}

pub const ACKNOWLEDGEMENT: &str = "Thanks for your message!";

/// Separator used when a selection set is substituted into a template.
pub const SELECTION_SEPARATOR: &str = "; ";
