//! Print the cursor the next run will start from.
//!
//! Usage: `cursor_inspect [path]` (defaults to $CURSOR_PATH, then last_timestamp.txt).

use anyhow::Result;
use chrono::Utc;
use profile_watch::config::{clean_env_value, ENV_CURSOR_PATH};
use profile_watch::cursor::{format_cursor, CursorStore, DEFAULT_CURSOR_PATH};

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(ENV_CURSOR_PATH).ok().map(|v| clean_env_value(&v)))
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| DEFAULT_CURSOR_PATH.to_string());

    let store = CursorStore::new(&path);
    match store.read()? {
        None => println!("{path}: empty (next run processes every post it finds)"),
        Some(ts) => {
            let age = Utc::now() - ts;
            println!(
                "{path}: {} ({}h {}m ago)",
                format_cursor(ts),
                age.num_hours(),
                age.num_minutes() % 60
            );
        }
    }
    Ok(())
}
