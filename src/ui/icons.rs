//! Shared UI icons.
//!
//! Each icon falls back to a plain ASCII tag on terminals without emoji
//! support.

use console::Emoji;

// Stage status
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static WAITING: Emoji<'_, '_> = Emoji("⏳ ", "[..]");
pub static RUNNING: Emoji<'_, '_> = Emoji("▶️  ", "[>]");

// Channel state
pub static LINK: Emoji<'_, '_> = Emoji("🔗 ", "[WS]");
pub static UNLINKED: Emoji<'_, '_> = Emoji("⛓️  ", "[--]");

// Streamed log lines
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "[WARN]");
pub static INFO: Emoji<'_, '_> = Emoji("💬 ", "[INFO]");

pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");
pub static PAPER: Emoji<'_, '_> = Emoji("📄 ", "");
