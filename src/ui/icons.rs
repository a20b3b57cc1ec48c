//! Status glyphs with plain-text fallbacks for terminals without emoji.

use console::Emoji;

pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static PAUSE: Emoji<'_, '_> = Emoji("⏸️  ", "[PAUSE]");
pub static SCALES: Emoji<'_, '_> = Emoji("⚖️  ", "[ADJ]");
pub static PROGRESS: Emoji<'_, '_> = Emoji("📊 ", "[PROG]");
