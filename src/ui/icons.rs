//! Shared UI icons.

use console::Emoji;

// Status indicators
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");
pub static BLOCKER: Emoji<'_, '_> = Emoji("🚧 ", "[BLOCK]");
pub static PIVOT: Emoji<'_, '_> = Emoji("🔄 ", "[RETRY]");

// Wave and unit indicators
pub static WAVE: Emoji<'_, '_> = Emoji("🌊 ", "[W]");
pub static RUNNING: Emoji<'_, '_> = Emoji("▶️  ", "[>]");
pub static REVIEW: Emoji<'_, '_> = Emoji("🔍 ", "[R]");
pub static CLOCK: Emoji<'_, '_> = Emoji("⏱️  ", "[T]");

// Gates and guidance
pub static GATE: Emoji<'_, '_> = Emoji("🚦 ", "[GATE]");
pub static RULING: Emoji<'_, '_> = Emoji("📜 ", "[RULING]");
