//! Shared UI icons and emojis.

use console::Emoji;

// Status indicators
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "[!]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");
pub static STOP: Emoji<'_, '_> = Emoji("🛑 ", "[STOP]");

// Stage indicators
pub static SCAN: Emoji<'_, '_> = Emoji("🔎 ", "[S]");
pub static TRANSFORM: Emoji<'_, '_> = Emoji("🧠 ", "[T]");
pub static GENERATE: Emoji<'_, '_> = Emoji("🎨 ", "[G]");
pub static ORGANIZE: Emoji<'_, '_> = Emoji("📁 ", "[O]");
pub static SLOT: Emoji<'_, '_> = Emoji("🔧 ", "-");
