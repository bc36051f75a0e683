//! Everything that makes sound: the speech host, its voice catalog, sound
//! effects and the speaker that sequences announcements.

pub mod catalog;
pub mod effects;
pub mod host;
pub mod kokoro;
pub mod output;
pub mod presets;
pub mod speaker;
