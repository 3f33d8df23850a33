//! # coursebot-channels
//!
//! Long-poll messaging backends. Each backend decodes its platform's wire
//! format into channel-neutral events and session desync notices.

mod classify;
pub mod telegram;
pub mod utils;
pub mod vk;

pub use telegram::TelegramChannel;
pub use vk::VkChannel;
