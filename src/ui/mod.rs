//! Discord-facing presentation: the now-playing panel and its reaction controls.

pub mod buttons;
pub mod panel;
