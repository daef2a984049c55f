pub mod modes;
pub mod tracker;
