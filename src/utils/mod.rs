// Utility modules for common functionality

pub mod console;
pub mod ifaces;
