pub mod codec;
pub mod commands;
pub mod doctor;
pub mod fs_utils;
pub mod git;
pub mod logger;
pub mod manager;
pub mod paths;
pub mod platform;
pub mod profiles;
pub mod remote;
pub mod ssh;
pub mod store;
pub mod switch;
pub mod ui;

#[cfg(test)]
pub mod test_utils;
