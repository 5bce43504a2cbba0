pub mod history;
pub mod process;
#[cfg(unix)]
pub mod procfs;
pub mod source;
