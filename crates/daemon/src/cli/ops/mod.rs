pub mod config;
pub mod ls;
#[cfg(feature = "fuse")]
pub mod mount;

pub use config::Config;
pub use ls::Ls;
#[cfg(feature = "fuse")]
pub use mount::Mount;
