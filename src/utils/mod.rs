pub mod fixed;
pub mod logging;
