// API处理器模块

pub mod processing;
pub mod upload;
pub mod video;

pub use crate::protocol::ApiResponse;
pub use processing::*;
pub use upload::*;
pub use video::*;
