// frameloop - GPU frame orchestration and hazard tracking
//
// The layer between a rendering engine and the GPU: drives the
// double-buffered frame loop, keeps CPU-side resource reuse behind GPU
// completion signals, derives the pipeline barriers a recorded command
// needs, and hands filesystem-change notifications from a background
// watcher to the frame loop for pipeline hot reloading.

pub mod backend;
pub mod config;
pub mod hot_reload;
