pub mod class_names;
pub mod detector;
pub mod encoding;
pub mod notifier;
pub mod persistence;
pub mod queue;
pub mod retry;
pub mod storage;
pub mod yolo;
