//! Checkpoints: on-disk images, the upload wire format and both ends of
//! the standby-to-primary exchange

pub mod producer;
pub mod receiver;
pub mod store;
pub mod uploader;
pub mod wire;

pub use producer::CheckpointProducer;
pub use receiver::CheckpointReceiver;
pub use store::{CheckpointId, CheckpointStore};
pub use uploader::CheckpointUploader;
