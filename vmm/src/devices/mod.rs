pub mod serial;
pub mod stdin;
pub mod virtio;
