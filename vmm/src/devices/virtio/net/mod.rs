pub mod device;
pub mod queue_handler;
pub mod simple_handler;
pub mod tap;

/// Size of the `virtio_net_hdr_v1` header that prefixes every frame.
pub const VIRTIO_NET_HDR_SIZE: usize = 12;

// Queue order for a single RX/TX pair. With multiqueue the RX queues would
// sit at 2k and the TX queues at 2k+1, but this device only drives one pair.
pub(crate) const RXQ_INDEX: u16 = 0;
pub(crate) const TXQ_INDEX: u16 = 1;
