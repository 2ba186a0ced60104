//! Network subsystem for UDP audio transport

pub mod receiver;
pub mod sender;
pub mod udp;

pub use receiver::{AudioReceiver, ReceiverExit, ReceiverStats};
pub use sender::{AudioSender, SenderStats};
pub use udp::{bind_receive_socket, create_send_socket, resolve_peer, wake_receiver};
