pub mod datagram;
