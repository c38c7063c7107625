pub mod codec;
pub mod handshake;
pub mod packet;

pub use codec::PacketCodec;
pub use handshake::{
    compute_auth_response, is_eof_packet, is_err_packet, is_ok_packet, ok_packet_gtid,
    packet_status_flags, parse_stmt_prepare_ok, read_length_encoded_int, ErrPacket,
    HandshakeResponse, InitialHandshake, OkPacket,
};
pub use packet::{capabilities, status, Command, Packet, MAX_PACKET_SIZE, PACKET_HEADER_SIZE};
