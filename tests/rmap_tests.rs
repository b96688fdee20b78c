use groundlink::rmap::*;

fn codec() -> RmapCodec {
    RmapCodec::new(0x32, 0x20, 0x20)
}

#[test]
fn test_read_command_decodes_to_identical_fields() {
    let mut codec = codec();
    let command = RmapCommand {
        write: false,
        verify: false,
        reply: true,
        increment: true,
        address: 0,
        size: 4,
        data: String::new(),
        extended_address: 0,
    };
    let bytes = codec.encode(&command).unwrap();
    assert_eq!(bytes.len(), COMMAND_HEADER_LEN + 1);

    let packet = decode(&bytes).unwrap();
    assert_eq!(packet.kind, PacketKind::CommandRead);
    assert_eq!(packet.target_address, 0x32);
    assert_eq!(packet.initiator_address, 0x20);
    assert_eq!(packet.key, Some(0x20));
    assert_eq!(packet.protocol_id, PROTOCOL_ID);
    assert_eq!(packet.transaction_id, 1);
    assert!(!packet.write && !packet.verify && packet.reply && packet.increment);
    assert_eq!(packet.address, Some(0));
    assert_eq!(packet.extended_address, Some(0));
    assert_eq!(packet.data_length, Some(4));
    assert!(packet.data.is_empty());
    assert!(packet.header_crc_valid);
    assert!(packet.data_crc_valid);
    assert!(packet.valid);
}

#[test]
fn test_write_command_carries_data_and_its_crc() {
    let mut codec = codec();
    let bytes = codec
        .encode(&RmapCommand::write(0x0000_1000, "deadbeef", true))
        .unwrap();
    assert_eq!(bytes.len(), COMMAND_HEADER_LEN + 1 + 4 + 1);
    assert_eq!(*bytes.last().unwrap(), crc8(&[0xDE, 0xAD, 0xBE, 0xEF]));

    let packet = decode(&bytes).unwrap();
    assert_eq!(packet.kind, PacketKind::CommandWrite);
    assert!(packet.write && packet.verify);
    assert_eq!(packet.address, Some(0x1000));
    // Size defaults to the decoded payload length
    assert_eq!(packet.data_length, Some(4));
    assert_eq!(packet.data, vec![0xDE, 0xAD, 0xBE, 0xEF]);
    assert!(packet.valid);
}

#[test]
fn test_short_packets_decode_to_none() {
    assert!(decode(&[]).is_none());
    assert!(decode(&[0xFF; 7]).is_none());
    assert!(decode(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00]).is_none());
}

#[test]
fn test_truncated_command_header_is_flagged_invalid() {
    let bytes = codec().encode(&RmapCommand::read(0x1234, 4)).unwrap();

    let packet = decode(&bytes[..12]).unwrap();
    assert_eq!(packet.kind, PacketKind::CommandRead);
    assert_eq!(packet.target_address, 0x32);
    assert_eq!(packet.transaction_id, 1);
    assert_eq!(packet.address, Some(0x1234));
    assert_eq!(packet.data_length, None);
    assert!(!packet.header_crc_valid);
    assert!(!packet.length_valid);
    assert!(!packet.valid);

    // Size present, header CRC missing
    let packet = decode(&bytes[..COMMAND_HEADER_LEN]).unwrap();
    assert_eq!(packet.data_length, Some(4));
    assert!(!packet.header_crc_valid);
    assert!(!packet.valid);
}

#[test]
fn test_truncated_read_reply_is_flagged_invalid() {
    let command = decode(&codec().encode(&RmapCommand::read(0, 2)).unwrap()).unwrap();
    let reply = encode_reply(&command, 0, &[0x01, 0x02]).unwrap();

    let packet = decode(&reply[..9]).unwrap();
    assert_eq!(packet.kind, PacketKind::ReplyRead);
    assert_eq!(packet.status, Some(0));
    assert_eq!(packet.data_length, None);
    assert!(packet.data.is_empty());
    assert!(!packet.length_valid);
    assert!(!packet.valid);
}

#[test]
fn test_corrupted_crcs_are_flagged_not_fatal() {
    let mut header = codec().encode(&RmapCommand::read(0x40, 8)).unwrap();
    header[9] ^= 0x01;
    let packet = decode(&header).unwrap();
    assert!(!packet.header_crc_valid);
    assert!(!packet.valid);

    let mut payload = codec().encode(&RmapCommand::write(0x40, "0102", false)).unwrap();
    let last = payload.len() - 2;
    payload[last] ^= 0xFF;
    let packet = decode(&payload).unwrap();
    assert!(packet.header_crc_valid);
    assert!(!packet.data_crc_valid);
    assert!(!packet.valid);
}

#[test]
fn test_declared_length_mismatch_is_flagged() {
    let mut codec = codec();
    let mut command = RmapCommand::write(0, "010203", false);
    command.size = 8;
    let packet = decode(&codec.encode(&command).unwrap()).unwrap();
    assert_eq!(packet.data_length, Some(8));
    assert!(!packet.length_valid);
    assert!(!packet.valid);
}

#[test]
fn test_transaction_id_increments_and_wraps_to_one() {
    let mut codec = codec().with_transaction_id(u16::MAX - 1);
    let read = RmapCommand::read(0, 1);

    let a = decode(&codec.encode(&read).unwrap()).unwrap();
    let b = decode(&codec.encode(&read).unwrap()).unwrap();
    let c = decode(&codec.encode(&read).unwrap()).unwrap();

    assert_eq!(a.transaction_id, u16::MAX - 1);
    assert_eq!(b.transaction_id, u16::MAX);
    assert_eq!(c.transaction_id, 1);
    assert_eq!(codec.transaction_id(), 2);
}

#[test]
fn test_read_reply_round_trip() {
    let command = decode(&codec().encode(&RmapCommand::read(0x2000, 3)).unwrap()).unwrap();
    let reply = encode_reply(&command, 0, &[0x0A, 0x0B, 0x0C]).unwrap();

    let packet = decode(&reply).unwrap();
    assert_eq!(packet.kind, PacketKind::ReplyRead);
    assert_eq!(packet.initiator_address, 0x20);
    assert_eq!(packet.target_address, 0x32);
    assert_eq!(packet.status, Some(0));
    assert_eq!(packet.transaction_id, 1);
    assert_eq!(packet.data_length, Some(3));
    assert_eq!(packet.data, vec![0x0A, 0x0B, 0x0C]);
    assert!(packet.valid);
}

#[test]
fn test_write_reply_round_trip() {
    let command = decode(&codec().encode(&RmapCommand::write(0, "ff", false)).unwrap()).unwrap();
    let reply = encode_reply(&command, 0x0A, &[]).unwrap();
    assert_eq!(reply.len(), WRITE_REPLY_LEN);

    let packet = decode(&reply).unwrap();
    assert_eq!(packet.kind, PacketKind::ReplyWrite);
    assert_eq!(packet.status, Some(0x0A));
    assert!(packet.valid);

    // Replies cannot be answered
    assert!(encode_reply(&packet, 0, &[]).is_none());
}

#[test]
fn test_invalid_hex_is_rejected() {
    let mut codec = codec();
    assert!(matches!(codec.encode(&RmapCommand::write(0, "abc", false)), Err(RmapError::InvalidHex(_))));
    assert!(matches!(codec.encode(&RmapCommand::write(0, "zz", false)), Err(RmapError::InvalidHex(_))));
    // Nothing was sent, so the id did not move
    assert_eq!(codec.transaction_id(), 1);
}

#[test]
fn test_oversized_length_is_rejected() {
    let mut codec = codec();
    let err = codec.encode(&RmapCommand::read(0, 0x0100_0000)).unwrap_err();
    assert_eq!(err, RmapError::LengthOutOfRange(0x0100_0000));
}

#[test]
fn test_packet_serializes_to_json() {
    let packet = decode(&codec().encode(&RmapCommand::read(0, 4)).unwrap()).unwrap();
    let json = serde_json::to_value(&packet).unwrap();
    assert_eq!(json["kind"], "CommandRead");
    assert_eq!(json["valid"], true);
}
