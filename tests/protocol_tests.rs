use std::io::{Read, Seek, SeekFrom, Write};

use logstream::protocol::{
    decode_message_head, encode_control, encode_message, encode_message_head, FrameReader, Header,
    Packet, PacketType, MESSAGE_PREFIX_SIZE, PACKET_HEADER_SIZE, PACKET_MAX_FIXED_PART,
};
use logstream::{Level, Message};

fn sample(index: u32, text: &str) -> Message {
    Message::new(1_700_000_000_000_000 + index as i64, index, 3, Level::Notice, text.to_string())
}

#[test]
fn test_empty_stream() {
    let data = Vec::new();
    let mut reader = FrameReader::new(&data);
    assert!(reader.read_packet().is_none());
}

#[test]
fn test_message_fields_preserved() {
    let texts = ["", "plain", "ünïcödé ✓ 日本語", "line\nbreak\0nul"];
    for (i, text) in texts.iter().enumerate() {
        let msg = Message::new(-42, u32::MAX - i as u32, u32::MAX, Level::Verbose, text.to_string());
        let data = encode_message(&msg);
        assert_eq!(data.len(), PACKET_MAX_FIXED_PART + text.len());
        assert_eq!(FrameReader::new(&data).read_packet(), Some(Packet::Message(msg)));
    }
}

#[test]
fn test_head_and_text_are_separate() {
    let msg = sample(9, "tail");
    let head = encode_message_head(&msg);
    let header = Header::decode(&[head[0], head[1], head[2], head[3], head[4]]);
    assert_eq!(header.kind(), Some(PacketType::Message));
    assert_eq!(header.body_len as usize, MESSAGE_PREFIX_SIZE + 4);
    assert_eq!(header.fixed_part(), PACKET_MAX_FIXED_PART);

    let decoded = decode_message_head(&head, b"tail".to_vec());
    assert_eq!(decoded, msg);
}

#[test]
fn test_mixed_packets() {
    let mut data = Vec::new();
    data.extend_from_slice(&encode_control(PacketType::Ping));
    data.extend_from_slice(&encode_message(&sample(0, "first")));
    // Unknown packet with a body longer than any known fixed part
    data.extend_from_slice(&40u32.to_le_bytes());
    data.push(0x7f);
    data.extend_from_slice(&[0xee; 40]);
    data.extend_from_slice(&encode_message(&sample(1, "second")));
    data.extend_from_slice(&encode_control(PacketType::Bye));

    let packets: Vec<Packet> = FrameReader::new(&data).collect();
    assert_eq!(
        packets,
        vec![
            Packet::Ping,
            Packet::Message(sample(0, "first")),
            Packet::Unknown(0x7f),
            Packet::Message(sample(1, "second")),
            Packet::Bye,
        ]
    );
}

#[test]
fn test_short_message_body_is_not_a_message() {
    // MESSAGE header claiming fewer bytes than the fixed prefix
    let mut data = vec![4, 0, 0, 0, PacketType::Message.as_u8(), 1, 2, 3, 4];
    data.extend_from_slice(&encode_control(PacketType::Ping));
    let packets: Vec<Packet> = FrameReader::new(&data).collect();
    assert_eq!(packets, vec![Packet::Unknown(1), Packet::Ping]);
}

#[test]
fn test_stops_at_partial_packet() {
    let mut data = encode_message(&sample(0, "complete"));
    let second = encode_message(&sample(1, "partial"));
    data.extend_from_slice(&second[..PACKET_HEADER_SIZE + 3]);

    let mut reader = FrameReader::new(&data);
    assert!(matches!(reader.read_packet(), Some(Packet::Message(_))));
    let position = reader.position();
    assert!(reader.read_packet().is_none());
    assert_eq!(reader.position(), position);
}

#[test]
fn test_captured_stream_file() {
    let mut file = tempfile::tempfile().unwrap();
    for i in 0..100 {
        file.write_all(&encode_message(&sample(i, &format!("record {}", i)))).unwrap();
    }
    file.write_all(&encode_control(PacketType::Bye)).unwrap();
    file.seek(SeekFrom::Start(0)).unwrap();

    let mut data = Vec::new();
    file.read_to_end(&mut data).unwrap();
    let packets: Vec<Packet> = FrameReader::new(&data).collect();
    assert_eq!(packets.len(), 101);
    assert_eq!(packets[42], Packet::Message(sample(42, "record 42")));
    assert_eq!(packets[100], Packet::Bye);
}

#[test]
fn test_level_names() {
    for level in Level::ALL {
        assert_eq!(level.as_str().parse::<Level>(), Ok(level));
        assert_eq!(level.to_string(), level.as_str());
    }
}
