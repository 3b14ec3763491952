// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use hex_literal::hex;
use iscsi_target_rs::models::{
    ahs::{bidi_read_length, encode_bidi_read_length},
    async_msg::response::AsyncMessage,
    data::sense_data::SenseData,
    data_format::encode_frame,
    opcode::{BhsOpcode, Opcode},
    parse::Pdu,
    task_mgmt::{
        common::{TmFunction, TmResponseCode},
        request::TaskMgmtRequest,
        response::TaskMgmtResponse,
    },
};
use zerocopy::IntoBytes;

#[test]
fn task_mgmt_request_roundtrip() {
    let mut h = TaskMgmtRequest::default_hdr();
    h.function.set_function(TmFunction::AbortTask);
    h.opcode.set_i();
    h.lun.set(1);
    h.initiator_task_tag = 0x11223344;
    h.referenced_task_tag.set(0x55667788);
    h.cmd_sn.set(9);
    h.ref_cmd_sn.set(7);

    let mut raw = [0u8; 48];
    raw.copy_from_slice(h.as_bytes());

    assert_eq!(raw[0], 0x42, "opcode 0x02 with the immediate bit");
    assert_eq!(raw[1], 0x81, "F bit plus ABORT TASK");

    let pdu = Pdu::from_bhs_bytes(&mut raw).expect("parse TM request");
    let Pdu::TaskMgmtRequest(hdr) = pdu else {
        panic!("wrong PDU variant");
    };
    assert_eq!(hdr.function.function(), Some(TmFunction::AbortTask));
    assert_eq!(hdr.referenced_task_tag.get(), 0x55667788);
    assert_eq!(hdr.cmd_sn.get(), 9);
    assert_eq!(hdr.ref_cmd_sn.get(), 7);
}

#[test]
fn task_mgmt_response_wire_layout() {
    let mut hdr = TaskMgmtResponse::default_hdr();
    hdr.response.encode(TmResponseCode::UnknownTask);
    hdr.initiator_task_tag = 0xaabbccdd_u32.to_be();
    hdr.stat_sn.set(3);
    hdr.exp_cmd_sn.set(4);
    hdr.max_cmd_sn.set(36);

    let raw = hdr.as_bytes();
    assert_eq!(raw[0], 0x22);
    assert_eq!(raw[1], 0x80);
    assert_eq!(raw[2], 0x01);
    assert_eq!(&raw[16..20], &hex!("aa bb cc dd"));
    assert_eq!(&raw[24..28], &hex!("00 00 00 03"));
}

#[test]
fn async_message_wire_layout() {
    let mut hdr = AsyncMessage::default_hdr();
    hdr.lun.set(2);
    hdr.all_ones.set(0xffff_ffff);
    hdr.async_event = AsyncMessage::SCSI_EVENT;

    let raw = hdr.as_bytes();
    assert_eq!(raw[0], 0x32);
    assert_eq!(raw[1], 0x80);
    assert_eq!(&raw[16..20], &hex!("ff ff ff ff"));
    assert_eq!(raw[36], 0);

    let op = BhsOpcode::try_from(raw[0]).expect("valid opcode byte");
    assert_eq!(op.opcode, Opcode::AsyncMsg);
}

#[test]
fn frame_encoding_pads_and_digests() {
    let bhs = [0u8; 48];

    // 5 data bytes pad to 8; digests add 4 bytes each.
    let plain = encode_frame(&bhs, &[], &hex!("01 02 03 04 05"), false, false);
    assert_eq!(plain.len(), 48 + 8);
    assert_eq!(&plain[53..56], &[0, 0, 0]);

    let digested = encode_frame(&bhs, &[], &hex!("01 02 03 04 05"), true, true);
    assert_eq!(digested.len(), 48 + 4 + 8 + 4);

    let want_hd = crc32c::crc32c(&bhs);
    assert_eq!(&digested[48..52], &want_hd.to_be_bytes());

    let mut padded_data = hex!("01 02 03 04 05").to_vec();
    padded_data.extend_from_slice(&[0, 0, 0]);
    let want_dd = crc32c::crc32c(&padded_data);
    assert_eq!(&digested[60..64], &want_dd.to_be_bytes());
}

#[test]
fn header_only_frame_has_no_data_digest() {
    let bhs = [0u8; 48];
    let framed = encode_frame(&bhs, &[], &[], true, true);
    assert_eq!(framed.len(), 48 + 4);
}

#[test]
fn bidi_read_length_ahs_roundtrip() {
    let raw = encode_bidi_read_length(65536);
    assert_eq!(raw.len(), 8);
    assert_eq!(raw[2], 0x02);
    assert_eq!(bidi_read_length(&raw), Some(65536));
}

#[test]
fn task_mgmt_response_golden_fixture() {
    // TM response: F=1, UnknownTask, ITT 0x00000007, StatSN 2,
    // ExpCmdSN 9, MaxCmdSN 40.
    let raw = hex::decode(concat!(
        "228001000000000000000000000000000000000700000000",
        "000000020000000900000028000000000000000000000000",
    ))
    .expect("valid hex");

    let mut bhs = [0u8; 48];
    bhs.copy_from_slice(&raw);

    let pdu = Pdu::from_bhs_bytes(&mut bhs).expect("parse TM response");
    let Pdu::TaskMgmtResponse(hdr) = pdu else {
        panic!("wrong PDU variant");
    };
    assert_eq!(hdr.response.decode(), TmResponseCode::UnknownTask);
    assert_eq!(hdr.initiator_task_tag, 7u32.to_be());
    assert_eq!(hdr.stat_sn.get(), 2);
    assert_eq!(hdr.exp_cmd_sn.get(), 9);
    assert_eq!(hdr.max_cmd_sn.get(), 40);
}

#[test]
fn fixed_sense_encoding() {
    let sense = SenseData::current(0x0b, 0x47, 0x05);
    let wire = sense.to_iscsi_bytes();

    assert_eq!(wire.len(), 20);
    assert_eq!(&wire[0..2], &hex!("00 12"));
    assert_eq!(wire[2], 0x70);
    assert_eq!(wire[2 + 2] & 0x0f, 0x0b);
    assert_eq!(wire[2 + 12], 0x47);
    assert_eq!(wire[2 + 13], 0x05);

    let parsed = SenseData::parse(&wire).expect("parse back");
    assert_eq!(parsed.sense_key, 0x0b);
    assert_eq!(parsed.asc, 0x47);
    assert_eq!(parsed.ascq, 0x05);
}
