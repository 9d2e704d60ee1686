//! Encode/decode round-trips over the full packet grammar.

use ptkit_packet::{
    opcode, CbrPayload, Config, Encoder, Error, IpCompression, IpPayload, ModeExec, ModePayload,
    ModeTsx, Packet, PacketDecoder, PipPayload, TntPayload, TscPayload,
};

fn legal_packets() -> Vec<Packet<'static>> {
    let mut packets = vec![
        Packet::Pad,
        Packet::Psb,
        Packet::Psbend,
        Packet::Ovf,
        Packet::Tnt8(TntPayload {
            bit_size: 1,
            payload: 0b1,
        }),
        Packet::Tnt8(TntPayload {
            bit_size: 6,
            payload: 0b101101,
        }),
        Packet::Tnt64(TntPayload {
            bit_size: 47,
            payload: 0x2aaa_aaaa_aaaa,
        }),
        Packet::Tnt64(TntPayload {
            bit_size: 13,
            payload: 0x1fff,
        }),
        Packet::Mode(ModePayload::Exec(ModeExec {
            csl: true,
            csd: false,
        })),
        Packet::Mode(ModePayload::Tsx(ModeTsx {
            intx: true,
            abrt: true,
        })),
        Packet::Pip(PipPayload {
            cr3: 0x0000_1234_5678_9020,
            nr: true,
        }),
        Packet::Tsc(TscPayload {
            tsc: 0x00aa_bbcc_ddee_ff11,
        }),
        Packet::Cbr(CbrPayload { ratio: 0x2a }),
    ];

    let compressions = [
        (IpCompression::Suppressed, 0u64),
        (IpCompression::Update16, 0xa55a),
        (IpCompression::Update32, 0xdead_beef),
        (IpCompression::Sext48, 0xffff_ffff_8000),
    ];
    for (ipc, ip) in compressions {
        let payload = IpPayload { ipc, ip };
        packets.push(Packet::Tip(payload));
        packets.push(Packet::TipPge(payload));
        packets.push(Packet::TipPgd(payload));
        packets.push(Packet::Fup(payload));
    }

    packets
}

#[test]
fn every_legal_packet_round_trips() {
    for packet in legal_packets() {
        let mut buf = [0u8; 16];
        let written = {
            let mut encoder = Encoder::new(&mut buf);
            encoder.next(&packet).unwrap()
        };
        assert_eq!(written, packet.size(), "size mismatch for {packet}");

        let mut decoder = PacketDecoder::new(Config::new(&buf[..written]));
        decoder.sync_set(0).unwrap();
        let decoded = decoder.next().unwrap();
        assert_eq!(decoded, packet, "round-trip mismatch");
        assert_eq!(decoded.size(), written);
        assert_eq!(decoder.offset(), Ok(written));
    }
}

#[test]
fn sizes_match_the_wire_tables() {
    assert_eq!(Packet::Pad.size(), opcode::PTPS_PAD);
    assert_eq!(Packet::Psb.size(), opcode::PTPS_PSB);
    assert_eq!(Packet::Psbend.size(), opcode::PTPS_PSBEND);
    assert_eq!(Packet::Ovf.size(), opcode::PTPS_OVF);
    assert_eq!(
        Packet::Tnt8(TntPayload {
            bit_size: 3,
            payload: 0,
        })
        .size(),
        opcode::PTPS_TNT_8
    );
    assert_eq!(
        Packet::Tnt64(TntPayload {
            bit_size: 3,
            payload: 0,
        })
        .size(),
        opcode::PTPS_TNT_64
    );
    assert_eq!(
        Packet::Mode(ModePayload::Exec(ModeExec {
            csl: false,
            csd: false,
        }))
        .size(),
        opcode::PTPS_MODE
    );
    assert_eq!(Packet::Pip(PipPayload { cr3: 0, nr: false }).size(), opcode::PTPS_PIP);
    assert_eq!(Packet::Tsc(TscPayload { tsc: 0 }).size(), opcode::PTPS_TSC);
    assert_eq!(Packet::Cbr(CbrPayload { ratio: 0 }).size(), opcode::PTPS_CBR);

    let sizes = [
        (IpCompression::Suppressed, 1),
        (IpCompression::Update16, 3),
        (IpCompression::Update32, 5),
        (IpCompression::Sext48, 7),
    ];
    for (ipc, size) in sizes {
        let payload = IpPayload { ipc, ip: 0 };
        assert_eq!(Packet::Tip(payload).size(), size);
        assert_eq!(Packet::TipPge(payload).size(), size);
        assert_eq!(Packet::TipPgd(payload).size(), size);
        assert_eq!(Packet::Fup(payload).size(), size);
    }
}

#[test]
fn unknown_opcodes_reject_or_delegate() {
    struct SkipTwo;
    impl ptkit_packet::DecodeUnknown for SkipTwo {
        fn decode_unknown(&mut self, _pos: &[u8]) -> Result<usize, Error> {
            Ok(2)
        }
    }

    // 0x59 is a free opcode that does not decode.
    let buf = [0x59, 0xff, 0x00];

    let mut decoder = PacketDecoder::new(Config::new(&buf));
    decoder.sync_set(0).unwrap();
    assert_eq!(decoder.next(), Err(Error::BadOpc));

    let mut decoder = PacketDecoder::new(Config::with_unknown(&buf, SkipTwo));
    decoder.sync_set(0).unwrap();
    let packet = decoder.next().unwrap();
    assert!(matches!(packet, Packet::Unknown(unknown) if unknown.bytes == [0x59, 0xff]));
    assert_eq!(decoder.next(), Ok(Packet::Pad));
}

#[test]
fn oversized_unknown_packets_are_rejected() {
    struct RunsPastEnd;
    impl ptkit_packet::DecodeUnknown for RunsPastEnd {
        fn decode_unknown(&mut self, _pos: &[u8]) -> Result<usize, Error> {
            Ok(16)
        }
    }

    let buf = [0x59, 0xff];
    let mut decoder = PacketDecoder::new(Config::with_unknown(&buf, RunsPastEnd));
    decoder.sync_set(0).unwrap();
    assert_eq!(decoder.next(), Err(Error::BadPacket));
}
