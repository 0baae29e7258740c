//! A [sans-I/O](https://sans-io.readthedocs.io/how-to-sans-io.html)
//! decoder for the subset of the ITM packet protocol emitted by a target
//! configured for variable tracing, as specified in the [ARMv7-M
//! architecture reference manual, Appendix
//! D4](https://developer.arm.com/documentation/ddi0403/ed/). Any
//! references in this code base refer to this document.
//!
//! The target emits three packet families of interest: source packets
//! carrying a stimulus-port (channel) id and a 1/2/4-byte payload, local
//! timestamp packets carrying a continuation-bit encoded delta time, and
//! overflow packets. Synchronization packets are consumed to realign the
//! bitstream. Everything else is reported as a [`MalformedPacket`] so
//! the caller can account for it and resume at the next byte.

use bitmatch::bitmatch;
use bitvec::prelude::*;

/// The set of packet types that may be decoded.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TracePacket {
    /// A synchronization packet is a unique pattern in the bitstream.
    /// It is identified and used to provide the alignment of other
    /// packet bytes in the bitstream. (Appendix D4.2.1)
    Sync,

    /// Found in the bitstream if the target could not keep up with the
    /// configured trace bandwidth: a stimulus write hit a full output
    /// buffer, or the local timestamp counter overflowed. (Appendix
    /// D4.2.3)
    Overflow,

    /// A delta timestamp that measures the interval since the
    /// generation of the last local timestamp and its relation to the
    /// corresponding data packets. (Appendix D4.2.4)
    LocalTimestamp1 {
        /// Timestamp value, in trace clock ticks.
        ts: u32,

        /// Indicates the relationship between the generation of `ts`
        /// and the corresponding data packet.
        data_relation: TimestampDataRelation,
    },

    /// A derivative of `LocalTimestamp1` for timestamp values between
    /// 1-6. Always synchronous to the associated data. (Appendix D4.2.4)
    LocalTimestamp2 {
        /// Timestamp value, in trace clock ticks.
        ts: u8,
    },

    /// Contains the payload written to a stimulus port. One sampled
    /// variable value per packet; the port doubles as the channel id.
    /// (Appendix D4.2.8)
    Source {
        /// Stimulus port (channel) number.
        channel: u8,

        /// Payload written to the port; 1, 2 or 4 bytes, LE.
        payload: Vec<u8>,
    },
}

/// Indicates the relationship between the generation of the local
/// timestamp packet and the corresponding data packet. (Appendix D4.2.4)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TimestampDataRelation {
    /// The local timestamp value is synchronous to the corresponding
    /// data. The value in the TS field is the timestamp counter value
    /// when the data packet was generated.
    Sync,

    /// The local timestamp value is delayed relative to the data. The
    /// value in the TS field is the timestamp counter value when the
    /// local timestamp packet was generated. Delay class 1.
    UnknownDelay,

    /// Output of the data packet corresponding to this local timestamp
    /// packet is delayed relative to the associated event. Delay
    /// class 2.
    AssocEventDelay,

    /// Both of the above: the data packet is delayed relative to the
    /// associated event and this local timestamp packet is delayed
    /// relative to the data. Delay class 3; an excess rate of these
    /// implies the target is overloaded.
    UnknownAssocEventDelay,
}

/// A header or payload byte failed to decode. The decoder returns to the
/// header state afterwards; the offending byte is lost.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MalformedPacket {
    /// Header is invalid and cannot be decoded.
    #[error("header is invalid and cannot be decoded: {}", format!("{:#010b}", .0))]
    InvalidHeader(u8),

    /// A source packet header contains an invalid payload size.
    #[error("source packet header {header:#04x} contains invalid payload size {size}")]
    InvalidSourcePayload {
        /// The header which contains the invalid payload size.
        header: u8,

        /// The invalid payload size field. See (Appendix D4.2.8, Table
        /// D4-4).
        size: u8,
    },

    /// The number of zeroes in a synchronization packet is less than 47.
    #[error("synchronization packet too short: {0} zero bits")]
    InvalidSync(usize),
}

const SYNC_MIN_ZEROS: usize = 47;

/// The decoder's possible states. The default state is `Header` and the
/// decoder always returns there after emitting a packet or an error.
#[derive(Debug, Clone, PartialEq)]
enum DecoderState {
    /// Next byte will be decoded as a header byte.
    Header,

    /// Next zero bits will be assumed to be part of a synchronization
    /// packet until a set bit is encountered.
    Syncing(usize),

    /// Next bytes will be assumed to be part of a source packet, until
    /// `payload` contains `expected_size` bytes.
    Source {
        channel: u8,
        payload: Vec<u8>,
        expected_size: usize,
    },

    /// Next bytes will be assumed to be part of a LocalTimestamp1
    /// packet, until the continuation bit is clear.
    LocalTimestamp {
        data_relation: TimestampDataRelation,
        payload: Vec<u8>,
    },
}

/// Packet protocol decoder.
///
/// Bytes are [`push`](Decoder::push)ed in as they arrive from the probe;
/// complete packets are [`pull`](Decoder::pull)ed out. The two sides
/// need not be in lockstep.
pub struct Decoder {
    /// The incoming bits, newest at the front.
    incoming: BitVec,

    /// The current state of the decoder.
    state: DecoderState,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Decoder {
            incoming: BitVec::new(),
            state: DecoderState::Header,
        }
    }

    /// Push trace data into the decoder.
    pub fn push(&mut self, data: &[u8]) {
        // To optimize the performance in pull, the input bitstream is
        // reversed and prepended. This is a costly operation, but is
        // better done here than elsewhere.
        let mut bv = BitVec::<_, Lsb0>::from_vec(data.to_vec());
        bv.reverse();
        bv.append(&mut self.incoming);
        self.incoming.append(&mut bv);
    }

    /// Drops all buffered bits and returns to the header state.
    pub fn reset(&mut self) {
        self.incoming.clear();
        self.state = DecoderState::Header;
    }

    /// Pull the next decoded packet, if any and able. After an `Err` the
    /// decoder has returned to the header state and may be pulled again.
    pub fn pull(&mut self) -> Result<Option<TracePacket>, MalformedPacket> {
        loop {
            match self.state {
                DecoderState::Syncing(_) => return self.handle_sync(),
                // Decode bytes until a packet is generated, or until we
                // run out of bytes.
                _ if self.incoming.len() >= 8 => {
                    let mut b: u8 = 0;
                    for i in 0..8 {
                        b |= (self.incoming.pop().unwrap() as u8) << i;
                    }

                    match self.process_byte(b) {
                        Ok(Some(packet)) => return Ok(Some(packet)),
                        Ok(None) => continue,
                        Err(e) => {
                            self.state = DecoderState::Header;
                            return Err(e);
                        }
                    }
                }
                _ => return Ok(None),
            }
        }
    }

    /// Read zeros from the bitstream until the first set bit. This
    /// realigns the incoming bitstream for further processing, which may
    /// not be 8-bit aligned.
    fn handle_sync(&mut self) -> Result<Option<TracePacket>, MalformedPacket> {
        let mut count = match self.state {
            DecoderState::Syncing(count) => count,
            _ => unreachable!(),
        };

        while let Some(bit) = self.incoming.pop() {
            if !bit {
                count += 1;
                continue;
            }

            self.state = DecoderState::Header;
            return if count >= SYNC_MIN_ZEROS {
                Ok(Some(TracePacket::Sync))
            } else {
                Err(MalformedPacket::InvalidSync(count))
            };
        }

        // ran out of bits mid-sync; remember how far we got
        self.state = DecoderState::Syncing(count);
        Ok(None)
    }

    /// Processes a single byte from the bitstream and changes decoder
    /// state if necessary.
    fn process_byte(&mut self, b: u8) -> Result<Option<TracePacket>, MalformedPacket> {
        let packet = match &mut self.state {
            DecoderState::Header => return self.decode_header(b),
            DecoderState::Syncing(_) => unreachable!(),
            DecoderState::Source {
                channel,
                payload,
                expected_size,
            } => {
                payload.push(b);
                if payload.len() == *expected_size {
                    Some(TracePacket::Source {
                        channel: *channel,
                        payload: payload.clone(),
                    })
                } else {
                    None
                }
            }
            DecoderState::LocalTimestamp {
                data_relation,
                payload,
            } => {
                let last_byte = (b >> 7) & 1 == 0;
                payload.push(b);
                if last_byte {
                    Some(TracePacket::LocalTimestamp1 {
                        data_relation: *data_relation,
                        // MAGIC(27): c.f. Appendix D4.2.4
                        ts: extract_timestamp(payload, 27) as u32,
                    })
                } else {
                    None
                }
            }
        };

        if packet.is_some() {
            self.state = DecoderState::Header;
        }

        Ok(packet)
    }

    /// Decodes the header byte of a packet, and enters the appropriate
    /// decoder state, if able.
    #[allow(clippy::bad_bit_mask)]
    #[bitmatch]
    fn decode_header(&mut self, header: u8) -> Result<Option<TracePacket>, MalformedPacket> {
        fn translate_ss(ss: u8) -> Option<usize> {
            // See (Appendix D4.2.8, Table D4-4)
            Some(match ss {
                0b01 => 1,
                0b10 => 2,
                0b11 => 4,
                _ => return None,
            })
        }

        #[bitmatch]
        match header {
            // Synchronization packet category
            "0000_0000" => {
                self.state = DecoderState::Syncing(8);
            }

            // Protocol packet category
            "0111_0000" => {
                return Ok(Some(TracePacket::Overflow));
            }
            "11rr_0000" => {
                // Local timestamp, format 1 (LTS1)
                let tc = r; // relationship with corresponding data

                self.state = DecoderState::LocalTimestamp {
                    data_relation: match tc {
                        0b00 => TimestampDataRelation::Sync,
                        0b01 => TimestampDataRelation::UnknownDelay,
                        0b10 => TimestampDataRelation::AssocEventDelay,
                        0b11 => TimestampDataRelation::UnknownAssocEventDelay,
                        _ => unreachable!(),
                    },
                    payload: vec![],
                };
            }
            "0ttt_0000" => {
                // Local timestamp, format 2 (LTS2); t = 0 and t = 7 are
                // covered by the synchronization and overflow matches
                // above
                return Ok(Some(TracePacket::LocalTimestamp2 { ts: t }));
            }

            // Source packet category
            "aaaa_a0ss" => {
                self.state = DecoderState::Source {
                    channel: a,
                    payload: vec![],
                    expected_size: if let Some(s) = translate_ss(s) {
                        s
                    } else {
                        return Err(MalformedPacket::InvalidSourcePayload { header, size: s });
                    },
                };
            }

            // Everything else (hardware source, global timestamp and
            // extension headers included) is outside the configured
            // stream and counts as an error frame upstream.
            "hhhh_hhhh" => return Err(MalformedPacket::InvalidHeader(h)),
        }

        Ok(None)
    }
}

/// Accumulates a continuation-bit encoded timestamp payload. `max_len`
/// is the bit width of the timestamp in the final payload byte's
/// encoding.
fn extract_timestamp(payload: &[u8], max_len: u32) -> u64 {
    // Decode the first N - 1 payload bytes
    let (rtail, head) = payload.split_at(payload.len() - 1);
    let mut ts: u64 = 0;
    for (i, b) in rtail.iter().enumerate() {
        ts |= ((b & !(1 << 7)) as u64) // mask out continuation bit
            << (7 * i);
    }

    // Mask out the timestamp's MSBs and shift them into the final
    // value.
    let shift = 7 - (max_len % 7);
    let mask: u8 = 0xFFu8.wrapping_shl(shift) >> shift;
    ts | (((head[0] & mask) as u64) << (7 * rtail.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pull_all(decoder: &mut Decoder) -> Vec<Result<TracePacket, MalformedPacket>> {
        let mut out = vec![];
        loop {
            match decoder.pull() {
                Ok(Some(packet)) => out.push(Ok(packet)),
                Ok(None) => break,
                Err(e) => out.push(Err(e)),
            }
        }
        out
    }

    #[test]
    fn extract_timestamp_continuation_bits() {
        #[rustfmt::skip]
        let ts: &[u8] = &[
            0b1000_0000,
            0b1000_0000,
            0b1000_0000,
            0b0000_0000,
        ];

        assert_eq!(extract_timestamp(ts, 27), 0);

        #[rustfmt::skip]
        let ts: &[u8] = &[
            0b1000_0001,
            0b1000_0111,
            0b1001_1111,
            0b0111_1111,
        ];

        assert_eq!(
            extract_timestamp(ts, 27),
            0b1111111_0011111_0000111_0000001,
        );
    }

    #[test]
    fn decode_source_packet_sizes() {
        let mut decoder = Decoder::new();
        #[rustfmt::skip]
        decoder.push(&[
            // channel 1, 1-byte payload
            0b0000_1001, 0xaa,
            // channel 2, 2-byte payload
            0b0001_0010, 0x34, 0x12,
            // channel 3, 4-byte payload
            0b0001_1011, 0x78, 0x56, 0x34, 0x12,
        ]);

        assert_eq!(
            pull_all(&mut decoder),
            vec![
                Ok(TracePacket::Source {
                    channel: 1,
                    payload: vec![0xaa],
                }),
                Ok(TracePacket::Source {
                    channel: 2,
                    payload: vec![0x34, 0x12],
                }),
                Ok(TracePacket::Source {
                    channel: 3,
                    payload: vec![0x78, 0x56, 0x34, 0x12],
                }),
            ]
        );
    }

    #[test]
    fn decode_local_timestamp_packets() {
        let mut decoder = Decoder::new();
        #[rustfmt::skip]
        decoder.push(&[
            // LTS1, delta 0b11001001
            0b1100_0000, 0b1100_1001, 0b0000_0001,
            // LTS1, delay class 3
            0b1111_0000, 0b0000_0010,
            // LTS2, delta 5
            0b0101_0000,
        ]);

        assert_eq!(
            pull_all(&mut decoder),
            vec![
                Ok(TracePacket::LocalTimestamp1 {
                    ts: 0b1100_1001,
                    data_relation: TimestampDataRelation::Sync,
                }),
                Ok(TracePacket::LocalTimestamp1 {
                    ts: 2,
                    data_relation: TimestampDataRelation::UnknownAssocEventDelay,
                }),
                Ok(TracePacket::LocalTimestamp2 { ts: 5 }),
            ]
        );
    }

    #[test]
    fn decode_overflow_packet() {
        let mut decoder = Decoder::new();
        decoder.push(&[0b0111_0000]);
        assert_eq!(pull_all(&mut decoder), vec![Ok(TracePacket::Overflow)]);
    }

    #[test]
    fn decode_sync_packet() {
        let mut decoder = Decoder::new();
        let mut stream = vec![0u8; 47 / 8];
        stream.push(1 << 7);
        decoder.push(&stream);

        assert_eq!(pull_all(&mut decoder), vec![Ok(TracePacket::Sync)]);
    }

    #[test]
    fn unknown_header_recovers() {
        let mut decoder = Decoder::new();
        #[rustfmt::skip]
        decoder.push(&[
            // global timestamp header, not part of the configured stream
            0b1001_0100,
            // a valid source packet afterwards
            0b0000_1001, 0x2a,
        ]);

        assert_eq!(
            pull_all(&mut decoder),
            vec![
                Err(MalformedPacket::InvalidHeader(0b1001_0100)),
                Ok(TracePacket::Source {
                    channel: 1,
                    payload: vec![0x2a],
                }),
            ]
        );
    }

    #[test]
    fn source_header_with_zero_size_is_malformed() {
        let mut decoder = Decoder::new();
        // extension packet header: matches the source pattern with a
        // zero size field
        decoder.push(&[0b0000_1000]);
        assert_eq!(
            pull_all(&mut decoder),
            vec![Err(MalformedPacket::InvalidSourcePayload {
                header: 0b0000_1000,
                size: 0,
            })]
        );
    }

    #[test]
    fn partial_packet_pulls_none() {
        let mut decoder = Decoder::new();
        decoder.push(&[0b0001_1011, 0x78, 0x56]); // 4-byte payload, 2 received
        assert_eq!(decoder.pull(), Ok(None));

        decoder.push(&[0x34, 0x12]);
        assert_eq!(
            decoder.pull(),
            Ok(Some(TracePacket::Source {
                channel: 3,
                payload: vec![0x78, 0x56, 0x34, 0x12],
            }))
        );
    }
}
