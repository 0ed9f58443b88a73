//! Binary codec for the trainer's BLE command characteristic.
//!
//! Everything in this module is a pure function over byte buffers; no state,
//! no suspension. Outbound packets are fixed-size per opcode and never
//! mutated after construction. Inbound notification frames decode to a
//! [`Notification`] or fail with a recoverable error that the telemetry
//! pipeline logs and drops.
//!
//! Weight travels in two encodings depending on the packet: `u16`
//! little-endian kg×10 in the short command packets, and IEEE-754 `f32`
//! little-endian at fixed offsets in the PROGRAM PARAMS packet. Rep counts
//! are a single byte equal to warmup reps + target reps, with `0xFF` reserved
//! as the "unlimited" sentinel.

use crate::{
    error::{Result, TrainerError},
    types::{RepPhase, Rgb, TelemetrySample},
};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Rep byte value meaning "no rep limit"
pub const REPS_UNLIMITED: u8 = 0xFF;

/// Size of the START packet in bytes
pub const START_SIZE: usize = 4;
/// Size of the PROGRAM PARAMS packet in bytes
pub const PROGRAM_PARAMS_SIZE: usize = 96;
/// Size of the STOP packet in bytes
pub const STOP_SIZE: usize = 4;
/// Size of the INIT/RESET packet in bytes
pub const INIT_RESET_SIZE: usize = 4;
/// Size of the color preset packet in bytes
pub const COLOR_PRESET_SIZE: usize = 34;
/// Size of the echo control packet in bytes
pub const ECHO_CONTROL_SIZE: usize = 32;
/// Size of the device-native stop packet in bytes
pub const TENSION_RELEASE_SIZE: usize = 2;

/// Byte offset of the concentric weight (`f32` LE) in PROGRAM PARAMS
pub const PROGRAM_WEIGHT_OFFSET: usize = 0x54;
/// Byte offset of the eccentric weight (`f32` LE) in PROGRAM PARAMS
pub const PROGRAM_ECCENTRIC_WEIGHT_OFFSET: usize = 0x58;

/// Maximum cable weight the protocol can carry, in kilograms
pub const MAX_WEIGHT_KG: f32 = 200.0;

/// Outbound command opcodes (first payload byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandId {
    /// Begin the active workout
    Start = 0x03,
    /// Full session configuration
    ProgramParams = 0x04,
    /// Primary stop, always a forced send
    Stop = 0x05,
    /// Initialization/reset, sent on connect
    InitReset = 0x0A,
    /// LED color preset: brightness plus the six-color scheme
    ColorPreset = 0x11,
    /// Adaptive-resistance (echo mode) session configuration
    EchoControl = 0x4E,
    /// Device-native stop; clears a fault and releases cable tension
    TensionRelease = 0x50,
}

impl CommandId {
    /// Convert from u8
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x03 => Some(Self::Start),
            0x04 => Some(Self::ProgramParams),
            0x05 => Some(Self::Stop),
            0x0A => Some(Self::InitReset),
            0x11 => Some(Self::ColorPreset),
            0x4E => Some(Self::EchoControl),
            0x50 => Some(Self::TensionRelease),
            _ => None,
        }
    }

    /// Exact packet size for this opcode, including the opcode byte
    #[must_use]
    pub const fn packet_size(self) -> usize {
        match self {
            Self::Start => START_SIZE,
            Self::ProgramParams => PROGRAM_PARAMS_SIZE,
            Self::Stop => STOP_SIZE,
            Self::InitReset => INIT_RESET_SIZE,
            Self::ColorPreset => COLOR_PRESET_SIZE,
            Self::EchoControl => ECHO_CONTROL_SIZE,
            Self::TensionRelease => TENSION_RELEASE_SIZE,
        }
    }
}

/// Typed fields of the PROGRAM PARAMS (0x04) packet
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgramParams {
    /// Warmup reps preceding the working reps
    pub warmup_reps: u8,
    /// Working reps; `None` encodes the unlimited sentinel
    pub target_reps: Option<u8>,
    /// Number of sets programmed for the exercise
    pub set_count: u8,
    /// Rest between sets in seconds
    pub rest_seconds: u16,
    /// Concentric cable weight in kilograms
    pub weight_kg: f32,
    /// Eccentric cable weight in kilograms
    pub eccentric_weight_kg: f32,
}

/// Typed fields of the echo control (0x4E) packet
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EchoConfig {
    /// Responsiveness of the adaptive resistance, 0..=10
    pub intensity: u8,
    /// Floor weight the machine never drops below, in kilograms
    pub base_weight_kg: f32,
    /// Eccentric load as a percentage of the concentric load, 50..=150
    pub eccentric_pct: u8,
}

/// An outbound command packet
///
/// Variants carry their typed fields; [`encode`] turns each into an
/// exact-length byte sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Begin the active workout with the short weight/rep configuration
    Start {
        /// Cable weight in kilograms (u16 LE kg×10 on the wire)
        weight_kg: f32,
        /// Warmup reps folded into the rep byte
        warmup_reps: u8,
        /// Working reps; `None` sends the unlimited sentinel
        target_reps: Option<u8>,
    },
    /// Full session configuration
    ProgramParams(ProgramParams),
    /// Primary stop
    Stop,
    /// Initialization/reset handshake
    InitReset,
    /// LED brightness and six-color scheme
    ColorPreset {
        /// Brightness, 0.0..=1.0
        brightness: f32,
        /// The six zone colors, in color-index order
        colors: [Rgb; 6],
    },
    /// Adaptive-resistance session configuration
    EchoControl(EchoConfig),
    /// Device-native stop / tension release
    TensionRelease,
}

impl Command {
    /// Opcode for this command
    #[must_use]
    pub const fn id(&self) -> CommandId {
        match self {
            Self::Start { .. } => CommandId::Start,
            Self::ProgramParams(_) => CommandId::ProgramParams,
            Self::Stop => CommandId::Stop,
            Self::InitReset => CommandId::InitReset,
            Self::ColorPreset { .. } => CommandId::ColorPreset,
            Self::EchoControl(_) => CommandId::EchoControl,
            Self::TensionRelease => CommandId::TensionRelease,
        }
    }
}

/// Encode a cable weight into the short-packet `u16` kg×10 representation
///
/// # Errors
///
/// Returns [`TrainerError::Encoding`] if the weight is negative, NaN, or
/// above [`MAX_WEIGHT_KG`].
pub fn encode_weight_short(weight_kg: f32) -> Result<u16> {
    if !weight_kg.is_finite() || !(0.0..=MAX_WEIGHT_KG).contains(&weight_kg) {
        return Err(TrainerError::Encoding(format!(
            "weight {weight_kg} kg out of range (0.0 - {MAX_WEIGHT_KG})"
        )));
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Ok((weight_kg * 10.0).round() as u16)
}

/// Decode a short-packet weight back to kilograms
#[must_use]
pub fn decode_weight_short(raw: u16) -> f32 {
    f32::from(raw) / 10.0
}

/// Fold warmup and target reps into the single rep byte
///
/// `None` target reps encode the [`REPS_UNLIMITED`] sentinel; otherwise the
/// byte is warmup + target.
///
/// # Errors
///
/// Returns [`TrainerError::Encoding`] if the sum collides with the sentinel
/// or overflows the byte.
pub fn encode_reps(warmup_reps: u8, target_reps: Option<u8>) -> Result<u8> {
    match target_reps {
        None => Ok(REPS_UNLIMITED),
        Some(target) => {
            let total = u16::from(warmup_reps) + u16::from(target);
            if total >= u16::from(REPS_UNLIMITED) {
                return Err(TrainerError::Encoding(format!(
                    "rep count {total} exceeds protocol limit ({})",
                    REPS_UNLIMITED - 1
                )));
            }
            #[allow(clippy::cast_possible_truncation)]
            Ok(total as u8)
        }
    }
}

fn validate_program_weight(label: &str, weight_kg: f32) -> Result<()> {
    if !weight_kg.is_finite() || !(0.0..=MAX_WEIGHT_KG).contains(&weight_kg) {
        return Err(TrainerError::Encoding(format!(
            "{label} weight {weight_kg} kg out of range (0.0 - {MAX_WEIGHT_KG})"
        )));
    }
    Ok(())
}

/// Encode an outbound command into its exact-length packet
///
/// # Errors
///
/// Returns [`TrainerError::Encoding`] if any field violates its documented
/// range. Validation happens before any bytes are produced.
pub fn encode(command: &Command) -> Result<Bytes> {
    let size = command.id().packet_size();
    let mut buf = BytesMut::with_capacity(size);

    match command {
        Command::Start {
            weight_kg,
            warmup_reps,
            target_reps,
        } => {
            let weight = encode_weight_short(*weight_kg)?;
            let reps = encode_reps(*warmup_reps, *target_reps)?;
            buf.put_u8(CommandId::Start as u8);
            buf.put_u16_le(weight);
            buf.put_u8(reps);
        }
        Command::ProgramParams(params) => {
            validate_program_weight("concentric", params.weight_kg)?;
            validate_program_weight("eccentric", params.eccentric_weight_kg)?;
            let reps = encode_reps(params.warmup_reps, params.target_reps)?;

            buf.put_u8(CommandId::ProgramParams as u8);
            buf.put_bytes(0, 3);
            buf.put_u8(reps);
            buf.put_u8(params.set_count);
            buf.put_u16_le(params.rest_seconds);
            // Reserved region up to the weight block
            buf.put_bytes(0, PROGRAM_WEIGHT_OFFSET - buf.len());
            buf.put_f32_le(params.weight_kg);
            buf.put_f32_le(params.eccentric_weight_kg);
            buf.put_bytes(0, PROGRAM_PARAMS_SIZE - buf.len());
        }
        Command::Stop => {
            buf.put_u8(CommandId::Stop as u8);
            buf.put_bytes(0, STOP_SIZE - 1);
        }
        Command::InitReset => {
            buf.put_u8(CommandId::InitReset as u8);
            buf.put_bytes(0, INIT_RESET_SIZE - 1);
        }
        Command::ColorPreset { brightness, colors } => {
            if !brightness.is_finite() || !(0.0..=1.0).contains(brightness) {
                return Err(TrainerError::Encoding(format!(
                    "brightness {brightness} out of range (0.0 - 1.0)"
                )));
            }
            buf.put_u8(CommandId::ColorPreset as u8);
            // Zero header: opcode plus eleven reserved bytes
            buf.put_bytes(0, 11);
            buf.put_f32_le(*brightness);
            for color in colors {
                buf.put_u8(color.r);
                buf.put_u8(color.g);
                buf.put_u8(color.b);
            }
        }
        Command::EchoControl(config) => {
            if config.intensity > 10 {
                return Err(TrainerError::Encoding(format!(
                    "echo intensity {} out of range (0 - 10)",
                    config.intensity
                )));
            }
            if !(50..=150).contains(&config.eccentric_pct) {
                return Err(TrainerError::Encoding(format!(
                    "eccentric percentage {} out of range (50 - 150)",
                    config.eccentric_pct
                )));
            }
            let base = encode_weight_short(config.base_weight_kg)?;
            buf.put_u8(CommandId::EchoControl as u8);
            buf.put_u8(config.intensity);
            buf.put_u16_le(base);
            buf.put_u8(config.eccentric_pct);
            buf.put_bytes(0, ECHO_CONTROL_SIZE - buf.len());
        }
        Command::TensionRelease => {
            buf.put_u8(CommandId::TensionRelease as u8);
            buf.put_u8(0);
        }
    }

    debug_assert_eq!(buf.len(), size);
    Ok(buf.freeze())
}

/// Inbound notification opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NotificationId {
    /// Periodic motion telemetry sample
    Motion = 0x60,
    /// A rep boundary was detected by the machine
    RepBoundary = 0x61,
    /// Adaptive-resistance load feedback
    LoadFeedback = 0x62,
    /// Fault condition report
    Fault = 0x63,
}

/// Fault codes reported by the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultCode {
    /// Cable has gone slack
    CableSlack,
    /// Load dropped unexpectedly mid-rep
    Deload,
    /// Motor overload protection tripped
    Overload,
    /// Unrecognized fault byte
    Unknown(u8),
}

impl From<u8> for FaultCode {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::CableSlack,
            1 => Self::Deload,
            2 => Self::Overload,
            other => Self::Unknown(other),
        }
    }
}

/// A decoded inbound frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Notification {
    /// Motion telemetry sample
    Motion(TelemetrySample),
    /// Rep boundary event
    RepBoundary {
        /// Machine-side rep counter, resets with each set
        rep_count: u16,
        /// Phase the boundary closed (a full rep ends its eccentric phase)
        phase: RepPhase,
        /// Duration of the completed rep in milliseconds
        duration_ms: u32,
    },
    /// Resistance-level feedback used by the auto/load-matching resolver
    LoadFeedback {
        /// Current adaptive resistance level in kilograms
        resistance_kg: f32,
    },
    /// Fault condition
    Fault {
        /// Reported fault code
        code: FaultCode,
    },
}

fn require_len(data: &[u8], wanted: usize) -> Result<()> {
    if data.len() < wanted {
        return Err(TrainerError::Decode(format!(
            "frame too short: {} bytes, expected {wanted}",
            data.len()
        )));
    }
    Ok(())
}

fn decode_phase(byte: u8) -> RepPhase {
    if byte == 0 {
        RepPhase::Concentric
    } else {
        RepPhase::Eccentric
    }
}

/// Decode an inbound notification frame
///
/// # Errors
///
/// Returns [`TrainerError::UnknownOpcode`] for unrecognized opcodes and
/// [`TrainerError::Decode`] for truncated frames. Both are recoverable: the
/// telemetry pipeline logs the frame and drops it.
pub fn decode(data: &[u8]) -> Result<Notification> {
    let Some((&opcode, rest)) = data.split_first() else {
        return Err(TrainerError::Decode("empty frame".to_string()));
    };

    match opcode {
        0x60 => {
            require_len(rest, 11)?;
            let mut buf = rest;
            let phase = decode_phase(buf.get_u8());
            let position_mm = buf.get_u16_le();
            let velocity = buf.get_f32_le();
            let force = buf.get_f32_le();
            Ok(Notification::Motion(TelemetrySample {
                velocity,
                force,
                position_mm,
                phase,
            }))
        }
        0x61 => {
            require_len(rest, 7)?;
            let mut buf = rest;
            let phase = decode_phase(buf.get_u8());
            let rep_count = buf.get_u16_le();
            let duration_ms = buf.get_u32_le();
            Ok(Notification::RepBoundary {
                rep_count,
                phase,
                duration_ms,
            })
        }
        0x62 => {
            require_len(rest, 5)?;
            let mut buf = rest;
            buf.advance(1); // reserved
            let resistance_kg = buf.get_f32_le();
            Ok(Notification::LoadFeedback { resistance_kg })
        }
        0x63 => {
            require_len(rest, 1)?;
            Ok(Notification::Fault {
                code: FaultCode::from(rest[0]),
            })
        }
        other => Err(TrainerError::UnknownOpcode { opcode: other }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_sizes_match_opcode_table() {
        let commands = [
            (
                Command::Start {
                    weight_kg: 20.0,
                    warmup_reps: 2,
                    target_reps: Some(10),
                },
                4,
            ),
            (
                Command::ProgramParams(ProgramParams {
                    warmup_reps: 2,
                    target_reps: Some(10),
                    set_count: 3,
                    rest_seconds: 90,
                    weight_kg: 30.0,
                    eccentric_weight_kg: 36.0,
                }),
                96,
            ),
            (Command::Stop, 4),
            (Command::InitReset, 4),
            (
                Command::ColorPreset {
                    brightness: 1.0,
                    colors: [Rgb::new(0, 0, 0); 6],
                },
                34,
            ),
            (
                Command::EchoControl(EchoConfig {
                    intensity: 5,
                    base_weight_kg: 8.0,
                    eccentric_pct: 100,
                }),
                32,
            ),
            (Command::TensionRelease, 2),
        ];

        for (command, expected) in commands {
            let bytes = encode(&command).unwrap();
            assert_eq!(bytes.len(), expected, "size mismatch for {command:?}");
            assert_eq!(bytes[0], command.id() as u8);
        }
    }

    #[test]
    fn test_start_packet_layout() {
        let bytes = encode(&Command::Start {
            weight_kg: 27.5,
            warmup_reps: 2,
            target_reps: Some(8),
        })
        .unwrap();

        // kg x 10 as u16 LE, then warmup + target in one byte
        assert_eq!(&bytes[1..3], &275u16.to_le_bytes());
        assert_eq!(bytes[3], 10);
    }

    #[test]
    fn test_unlimited_reps_sentinel() {
        let bytes = encode(&Command::Start {
            weight_kg: 15.0,
            warmup_reps: 3,
            target_reps: None,
        })
        .unwrap();
        assert_eq!(bytes[3], REPS_UNLIMITED);
    }

    #[test]
    fn test_rep_overflow_fails_before_encoding() {
        let result = encode(&Command::Start {
            weight_kg: 15.0,
            warmup_reps: 200,
            target_reps: Some(100),
        });
        assert!(matches!(result, Err(TrainerError::Encoding(_))));
    }

    #[test]
    fn test_weight_out_of_range_fails() {
        assert!(encode_weight_short(-1.0).is_err());
        assert!(encode_weight_short(f32::NAN).is_err());
        assert!(encode_weight_short(MAX_WEIGHT_KG + 0.1).is_err());
        assert_eq!(encode_weight_short(44.1).unwrap(), 441);
    }

    #[test]
    fn test_program_params_weight_round_trip() {
        let bytes = encode(&Command::ProgramParams(ProgramParams {
            warmup_reps: 0,
            target_reps: Some(12),
            set_count: 4,
            rest_seconds: 120,
            weight_kg: 44.1,
            eccentric_weight_kg: 52.9,
        }))
        .unwrap();

        let weight = f32::from_le_bytes(
            bytes[PROGRAM_WEIGHT_OFFSET..PROGRAM_WEIGHT_OFFSET + 4]
                .try_into()
                .unwrap(),
        );
        let eccentric = f32::from_le_bytes(
            bytes[PROGRAM_ECCENTRIC_WEIGHT_OFFSET..PROGRAM_ECCENTRIC_WEIGHT_OFFSET + 4]
                .try_into()
                .unwrap(),
        );

        assert!((weight - 44.1).abs() < f32::EPSILON * 64.0);
        assert!((eccentric - 52.9).abs() < f32::EPSILON * 64.0);
    }

    #[test]
    fn test_color_preset_layout() {
        let mut colors = [Rgb::new(0, 0, 0); 6];
        colors[0] = Rgb::new(0x10, 0x20, 0x30);
        colors[5] = Rgb::new(0xAA, 0xBB, 0xCC);

        let bytes = encode(&Command::ColorPreset {
            brightness: 0.5,
            colors,
        })
        .unwrap();

        // Twelve-byte zero header (opcode plus reserved), then f32 brightness
        assert!(bytes[1..12].iter().all(|b| *b == 0));
        assert_eq!(&bytes[12..16], &0.5f32.to_le_bytes());
        assert_eq!(&bytes[16..19], &[0x10, 0x20, 0x30]);
        assert_eq!(&bytes[31..34], &[0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn test_color_preset_brightness_range() {
        let result = encode(&Command::ColorPreset {
            brightness: 1.5,
            colors: [Rgb::new(0, 0, 0); 6],
        });
        assert!(matches!(result, Err(TrainerError::Encoding(_))));
    }

    #[test]
    fn test_echo_control_validation() {
        let bad_intensity = Command::EchoControl(EchoConfig {
            intensity: 11,
            base_weight_kg: 5.0,
            eccentric_pct: 100,
        });
        assert!(encode(&bad_intensity).is_err());

        let bad_pct = Command::EchoControl(EchoConfig {
            intensity: 5,
            base_weight_kg: 5.0,
            eccentric_pct: 40,
        });
        assert!(encode(&bad_pct).is_err());
    }

    #[test]
    fn test_short_weight_round_trip() {
        let raw = encode_weight_short(44.1).unwrap();
        assert!((decode_weight_short(raw) - 44.1).abs() < 0.05);
    }

    #[test]
    fn test_motion_frame_decode() {
        let mut frame = vec![0x60, 0x00];
        frame.extend_from_slice(&350u16.to_le_bytes());
        frame.extend_from_slice(&0.62f32.to_le_bytes());
        frame.extend_from_slice(&210.5f32.to_le_bytes());

        let decoded = decode(&frame).unwrap();
        match decoded {
            Notification::Motion(sample) => {
                assert_eq!(sample.phase, RepPhase::Concentric);
                assert_eq!(sample.position_mm, 350);
                assert!((sample.velocity - 0.62).abs() < f32::EPSILON);
                assert!((sample.force - 210.5).abs() < f32::EPSILON);
            }
            other => panic!("expected motion sample, got {other:?}"),
        }
    }

    #[test]
    fn test_rep_boundary_decode() {
        let mut frame = vec![0x61, 0x01];
        frame.extend_from_slice(&7u16.to_le_bytes());
        frame.extend_from_slice(&2400u32.to_le_bytes());

        let decoded = decode(&frame).unwrap();
        assert_eq!(
            decoded,
            Notification::RepBoundary {
                rep_count: 7,
                phase: RepPhase::Eccentric,
                duration_ms: 2400,
            }
        );
    }

    #[test]
    fn test_fault_decode() {
        assert_eq!(
            decode(&[0x63, 0x00]).unwrap(),
            Notification::Fault {
                code: FaultCode::CableSlack
            }
        );
        assert_eq!(
            decode(&[0x63, 0x07]).unwrap(),
            Notification::Fault {
                code: FaultCode::Unknown(7)
            }
        );
    }

    #[test]
    fn test_unknown_opcode_is_recoverable() {
        let err = decode(&[0x7F, 0x00, 0x00]).unwrap_err();
        assert!(matches!(err, TrainerError::UnknownOpcode { opcode: 0x7F }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_truncated_frame_is_recoverable() {
        let err = decode(&[0x60, 0x00, 0x01]).unwrap_err();
        assert!(matches!(err, TrainerError::Decode(_)));
        assert!(err.is_recoverable());
    }
}
