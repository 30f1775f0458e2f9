//! Agilent 82357A USB command set
//!
//! The adapter is a Cypress FX (8051) bridging USB to a TMS9914 GPIB
//! controller chip. Commands go out on the bulk OUT endpoint as small
//! little-endian frames; register commands answer on bulk IN with the
//! bitwise complement of the command byte followed by a status byte.

// Register and command names follow the TMS9914 datasheet and the firmware.
#![allow(missing_docs)]

use bytes::{BufMut, BytesMut};

use crate::bus::{BusConfig, PrimaryAddress};
use crate::error::{GpibError, GpibResult};

pub const VENDOR_ID: u16 = 0x0957;
pub const PRODUCT_ID: u16 = 0x0107;

pub const USB_CONFIGURATION: u8 = 1;
pub const USB_INTERFACE: u8 = 0;

pub const EP_BULK_IN: u8 = 0x82;
pub const EP_BULK_OUT: u8 = 0x04;
pub const EP_INTERRUPT_IN: u8 = 0x86;

/// Vendor control request carrying abort / status sub-commands in wValue.
pub const REQ_CONTROL: u8 = 4;
pub const WVALUE_ABORT_TRANSFER: u16 = 0x00a0;

/// Cypress FX firmware-load request, used to hold/release the 8051 in reset.
pub const REQ_FX_FIRMWARE: u8 = 0xa0;
pub const FX_CPUCS_ADDRESS: u16 = 0x7f92;

pub const CMD_WRITE: u8 = 1;
pub const CMD_READ: u8 = 3;
pub const CMD_WRITE_REGS: u8 = 4;
pub const CMD_READ_REGS: u8 = 5;

/// Header bytes preceding the payload of a WRITE frame.
pub const WRITE_HEADER_LEN: usize = 8;

/// Sentinel the firmware expects in the secondary address slot.
pub const NO_SECONDARY_ADDRESS: u8 = 0xff;

// TMS9914 direct-access registers
pub const TMS9914_IMR0: u8 = 0;
pub const TMS9914_IMR1: u8 = 1;
pub const TMS9914_ADDR_STATUS: u8 = 2;
pub const TMS9914_AUXCR: u8 = 3;
pub const TMS9914_BUS_STATUS: u8 = 3;
pub const TMS9914_ADDRESS: u8 = 4;
pub const TMS9914_SERIAL_POLL: u8 = 5;
pub const TMS9914_PARALLEL_POLL: u8 = 6;

// Firmware registers
pub const HARDWARE_CONTROL: u8 = 0x0a;
pub const LED_CONTROL: u8 = 0x0b;
pub const RESET_TO_POWERUP: u8 = 0x0c;
pub const PROTOCOL_CONTROL: u8 = 0x0d;
pub const FAST_TALKER_T1: u8 = 0x0e;

pub const PROTOCOL_WRITE_COMPLETE_INTERRUPT_EN: u8 = 0x01;
pub const LEDS_CONTROLLED_BY_FIRMWARE: u8 = 0x01;

pub const WRITE_XFER_FLAG_SEND_EOI: u8 = 0x01;

pub const READ_XFER_FLAG_END_ON_EOI: u8 = 0x01;
pub const READ_XFER_FLAG_END_ON_EOS: u8 = 0x04;

/// Bit in byte 0 of an interrupt packet signalling write completion.
pub const INTERRUPT_WRITE_COMPLETE: u8 = 0x02;
pub const INTERRUPT_PACKET_LEN: usize = 8;

// TMS9914 auxiliary commands (bit 7 = set/clear for the set/clear type)
pub const AUX_CS: u8 = 0x80;
pub const AUX_SOFT_RESET: u8 = 0x00;
pub const AUX_DACR: u8 = 0x01;
pub const AUX_HDFE: u8 = 0x04;
pub const AUX_NBAF: u8 = 0x05;
pub const AUX_LON: u8 = 0x09;
pub const AUX_TON: u8 = 0x0a;
pub const AUX_TCA: u8 = 0x0c;
pub const AUX_RPP: u8 = 0x0e;
pub const AUX_SIC: u8 = 0x0f;
pub const AUX_SRE: u8 = 0x10;
pub const AUX_STDL: u8 = 0x15;
pub const AUX_VSTDL: u8 = 0x17;
pub const AUX_RSV2: u8 = 0x18;

pub const IMR0_BOIE: u8 = 0x10;
pub const IMR1_SRQIE: u8 = 0x02;

/// One register write.
pub type RegWrite = (u8, u8);

/// Register writes that bring the TMS9914 and firmware up as system
/// controller at `controller_address`.
pub fn init_sequence(controller_address: PrimaryAddress) -> Vec<RegWrite> {
    vec![
        // Power on adapter hardware
        (HARDWARE_CONTROL, 0x07),
        (LED_CONTROL, LEDS_CONTROLLED_BY_FIRMWARE),
        // TMS9914
        (TMS9914_AUXCR, AUX_SOFT_RESET | AUX_CS),
        (TMS9914_IMR0, IMR0_BOIE),
        (TMS9914_IMR1, IMR1_SRQIE),
        (TMS9914_AUXCR, AUX_NBAF),
        (TMS9914_AUXCR, AUX_HDFE),
        (TMS9914_AUXCR, AUX_TON),
        (TMS9914_AUXCR, AUX_LON),
        (TMS9914_AUXCR, AUX_RSV2),
        (TMS9914_AUXCR, AUX_DACR),
        (TMS9914_AUXCR, AUX_RPP),
        (TMS9914_AUXCR, AUX_STDL | AUX_CS),
        (TMS9914_AUXCR, AUX_VSTDL),
        (TMS9914_ADDRESS, controller_address.value() & 0x1f),
        (TMS9914_SERIAL_POLL, 0),
        (TMS9914_PARALLEL_POLL, 0),
        (TMS9914_AUXCR, AUX_SOFT_RESET),
        (TMS9914_AUXCR, AUX_SRE | AUX_CS),
        (TMS9914_AUXCR, AUX_TCA),
        // Firmware and protocol parameters
        (FAST_TALKER_T1, 0x27),
        (PROTOCOL_CONTROL, PROTOCOL_WRITE_COMPLETE_INTERRUPT_EN),
    ]
}

/// Length field of a WRITE frame.
pub fn write_len(len: usize) -> GpibResult<u32> {
    u32::try_from(len).map_err(|_| {
        GpibError::Protocol(format!("message of {} bytes is too long for one WRITE", len))
    })
}

/// `[CMD_WRITE, addr, 0xff, flags, len:u32le, payload...]`
pub fn encode_write(
    address: PrimaryAddress,
    data: &[u8],
    config: &BusConfig,
) -> GpibResult<Vec<u8>> {
    let len = write_len(data.len())?;
    let mut flags = 0;
    if config.send_eoi {
        flags |= WRITE_XFER_FLAG_SEND_EOI;
    }

    let mut frame = BytesMut::with_capacity(WRITE_HEADER_LEN + data.len());
    frame.put_u8(CMD_WRITE);
    frame.put_u8(address.value());
    frame.put_u8(NO_SECONDARY_ADDRESS);
    frame.put_u8(flags);
    frame.put_u32_le(len);
    frame.put_slice(data);
    Ok(frame.to_vec())
}

/// `[CMD_READ, addr, 0xff, flags, max_len:u32le, eos]`
pub fn encode_read(address: PrimaryAddress, max_len: u32, config: &BusConfig) -> Vec<u8> {
    let mut flags = 0;
    if config.end_read_on_eoi {
        flags |= READ_XFER_FLAG_END_ON_EOI;
    }
    if config.end_read_on_eos {
        flags |= READ_XFER_FLAG_END_ON_EOS;
    }

    let mut frame = BytesMut::with_capacity(9);
    frame.put_u8(CMD_READ);
    frame.put_u8(address.value());
    frame.put_u8(NO_SECONDARY_ADDRESS);
    frame.put_u8(flags);
    frame.put_u32_le(max_len);
    frame.put_u8(config.eos_char);
    frame.to_vec()
}

/// `[CMD_WRITE_REGS, n, (reg, value) * n]`
pub fn encode_write_regs(writes: &[RegWrite]) -> Vec<u8> {
    let mut frame = BytesMut::with_capacity(2 + 2 * writes.len());
    frame.put_u8(CMD_WRITE_REGS);
    frame.put_u8(writes.len() as u8);
    for (reg, value) in writes {
        frame.put_u8(*reg);
        frame.put_u8(*value);
    }
    frame.to_vec()
}

/// `[CMD_READ_REGS, n, reg * n]`
pub fn encode_read_regs(regs: &[u8]) -> Vec<u8> {
    let mut frame = BytesMut::with_capacity(2 + regs.len());
    frame.put_u8(CMD_READ_REGS);
    frame.put_u8(regs.len() as u8);
    frame.put_slice(regs);
    frame.to_vec()
}

/// Validate a register command reply and return the bytes after the status.
pub fn parse_reply(command: u8, reply: &[u8], extra_bytes: usize) -> GpibResult<Vec<u8>> {
    let expected = 2 + extra_bytes;
    if reply.len() < expected {
        return Err(GpibError::Protocol(format!(
            "short reply to command 0x{:02x}: expected {} bytes, got {}",
            command,
            expected,
            reply.len()
        )));
    }
    if reply[0] != !command {
        return Err(GpibError::Protocol(format!(
            "reply 0x{:02x} does not match command 0x{:02x}",
            reply[0], command
        )));
    }
    if reply[1] != 0 {
        return Err(GpibError::AdapterStatus {
            command,
            code: reply[1],
        });
    }
    Ok(reply[2..expected].to_vec())
}

/// Strip the trailer byte the firmware appends to read data.
pub fn strip_read_trailer(mut reply: Vec<u8>) -> Vec<u8> {
    reply.pop();
    reply
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(value: u8) -> PrimaryAddress {
        PrimaryAddress::new(value).unwrap()
    }

    #[test]
    fn test_encode_write_with_eoi() {
        let frame = encode_write(addr(22), b"ID?", &BusConfig::default()).unwrap();
        assert_eq!(frame, vec![1, 22, 0xff, 0x01, 3, 0, 0, 0, b'I', b'D', b'?']);
    }

    #[test]
    fn test_encode_write_without_eoi() {
        let config = BusConfig::default().with_send_eoi(false);
        let frame = encode_write(addr(5), b"", &config).unwrap();
        assert_eq!(frame, vec![1, 5, 0xff, 0x00, 0, 0, 0, 0]);
    }

    #[test]
    fn test_write_len_rejects_oversized_messages() {
        assert_eq!(write_len(3).unwrap(), 3);
        assert_eq!(write_len(u32::MAX as usize).unwrap(), u32::MAX);
        if let Some(too_long) = (u32::MAX as usize).checked_add(1) {
            assert!(matches!(write_len(too_long), Err(GpibError::Protocol(_))));
        }
    }

    #[test]
    fn test_encode_read_flags_follow_config() {
        let frame = encode_read(addr(22), 1024, &BusConfig::default());
        assert_eq!(frame, vec![3, 22, 0xff, 0x01, 0x00, 0x04, 0, 0, b'\n']);

        let config = BusConfig::default()
            .with_end_read_on_eoi(false)
            .with_eos(b'\r');
        let frame = encode_read(addr(1), 16, &config);
        assert_eq!(frame, vec![3, 1, 0xff, 0x04, 16, 0, 0, 0, b'\r']);
    }

    #[test]
    fn test_encode_register_frames() {
        assert_eq!(
            encode_write_regs(&[(RESET_TO_POWERUP, 1)]),
            vec![4, 1, 0x0c, 1]
        );
        assert_eq!(
            encode_read_regs(&[TMS9914_ADDR_STATUS, TMS9914_BUS_STATUS]),
            vec![5, 2, 2, 3]
        );
    }

    #[test]
    fn test_init_sequence_masks_controller_address() {
        let seq = init_sequence(addr(10));
        assert_eq!(seq.len(), 22);
        assert_eq!(seq[0], (HARDWARE_CONTROL, 0x07));
        assert!(seq.contains(&(TMS9914_ADDRESS, 10)));
        assert_eq!(
            seq.last(),
            Some(&(PROTOCOL_CONTROL, PROTOCOL_WRITE_COMPLETE_INTERRUPT_EN))
        );
    }

    #[test]
    fn test_parse_reply_ok() {
        let values = parse_reply(CMD_READ_REGS, &[!CMD_READ_REGS, 0, 0x12, 0x34], 2).unwrap();
        assert_eq!(values, vec![0x12, 0x34]);
        assert!(parse_reply(CMD_WRITE_REGS, &[0xfb, 0], 0).unwrap().is_empty());
    }

    #[test]
    fn test_parse_reply_errors() {
        assert!(matches!(
            parse_reply(CMD_WRITE_REGS, &[0xfb], 0),
            Err(GpibError::Protocol(_))
        ));
        assert!(matches!(
            parse_reply(CMD_WRITE_REGS, &[0xfa, 0], 0),
            Err(GpibError::Protocol(_))
        ));
        assert!(matches!(
            parse_reply(CMD_WRITE_REGS, &[0xfb, 2], 0),
            Err(GpibError::AdapterStatus { command: 4, code: 2 })
        ));
    }

    #[test]
    fn test_strip_read_trailer() {
        assert_eq!(strip_read_trailer(b"HP3457A\r\n\x00".to_vec()), b"HP3457A\r\n");
        assert!(strip_read_trailer(Vec::new()).is_empty());
    }
}
