// Dynamixel Protocol 2.0 over a serial port
//
// Packet format: [0xFF, 0xFF, 0xFD, 0x00, ID, Len_L, Len_H, Instruction, Params..., CRC_L, CRC_H]
// Length counts instruction + params + CRC. Instruction and params are byte-stuffed.

use serialport::{self, ClearBuffer, SerialPort};
use std::io::{Read, Write};
use std::time::Duration;
use tracing::{debug, info};

use super::bus::{BROADCAST_ID, BusError, Register, Result, ServoBus};

/// Default serial configuration for Dynamixel servos
pub const DEFAULT_BAUDRATE: u32 = 57_600;
pub const DEFAULT_TIMEOUT_MS: u64 = 100;

/// Packet header bytes
const HEADER: [u8; 4] = [0xFF, 0xFF, 0xFD, 0x00];

/// Sequence that must never appear inside a packet body
const STUFF_PATTERN: [u8; 3] = [0xFF, 0xFF, 0xFD];

/// Instruction set
#[repr(u8)]
#[derive(Debug, Clone, Copy)]
pub enum Instruction {
    Ping = 0x01,
    Read = 0x02,
    Write = 0x03,
    Status = 0x55,
    SyncRead = 0x82,
    SyncWrite = 0x83,
}

/// CRC-16 (polynomial 0x8005, MSB first, initial value 0)
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x8005
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Insert 0xFD after every 0xFF 0xFF 0xFD
fn stuff(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 2);
    for &byte in body {
        out.push(byte);
        if out.ends_with(&STUFF_PATTERN) {
            out.push(0xFD);
        }
    }
    out
}

/// Drop the 0xFD inserted by `stuff`
fn unstuff(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    let mut i = 0;
    while i < body.len() {
        out.push(body[i]);
        if out.ends_with(&STUFF_PATTERN) && body.get(i + 1) == Some(&0xFD) {
            i += 1;
        }
        i += 1;
    }
    out
}

fn le_bytes(value: u32, size: u16) -> Vec<u8> {
    value.to_le_bytes()[..size as usize].to_vec()
}

fn from_le_bytes(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .rev()
        .fold(0u32, |acc, &byte| (acc << 8) | byte as u32)
}

/// Dynamixel servo bus - handles serial communication with servos
pub struct DynamixelBus {
    port: Box<dyn SerialPort>,
}

impl DynamixelBus {
    /// Open a new connection to the servo bus
    pub fn open(port_name: &str) -> Result<Self> {
        Self::open_with_baudrate(port_name, DEFAULT_BAUDRATE)
    }

    /// Open with custom baudrate
    pub fn open_with_baudrate(port_name: &str, baudrate: u32) -> Result<Self> {
        info!("Opening Dynamixel bus on {} at {} baud", port_name, baudrate);
        let port = serialport::new(port_name, baudrate)
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .open()?;

        Ok(Self { port })
    }

    /// Build a packet with header, stuffed body and CRC
    fn build_packet(id: u8, instruction: Instruction, params: &[u8]) -> Vec<u8> {
        let mut body = Vec::with_capacity(params.len() + 1);
        body.push(instruction as u8);
        body.extend_from_slice(params);
        let body = stuff(&body);

        let length = (body.len() + 2) as u16; // body + CRC
        let mut packet = Vec::with_capacity(HEADER.len() + 3 + body.len() + 2);
        packet.extend_from_slice(&HEADER);
        packet.push(id);
        packet.extend_from_slice(&length.to_le_bytes());
        packet.extend_from_slice(&body);

        let crc = crc16(&packet);
        packet.extend_from_slice(&crc.to_le_bytes());
        packet
    }

    /// Check a complete status packet and return its parameters
    fn parse_status(expected_id: u8, packet: &[u8]) -> Result<Vec<u8>> {
        let invalid = |reason: String| BusError::InvalidResponse {
            id: expected_id,
            reason,
        };

        if packet.len() < HEADER.len() + 3 + 4 {
            return Err(invalid(format!("Packet too short: {} bytes", packet.len())));
        }
        if packet[..4] != HEADER {
            return Err(invalid(format!("Invalid header: {:02X?}", &packet[..4])));
        }

        let id = packet[4];
        if id != expected_id {
            return Err(invalid(format!(
                "ID mismatch: expected {}, got {}",
                expected_id, id
            )));
        }

        let (frame, crc_bytes) = packet.split_at(packet.len() - 2);
        if crc16(frame) != u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]) {
            return Err(BusError::CrcMismatch { id });
        }

        // Instruction, error, params...
        let body = unstuff(&frame[7..]);
        if body.len() < 2 || body[0] != Instruction::Status as u8 {
            return Err(invalid(format!("Not a status packet: {:02X?}", body)));
        }

        let error_status = body[1];
        if error_status != 0 {
            return Err(BusError::ServoError {
                id,
                status: error_status,
            });
        }

        Ok(body[2..].to_vec())
    }

    /// Send a packet, discarding any stale input first
    fn send_packet(&mut self, packet: &[u8]) -> Result<()> {
        self.port.clear(ClearBuffer::Input)?;
        self.port.write_all(packet)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8], expected_id: u8) -> Result<()> {
        self.port.read_exact(buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                BusError::Timeout { id: expected_id }
            } else {
                BusError::Io(e)
            }
        })
    }

    /// Read one status packet
    fn read_response(&mut self, expected_id: u8) -> Result<Vec<u8>> {
        let mut head = [0u8; 7]; // header + id + length
        self.read_exact(&mut head, expected_id)?;

        let length = u16::from_le_bytes([head[5], head[6]]) as usize;
        let mut packet = head.to_vec();
        packet.resize(head.len() + length, 0);
        self.read_exact(&mut packet[head.len()..], expected_id)?;

        Self::parse_status(expected_id, &packet)
    }

    fn address_params(register: Register, length: u16) -> Vec<u8> {
        let mut params = register.address().to_le_bytes().to_vec();
        params.extend_from_slice(&length.to_le_bytes());
        params
    }
}

impl ServoBus for DynamixelBus {
    fn ping(&mut self, id: u8) -> Result<bool> {
        let packet = Self::build_packet(id, Instruction::Ping, &[]);
        self.send_packet(&packet)?;

        match self.read_response(id) {
            Ok(_) => Ok(true),
            Err(BusError::Timeout { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn write(&mut self, id: u8, register: Register, value: u32) -> Result<()> {
        let mut params = register.address().to_le_bytes().to_vec();
        params.extend_from_slice(&le_bytes(value, register.size()));
        let packet = Self::build_packet(id, Instruction::Write, &params);
        debug!("Write to servo {}: reg={:?}, value={}", id, register, value);
        self.send_packet(&packet)?;

        // Read status response
        let _ = self.read_response(id)?;
        Ok(())
    }

    fn read(&mut self, id: u8, register: Register) -> Result<u32> {
        let size = register.size();
        let packet = Self::build_packet(id, Instruction::Read, &Self::address_params(register, size));
        self.send_packet(&packet)?;

        let response = self.read_response(id)?;
        if response.len() < size as usize {
            return Err(BusError::InvalidResponse {
                id,
                reason: format!("Expected {} bytes, got {}", size, response.len()),
            });
        }
        Ok(from_le_bytes(&response[..size as usize]))
    }

    fn sync_write(&mut self, register: Register, data: &[(u8, u32)]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        // [addr_lo, addr_hi, len_lo, len_hi, id1, data1..., id2, data2..., ...]
        let size = register.size();
        let mut params = Self::address_params(register, size);
        for &(id, value) in data {
            params.push(id);
            params.extend_from_slice(&le_bytes(value, size));
        }

        let packet = Self::build_packet(BROADCAST_ID, Instruction::SyncWrite, &params);
        debug!("Sync write to {} servos: reg={:?}", data.len(), register);
        self.send_packet(&packet)?;

        // Sync write has no response
        Ok(())
    }

    fn sync_read(&mut self, register: Register, ids: &[u8]) -> Result<Vec<u32>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let size = register.size();
        let mut params = Self::address_params(register, size);
        params.extend_from_slice(ids);

        let packet = Self::build_packet(BROADCAST_ID, Instruction::SyncRead, &params);
        debug!("Sync read from {} servos: reg={:?}", ids.len(), register);
        self.send_packet(&packet)?;

        // Each servo answers with its own status packet, in request order
        let mut values = Vec::with_capacity(ids.len());
        for &id in ids {
            let response = self.read_response(id)?;
            if response.len() < size as usize {
                return Err(BusError::InvalidResponse {
                    id,
                    reason: format!("Expected {} bytes, got {}", size, response.len()),
                });
            }
            values.push(from_le_bytes(&response[..size as usize]));
        }
        Ok(values)
    }
}
