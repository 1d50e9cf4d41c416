// Transport seam between the servo controller and the physical servo bus

/// Broadcast ID reaching every servo on the bus
pub const BROADCAST_ID: u8 = 0xFE;

/// Control table of Dynamixel X-series servos
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    // EEPROM area (write only with torque off)
    ModelNumber = 0,    // 2 bytes, read-only
    Id = 7,             // 1 byte
    BaudRate = 8,       // 1 byte
    OperatingMode = 11, // 1 byte: 1=velocity, 3=position, 4=extended position, 16=PWM

    // RAM area (volatile)
    TorqueEnable = 64,         // 1 byte: 0=off, 1=on
    HardwareErrorStatus = 70,  // 1 byte, read-only
    PositionDGain = 80,        // 2 bytes
    PositionIGain = 82,        // 2 bytes
    PositionPGain = 84,        // 2 bytes
    ProfileAcceleration = 108, // 4 bytes
    ProfileVelocity = 112,     // 4 bytes
    GoalPosition = 116,        // 4 bytes (signed)
    Moving = 122,              // 1 byte, read-only
    PresentPosition = 132,     // 4 bytes (signed), read-only
}

impl Register {
    pub fn address(self) -> u16 {
        self as u16
    }

    /// Width of the register in bytes
    pub fn size(self) -> u16 {
        match self {
            Register::Id
            | Register::BaudRate
            | Register::OperatingMode
            | Register::TorqueEnable
            | Register::HardwareErrorStatus
            | Register::Moving => 1,
            Register::ModelNumber
            | Register::PositionDGain
            | Register::PositionIGain
            | Register::PositionPGain => 2,
            Register::ProfileAcceleration
            | Register::ProfileVelocity
            | Register::GoalPosition
            | Register::PresentPosition => 4,
        }
    }
}

/// Operating modes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OperatingMode {
    Velocity = 1,
    Position = 3,
    ExtendedPosition = 4,
    Pwm = 16,
}

/// Error types for servo bus communication
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid response from servo {id}: {reason}")]
    InvalidResponse { id: u8, reason: String },

    #[error("CRC mismatch for servo {id}")]
    CrcMismatch { id: u8 },

    #[error("Servo {id} returned error status: 0x{status:02X}")]
    ServoError { id: u8, status: u8 },

    #[error("Timeout waiting for response from servo {id}")]
    Timeout { id: u8 },
}

pub type Result<T> = std::result::Result<T, BusError>;

/// Addressable, synchronous multi-servo channel
///
/// Values are passed as `u32`; registers narrower than four bytes use the low bytes.
pub trait ServoBus: Send {
    /// Checks if a servo answers. A timeout is reported as `Ok(false)`.
    fn ping(&mut self, id: u8) -> Result<bool>;

    /// Writes one register of one servo and waits for its acknowledgement
    fn write(&mut self, id: u8, register: Register, value: u32) -> Result<()>;

    /// Reads one register of one servo
    fn read(&mut self, id: u8, register: Register) -> Result<u32>;

    /// Writes one register on several servos in a single broadcast; no acknowledgement
    fn sync_write(&mut self, register: Register, data: &[(u8, u32)]) -> Result<()>;

    /// Reads one register from several servos with one request, results in `ids` order
    fn sync_read(&mut self, register: Register, ids: &[u8]) -> Result<Vec<u32>>;

    // === High-level convenience methods ===

    fn enable_torque(&mut self, id: u8) -> Result<()> {
        self.write(id, Register::TorqueEnable, 1)
    }

    fn disable_torque(&mut self, id: u8) -> Result<()> {
        self.write(id, Register::TorqueEnable, 0)
    }

    /// Set operating mode (torque must be off)
    fn set_operating_mode(&mut self, id: u8, mode: OperatingMode) -> Result<()> {
        self.write(id, Register::OperatingMode, mode as u32)
    }

    fn set_position(&mut self, id: u8, raw: i32) -> Result<()> {
        self.write(id, Register::GoalPosition, raw as u32)
    }

    fn get_position(&mut self, id: u8) -> Result<i32> {
        Ok(self.read(id, Register::PresentPosition)? as i32)
    }
}

impl<B: ServoBus + ?Sized> ServoBus for Box<B> {
    fn ping(&mut self, id: u8) -> Result<bool> {
        (**self).ping(id)
    }

    fn write(&mut self, id: u8, register: Register, value: u32) -> Result<()> {
        (**self).write(id, register, value)
    }

    fn read(&mut self, id: u8, register: Register) -> Result<u32> {
        (**self).read(id, register)
    }

    fn sync_write(&mut self, register: Register, data: &[(u8, u32)]) -> Result<()> {
        (**self).sync_write(register, data)
    }

    fn sync_read(&mut self, register: Register, ids: &[u8]) -> Result<Vec<u32>> {
        (**self).sync_read(register, ids)
    }
}
