// In-memory servo bus for dry runs and tests
//
// Servos are ideal: with torque on, the present position jumps to the goal position.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use super::bus::{BusError, Register, Result, ServoBus};

/// Operation recorded by the simulated bus
#[derive(Debug, Clone, PartialEq)]
pub enum BusOp {
    Ping { id: u8 },
    Write { id: u8, register: Register, value: u32 },
    Read { id: u8, register: Register },
    SyncWrite { register: Register, data: Vec<(u8, u32)> },
    SyncRead { register: Register, ids: Vec<u8> },
}

#[derive(Debug, Default)]
pub struct SimulatedBus {
    servos: HashSet<u8>,
    offline: HashSet<u8>,
    registers: HashMap<(u8, u16), u32>,
    log: Vec<BusOp>,
}

impl SimulatedBus {
    /// Bus with the given servos attached, all at raw position 0
    pub fn new(ids: &[u8]) -> Self {
        Self {
            servos: ids.iter().copied().collect(),
            ..Self::default()
        }
    }

    /// Bus with servos resting at the given raw positions
    pub fn with_positions(positions: &[(u8, i32)]) -> Self {
        let ids: Vec<u8> = positions.iter().map(|&(id, _)| id).collect();
        let mut bus = Self::new(&ids);
        for &(id, raw) in positions {
            bus.registers
                .insert((id, Register::PresentPosition.address()), raw as u32);
        }
        bus
    }

    /// Simulates an unplugged or unresponsive servo
    pub fn set_offline(&mut self, id: u8, offline: bool) {
        if offline {
            self.offline.insert(id);
        } else {
            self.offline.remove(&id);
        }
    }

    pub fn register(&self, id: u8, register: Register) -> u32 {
        self.registers
            .get(&(id, register.address()))
            .copied()
            .unwrap_or(0)
    }

    pub fn log(&self) -> &[BusOp] {
        &self.log
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
    }

    /// All broadcast writes to `register`, oldest first
    pub fn sync_writes(&self, register: Register) -> Vec<&[(u8, u32)]> {
        self.log
            .iter()
            .filter_map(|op| match op {
                BusOp::SyncWrite { register: r, data } if *r == register => Some(data.as_slice()),
                _ => None,
            })
            .collect()
    }

    fn responds(&self, id: u8) -> bool {
        self.servos.contains(&id) && !self.offline.contains(&id)
    }

    fn store(&mut self, id: u8, register: Register, value: u32) {
        self.registers.insert((id, register.address()), value);
        if register == Register::GoalPosition && self.register(id, Register::TorqueEnable) == 1 {
            self.registers
                .insert((id, Register::PresentPosition.address()), value);
        }
    }
}

impl ServoBus for SimulatedBus {
    fn ping(&mut self, id: u8) -> Result<bool> {
        self.log.push(BusOp::Ping { id });
        Ok(self.responds(id))
    }

    fn write(&mut self, id: u8, register: Register, value: u32) -> Result<()> {
        self.log.push(BusOp::Write { id, register, value });
        if !self.responds(id) {
            return Err(BusError::Timeout { id });
        }
        self.store(id, register, value);
        Ok(())
    }

    fn read(&mut self, id: u8, register: Register) -> Result<u32> {
        self.log.push(BusOp::Read { id, register });
        if !self.responds(id) {
            return Err(BusError::Timeout { id });
        }
        Ok(self.register(id, register))
    }

    fn sync_write(&mut self, register: Register, data: &[(u8, u32)]) -> Result<()> {
        debug!("Simulated sync write to {} servos: reg={:?}", data.len(), register);
        self.log.push(BusOp::SyncWrite {
            register,
            data: data.to_vec(),
        });
        // Broadcast: servos that are not listening simply miss it
        for &(id, value) in data {
            if self.responds(id) {
                self.store(id, register, value);
            }
        }
        Ok(())
    }

    fn sync_read(&mut self, register: Register, ids: &[u8]) -> Result<Vec<u32>> {
        self.log.push(BusOp::SyncRead {
            register,
            ids: ids.to_vec(),
        });
        ids.iter()
            .map(|&id| {
                if self.responds(id) {
                    Ok(self.register(id, register))
                } else {
                    Err(BusError::Timeout { id })
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_goal_follows_only_with_torque() {
        let mut bus = SimulatedBus::with_positions(&[(1, 100)]);
        bus.write(1, Register::GoalPosition, 500).unwrap();
        assert_eq!(bus.get_position(1).unwrap(), 100);

        bus.enable_torque(1).unwrap();
        bus.sync_write(Register::GoalPosition, &[(1, 700)]).unwrap();
        assert_eq!(bus.get_position(1).unwrap(), 700);
    }

    #[test]
    fn test_offline_servo_times_out() {
        let mut bus = SimulatedBus::new(&[1, 2]);
        bus.set_offline(2, true);
        assert!(!bus.ping(2).unwrap());
        assert!(matches!(
            bus.sync_read(Register::PresentPosition, &[1, 2]),
            Err(BusError::Timeout { id: 2 })
        ));
        assert!(matches!(bus.read(9, Register::Moving), Err(BusError::Timeout { id: 9 })));
    }
}
