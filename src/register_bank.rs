/// Modbus register bank for server-side data storage
///
/// This module provides thread-safe storage for the four Modbus block types:
/// coils, discrete inputs, holding registers, and input registers. Each block
/// is a fixed-length, zero-initialized sequence of cells with 0-based
/// addressing; every access is bounds-checked against the block length.

use std::ops::Range;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{ModbusError, ModbusResult};

/// The four independently addressed Modbus data blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockType {
    /// Read/write bits
    Coils,
    /// Read-only bits (from a client's point of view)
    DiscreteInputs,
    /// Read/write 16-bit registers
    HoldingRegisters,
    /// Read-only 16-bit registers (from a client's point of view)
    InputRegisters,
}

/// Cell values read from or written to a block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellValues {
    Bits(Vec<bool>),
    Registers(Vec<u16>),
}

impl CellValues {
    /// Number of cells
    pub fn len(&self) -> usize {
        match self {
            CellValues::Bits(bits) => bits.len(),
            CellValues::Registers(registers) => registers.len(),
        }
    }

    /// Check if there are no cells
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fixed-length block of cells
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterBlock<T> {
    cells: Vec<T>,
}

impl<T: Copy + Default + PartialEq> RegisterBlock<T> {
    /// Create a zero-initialized block of `len` cells
    pub fn new(len: usize) -> Self {
        Self {
            cells: vec![T::default(); len],
        }
    }

    /// Block length
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Check if the block has no cells
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Number of cells holding a non-default value
    pub fn active_count(&self) -> usize {
        self.cells.iter().filter(|&&cell| cell != T::default()).count()
    }

    fn range(&self, address: u16, count: usize) -> ModbusResult<Range<usize>> {
        let start = usize::from(address);
        let end = start + count;
        if count == 0 || end > self.cells.len() {
            let count = u16::try_from(count).unwrap_or(u16::MAX);
            return Err(ModbusError::invalid_address(address, count));
        }
        Ok(start..end)
    }

    /// Read `count` cells starting at `address`
    pub fn read(&self, address: u16, count: u16) -> ModbusResult<Vec<T>> {
        let range = self.range(address, usize::from(count))?;
        Ok(self.cells[range].to_vec())
    }

    /// Overwrite cells starting at `address`
    ///
    /// Nothing is written if the range is out of bounds.
    pub fn write(&mut self, address: u16, values: &[T]) -> ModbusResult<()> {
        let range = self.range(address, values.len())?;
        self.cells[range].copy_from_slice(values);
        Ok(())
    }

    /// Replace the cell at `address` with `update(current)` and return the new value
    pub fn update<F>(&mut self, address: u16, update: F) -> ModbusResult<T>
    where
        F: FnOnce(T) -> T,
    {
        let index = self.range(address, 1)?.start;
        let value = update(self.cells[index]);
        self.cells[index] = value;
        Ok(value)
    }
}

#[derive(Debug)]
struct DataBlocks {
    coils: RegisterBlock<bool>,
    discrete_inputs: RegisterBlock<bool>,
    holding_registers: RegisterBlock<u16>,
    input_registers: RegisterBlock<u16>,
}

/// Modbus register bank for storing coils, discrete inputs, holding registers, and input registers
///
/// All four blocks sit behind one lock, so a multi-cell write is never
/// observed half-applied by a concurrent reader. Clones share the same
/// storage.
#[derive(Debug, Clone)]
pub struct ModbusRegisterBank {
    blocks: Arc<RwLock<DataBlocks>>,
    block_size: usize,
}

impl ModbusRegisterBank {
    /// Create a register bank with `block_size` cells per block
    pub fn new(block_size: usize) -> Self {
        Self {
            blocks: Arc::new(RwLock::new(DataBlocks {
                coils: RegisterBlock::new(block_size),
                discrete_inputs: RegisterBlock::new(block_size),
                holding_registers: RegisterBlock::new(block_size),
                input_registers: RegisterBlock::new(block_size),
            })),
            block_size,
        }
    }

    /// Number of cells in each block
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    fn lock_read(&self) -> ModbusResult<RwLockReadGuard<'_, DataBlocks>> {
        self.blocks.read().map_err(|_| ModbusError::internal("Failed to lock register bank"))
    }

    fn lock_write(&self) -> ModbusResult<RwLockWriteGuard<'_, DataBlocks>> {
        self.blocks.write().map_err(|_| ModbusError::internal("Failed to lock register bank"))
    }

    /// Read `count` cells of `block` starting at `address`
    pub fn read(&self, block: BlockType, address: u16, count: u16) -> ModbusResult<CellValues> {
        let blocks = self.lock_read()?;
        let values = match block {
            BlockType::Coils => CellValues::Bits(blocks.coils.read(address, count)?),
            BlockType::DiscreteInputs => CellValues::Bits(blocks.discrete_inputs.read(address, count)?),
            BlockType::HoldingRegisters => CellValues::Registers(blocks.holding_registers.read(address, count)?),
            BlockType::InputRegisters => CellValues::Registers(blocks.input_registers.read(address, count)?),
        };
        Ok(values)
    }

    /// Write cells of `block` starting at `address`
    ///
    /// Bit values must target a bit block and register values a register block.
    pub fn write(&self, block: BlockType, address: u16, values: &CellValues) -> ModbusResult<()> {
        let mut blocks = self.lock_write()?;
        match (block, values) {
            (BlockType::Coils, CellValues::Bits(bits)) => blocks.coils.write(address, bits),
            (BlockType::DiscreteInputs, CellValues::Bits(bits)) => blocks.discrete_inputs.write(address, bits),
            (BlockType::HoldingRegisters, CellValues::Registers(registers)) => {
                blocks.holding_registers.write(address, registers)
            }
            (BlockType::InputRegisters, CellValues::Registers(registers)) => {
                blocks.input_registers.write(address, registers)
            }
            (block, _) => Err(ModbusError::invalid_data(format!(
                "Cell type does not match block {:?}",
                block
            ))),
        }
    }

    /// Read coils starting at address (function code 0x01)
    pub fn read_coils(&self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        self.lock_read()?.coils.read(address, quantity)
    }

    /// Read discrete inputs starting at address (function code 0x02)
    pub fn read_discrete_inputs(&self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        self.lock_read()?.discrete_inputs.read(address, quantity)
    }

    /// Read holding registers starting at address (function code 0x03)
    pub fn read_holding_registers(&self, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        self.lock_read()?.holding_registers.read(address, quantity)
    }

    /// Read input registers starting at address (function code 0x04)
    pub fn read_input_registers(&self, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        self.lock_read()?.input_registers.read(address, quantity)
    }

    /// Write coils (function codes 0x05 and 0x0F)
    pub fn write_coils(&self, address: u16, values: &[bool]) -> ModbusResult<()> {
        self.lock_write()?.coils.write(address, values)
    }

    /// Write holding registers (function codes 0x06 and 0x10)
    pub fn write_holding_registers(&self, address: u16, values: &[u16]) -> ModbusResult<()> {
        self.lock_write()?.holding_registers.write(address, values)
    }

    /// Read-modify-write one holding register under a single lock
    ///
    /// No client write can land between the read and the write. Returns the
    /// value stored.
    pub fn update_holding_register<F>(&self, address: u16, update: F) -> ModbusResult<u16>
    where
        F: FnOnce(u16) -> u16,
    {
        self.lock_write()?.holding_registers.update(address, update)
    }

    /// Set discrete input values (for simulation/testing)
    pub fn set_discrete_inputs(&self, address: u16, values: &[bool]) -> ModbusResult<()> {
        self.lock_write()?.discrete_inputs.write(address, values)
    }

    /// Set input register values (for simulation/testing)
    pub fn set_input_registers(&self, address: u16, values: &[u16]) -> ModbusResult<()> {
        self.lock_write()?.input_registers.write(address, values)
    }

    /// Get register bank statistics
    pub fn get_stats(&self) -> ModbusResult<RegisterBankStats> {
        let blocks = self.lock_read()?;
        Ok(RegisterBankStats {
            block_size: self.block_size,
            active_coils: blocks.coils.active_count(),
            active_discrete_inputs: blocks.discrete_inputs.active_count(),
            active_holding_registers: blocks.holding_registers.active_count(),
            active_input_registers: blocks.input_registers.active_count(),
        })
    }
}

impl Default for ModbusRegisterBank {
    fn default() -> Self {
        Self::new(crate::DEFAULT_BLOCK_SIZE)
    }
}

/// Register bank statistics: block size and the number of non-zero cells per block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterBankStats {
    pub block_size: usize,
    pub active_coils: usize,
    pub active_discrete_inputs: usize,
    pub active_holding_registers: usize,
    pub active_input_registers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coil_operations() {
        let bank = ModbusRegisterBank::new(100);

        bank.write_coils(10, &[true]).unwrap();
        assert_eq!(bank.read_coils(10, 1).unwrap(), vec![true]);

        bank.write_coils(20, &[true, false, true]).unwrap();
        assert_eq!(bank.read_coils(20, 3).unwrap(), vec![true, false, true]);
    }

    #[test]
    fn test_register_operations() {
        let bank = ModbusRegisterBank::new(100);

        bank.write_holding_registers(5, &[42]).unwrap();
        assert_eq!(bank.read_holding_registers(5, 1).unwrap(), vec![42]);

        bank.write_holding_registers(97, &[100, 200, 300]).unwrap();
        assert_eq!(bank.read_holding_registers(97, 3).unwrap(), vec![100, 200, 300]);
    }

    #[test]
    fn test_fresh_bank_is_zeroed() {
        let bank = ModbusRegisterBank::default();
        assert_eq!(bank.block_size(), 100);
        assert_eq!(bank.read_input_registers(0, 100).unwrap(), vec![0u16; 100]);
        assert_eq!(bank.read_discrete_inputs(0, 100).unwrap(), vec![false; 100]);
    }

    #[test]
    fn test_write_then_read_every_block() {
        let bank = ModbusRegisterBank::new(100);
        let cases = [
            (BlockType::Coils, CellValues::Bits(vec![true, false, true, true])),
            (BlockType::DiscreteInputs, CellValues::Bits(vec![false, true])),
            (BlockType::HoldingRegisters, CellValues::Registers(vec![1, 0xFFFF, 3])),
            (BlockType::InputRegisters, CellValues::Registers(vec![0x8000])),
        ];

        for (block, values) in cases {
            bank.write(block, 96, &values).unwrap();
            assert_eq!(bank.read(block, 96, values.len() as u16).unwrap(), values);
        }
    }

    #[test]
    fn test_out_of_bounds_access_is_rejected() {
        let bank = ModbusRegisterBank::new(100);
        bank.write_holding_registers(98, &[7, 8]).unwrap();

        assert_eq!(
            bank.read(BlockType::Coils, 50, 60).unwrap_err(),
            ModbusError::invalid_address(50, 60)
        );
        assert!(bank.read_holding_registers(100, 1).is_err());
        assert!(bank.read_holding_registers(0, 0).is_err());

        // a failing write must not touch the in-bounds cells
        assert!(bank.write_holding_registers(98, &[1, 2, 3]).is_err());
        assert_eq!(bank.read_holding_registers(98, 2).unwrap(), vec![7, 8]);
    }

    #[test]
    fn test_mismatched_cell_type() {
        let bank = ModbusRegisterBank::new(10);
        let err = bank
            .write(BlockType::HoldingRegisters, 0, &CellValues::Bits(vec![true]))
            .unwrap_err();
        assert!(matches!(err, ModbusError::InvalidData { .. }));
    }

    #[test]
    fn test_clones_share_storage() {
        let bank = ModbusRegisterBank::new(10);
        let other = bank.clone();
        other.set_input_registers(3, &[99]).unwrap();
        assert_eq!(bank.read_input_registers(3, 1).unwrap(), vec![99]);

        let stats = bank.get_stats().unwrap();
        assert_eq!(stats.active_input_registers, 1);
        assert_eq!(stats.active_coils, 0);
    }

    #[test]
    fn test_multi_register_writes_are_never_torn() {
        let bank = ModbusRegisterBank::new(100);
        let writer = bank.clone();

        let handle = std::thread::spawn(move || {
            for i in 0..2000u16 {
                writer.write_holding_registers(0, &[i; 10]).unwrap();
            }
        });

        for _ in 0..2000 {
            let values = bank.read_holding_registers(0, 10).unwrap();
            assert!(values.iter().all(|&v| v == values[0]), "torn read: {:?}", values);
        }

        handle.join().unwrap();
    }

    #[test]
    fn test_update_holding_register() {
        let bank = ModbusRegisterBank::new(10);
        bank.write_holding_registers(3, &[41]).unwrap();

        assert_eq!(bank.update_holding_register(3, |v| v + 1).unwrap(), 42);
        assert_eq!(bank.read_holding_registers(3, 1).unwrap(), vec![42]);

        assert!(matches!(
            bank.update_holding_register(10, |v| v + 1),
            Err(ModbusError::InvalidAddress { start: 10, count: 1 })
        ));
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let bank = ModbusRegisterBank::new(10);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let bank = bank.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        bank.update_holding_register(0, |v| v + 1).unwrap();
                    }
                })
            })
            .collect();

        for _ in 0..1000 {
            bank.write_holding_registers(1, &[7]).unwrap();
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(bank.read_holding_registers(0, 2).unwrap(), vec![4000, 7]);
    }

    #[test]
    fn test_poisoned_bank_reports_internal_error() {
        let bank = ModbusRegisterBank::new(10);
        let poisoner = bank.clone();

        let result = std::thread::spawn(move || {
            let _ = poisoner.update_holding_register(0, |_| panic!("update failed"));
        })
        .join();
        assert!(result.is_err());

        assert!(matches!(
            bank.read_holding_registers(0, 1),
            Err(ModbusError::Internal { .. })
        ));
    }
}
