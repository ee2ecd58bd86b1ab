//! Bus access for the CRI board
//!
//! The registers of the board live in BAR 0 of the PCIe
//! device, which the kernel exposes either as
//! /sys/bus/pci/devices/<bdf>/resource0 or, with a uio
//! driver bound, as /dev/uioN. Both can be mmapped.
//!
//! * `PciBar`       - 32bit access to a mapped window
//! * `MmapBar`      - the real thing
//! * `SimBar`       - register image in memory, for dry
//!                    runs and tests
//! * `RegisterFile` - a bank of registers at a word offset
//!                    within a BAR
//! * `UioBuffer`    - DMA target memory from a u-dma-buf
//!                    style device

extern crate memmap;

use std::error::Error;
use std::fs::{
    File,
    read_to_string,
};
use std::sync::{
    Arc,
    Mutex,
    MutexGuard,
    Weak,
};

use memmap::MmapMut;

use crate::dma::DmaBuffer;
use crate::errors::{
    CriError,
    RegisterError,
};

/// The size of a 32bit unsigned int in byte
/// (all words in registers are u32)
pub const SIZEOF_U32 : usize = 4;

/// 32bit register access to a memory mapped bus window.
///
/// Offsets are in bytes and have to be 4-byte aligned.
pub trait PciBar : Send + Sync {
  fn read_u32(&self, offset : usize) -> Result<u32, RegisterError>;
  fn write_u32(&self, offset : usize, value : u32) -> Result<(), RegisterError>;
  /// Size of the window in bytes
  fn size(&self) -> usize;
}

fn check_offset(offset : usize, size : usize) -> Result<(), RegisterError> {
  if offset % SIZEOF_U32 != 0 || offset + SIZEOF_U32 > size {
    return Err(RegisterError::OutOfBounds { offset });
  }
  Ok(())
}

/// A BAR mapped from a sysfs resource file or uio device
pub struct MmapBar {
  path : String,
  // keeps the mapping alive, all access goes through base
  _map : MmapMut,
  base : *mut u8,
  size : usize,
}

// The mapping is never moved or resized while the MmapBar
// lives, and every access is a single volatile 32bit load
// or store.
unsafe impl Send for MmapBar {}
unsafe impl Sync for MmapBar {}

impl MmapBar {

  /// Map a BAR read/write
  ///
  /// # Arguments
  ///
  /// * path : e.g. /sys/bus/pci/devices/0000:01:00.0/resource0
  /// * len  : bytes to map. If None, the size of the file
  ///          is used, which works for sysfs resources but
  ///          not for /dev/uioN
  pub fn open(path : &str, len : Option<usize>) -> Result<Self, RegisterError> {
    let file = match File::options().read(true).write(true).open(path) {
      Err(err) => {
        error!("Unable to open {}! {}", path, err);
        return Err(RegisterError::MMapFail);
      }
      Ok(f) => f
    };
    let size = match len {
      Some(l) => l,
      None    => {
        match file.metadata() {
          Err(err) => {
            error!("Unable to get size of {}! {}", path, err);
            return Err(RegisterError::MMapFail);
          }
          Ok(meta) => meta.len() as usize
        }
      }
    };
    if size == 0 {
      error!("Refusing to map zero sized BAR {}, give an explicit length!", path);
      return Err(RegisterError::MMapFail);
    }
    let mut map = match unsafe {
      memmap::MmapOptions::new()
        .len(size)
        .map_mut(&file)
    } {
      Err(err) => {
        error!("Failed to mmap {}! {:?}", path, err);
        return Err(RegisterError::MMapFail);
      }
      Ok(m) => m
    };
    let base = map.as_mut_ptr();
    info!("Mapped BAR {} with {} bytes", path, size);
    Ok(Self {
      path : String::from(path),
      _map : map,
      base : base,
      size : size,
    })
  }

  pub fn path(&self) -> &str {
    &self.path
  }
}

impl PciBar for MmapBar {
  fn read_u32(&self, offset : usize) -> Result<u32, RegisterError> {
    check_offset(offset, self.size)?;
    let value : u32;
    unsafe {
      value = std::ptr::read_volatile(self.base.add(offset) as *const u32);
    }
    Ok(value)
  }

  fn write_u32(&self, offset : usize, value : u32) -> Result<(), RegisterError> {
    check_offset(offset, self.size)?;
    unsafe {
      std::ptr::write_volatile(self.base.add(offset) as *mut u32, value);
    }
    Ok(())
  }

  fn size(&self) -> usize {
    self.size
  }
}

struct SimState {
  regs          : Vec<u32>,
  journal       : Vec<(usize, u32)>,
  self_clearing : Vec<(usize, u32)>,
  detached      : bool,
  writes_left   : Option<usize>,
}

/// A register image in memory which behaves like a BAR
///
/// Besides dry runs without hardware, this allows to
/// look at what the controller wrote (`journal`), to
/// play the hardware side (`poke_reg`) and to inject
/// bus failures (`detach`, `fail_writes_after`).
///
/// Helper methods take word addresses, the `PciBar`
/// interface byte offsets, as for the real BAR.
pub struct SimBar {
  state : Mutex<SimState>,
  size  : usize,
}

impl SimBar {
  pub fn new(n_words : usize) -> Self {
    Self {
      state : Mutex::new(SimState {
        regs          : vec![0; n_words],
        journal       : Vec::new(),
        self_clearing : Vec::new(),
        detached      : false,
        writes_left   : None,
      }),
      size  : n_words * SIZEOF_U32,
    }
  }

  fn lock(&self) -> MutexGuard<'_, SimState> {
    match self.state.lock() {
      Ok(state)    => state,
      Err(poison)  => poison.into_inner(),
    }
  }

  /// Bits in this register read back as 0 after
  /// every write, like pulse bits in the firmware
  pub fn add_self_clearing(&self, word_addr : usize, mask : u32) {
    self.lock().self_clearing.push((word_addr, mask));
  }

  /// Set a register from the "hardware" side, not journaled
  pub fn poke_reg(&self, word_addr : usize, value : u32) {
    let mut state = self.lock();
    if word_addr < state.regs.len() {
      state.regs[word_addr] = value;
    }
  }

  /// Current register content, regardless of detach state
  pub fn peek_reg(&self, word_addr : usize) -> u32 {
    let state = self.lock();
    state.regs.get(word_addr).copied().unwrap_or(0)
  }

  /// All writes so far as (word address, value written)
  pub fn journal(&self) -> Vec<(usize, u32)> {
    self.lock().journal.clone()
  }

  /// Journaled writes to a single register
  pub fn writes_to(&self, word_addr : usize) -> Vec<u32> {
    self.lock().journal.iter()
      .filter(|(addr, _)| *addr == word_addr)
      .map(|(_, value)| *value)
      .collect()
  }

  pub fn clear_journal(&self) {
    self.lock().journal.clear();
  }

  /// Every access fails with RegisterError::Detached
  pub fn detach(&self) {
    self.lock().detached = true;
  }

  pub fn attach(&self) {
    self.lock().detached = false;
  }

  /// Let n more writes go through, then fail every
  /// write with RegisterError::WriteFault. None lifts it.
  pub fn fail_writes_after(&self, n : Option<usize>) {
    self.lock().writes_left = n;
  }
}

impl PciBar for SimBar {
  fn read_u32(&self, offset : usize) -> Result<u32, RegisterError> {
    check_offset(offset, self.size)?;
    let state = self.lock();
    if state.detached {
      return Err(RegisterError::Detached);
    }
    Ok(state.regs[offset / SIZEOF_U32])
  }

  fn write_u32(&self, offset : usize, value : u32) -> Result<(), RegisterError> {
    check_offset(offset, self.size)?;
    let mut state = self.lock();
    if state.detached {
      return Err(RegisterError::Detached);
    }
    let writes_left = state.writes_left;
    match writes_left {
      Some(0) => return Err(RegisterError::WriteFault),
      Some(n) => state.writes_left = Some(n - 1),
      None    => ()
    }
    let word_addr = offset / SIZEOF_U32;
    let clear : u32 = state.self_clearing.iter()
      .filter(|(addr, _)| *addr == word_addr)
      .fold(0, |acc, (_, mask)| acc | mask);
    state.regs[word_addr] = value & !clear;
    state.journal.push((word_addr, value));
    Ok(())
  }

  fn size(&self) -> usize {
    self.size
  }
}

/// A bank of registers within a BAR
///
/// Registers are given as word offsets relative to the
/// base of the bank. The register file does not keep the
/// BAR alive, once the owning device is gone every access
/// fails with `RegisterError::Detached`.
#[derive(Clone)]
pub struct RegisterFile {
  bar  : Weak<dyn PciBar>,
  base : usize,
}

impl RegisterFile {
  pub fn new(bar : &Arc<dyn PciBar>, base : usize) -> Self {
    Self {
      bar  : Arc::downgrade(bar),
      base : base,
    }
  }

  /// Word address of the bank
  pub fn base(&self) -> usize {
    self.base
  }

  fn bar(&self) -> Result<Arc<dyn PciBar>, RegisterError> {
    self.bar.upgrade().ok_or(RegisterError::Detached)
  }

  fn offset(&self, reg : usize) -> usize {
    (self.base + reg) * SIZEOF_U32
  }

  pub fn get_reg(&self, reg : usize) -> Result<u32, RegisterError> {
    self.bar()?.read_u32(self.offset(reg))
  }

  /// Write only the bits in mask, the others keep
  /// their current value
  pub fn set_reg(&self, reg : usize, value : u32, mask : u32) -> Result<(), RegisterError> {
    let bar = self.bar()?;
    let offset = self.offset(reg);
    let new_value = if mask == u32::MAX {
      value
    } else {
      let current = bar.read_u32(offset)?;
      (current & !mask) | (value & mask)
    };
    trace!("Writing 0x{:08x} to register 0x{:x} (mask 0x{:08x})", new_value, self.base + reg, mask);
    bar.write_u32(offset, new_value)
  }

  pub fn set_reg_full(&self, reg : usize, value : u32) -> Result<(), RegisterError> {
    self.set_reg(reg, value, u32::MAX)
  }

  pub fn set_bit(&self, reg : usize, pos : u32, enable : bool) -> Result<(), RegisterError> {
    let mask = 1u32 << pos;
    let value = if enable { mask } else { 0 };
    self.set_reg(reg, value, mask)
  }

  pub fn get_bit(&self, reg : usize, pos : u32) -> Result<bool, RegisterError> {
    let value = self.get_reg(reg)?;
    Ok((value >> pos) & 0x1 == 1)
  }

  /// Write a 64bit value into a pair of registers, low word first
  pub fn set_reg_u64(&self, reg_l : usize, reg_h : usize, value : u64) -> Result<(), RegisterError> {
    self.set_reg_full(reg_l, value as u32)?;
    self.set_reg_full(reg_h, (value >> 32) as u32)
  }

  pub fn get_reg_u64(&self, reg_l : usize, reg_h : usize) -> Result<u64, RegisterError> {
    let lsb = self.get_reg(reg_l)?;
    let msb = self.get_reg(reg_h)?;
    Ok((msb as u64) << 32 | lsb as u64)
  }
}

/// Read a value the u-dma-buf driver exposes in sysfs,
/// decimal or 0x prefixed hex
fn read_sysfs_number(path : &str) -> Result<u64, Box<dyn Error>> {
  let content = read_to_string(path)?;
  let content = content.trim();
  let value = match content.strip_prefix("0x") {
    Some(hex) => u64::from_str_radix(hex, 16)?,
    None      => content.parse::<u64>()?
  };
  Ok(value)
}

/// DMA target memory provided by a u-dma-buf style driver
///
/// The driver allocates physically contiguous memory,
/// exposes it as /dev/udmabufN and publishes its bus
/// address and size in /sys/class/u-dma-buf/udmabufN.
///
/// The buffer has to outlive every DMA channel which
/// was given its `DmaBuffer` handle.
pub struct UioBuffer {
  dev      : String,
  map      : MmapMut,
  bus_addr : u64,
  size     : usize,
}

impl UioBuffer {

  /// # Arguments
  ///
  /// * dev       : e.g. /dev/udmabuf0
  /// * sysfs_dir : e.g. /sys/class/u-dma-buf/udmabuf0
  pub fn open(dev : &str, sysfs_dir : &str) -> Result<Self, Box<dyn Error>> {
    let bus_addr = read_sysfs_number(&format!("{}/phys_addr", sysfs_dir))?;
    let size     = read_sysfs_number(&format!("{}/size", sysfs_dir))? as usize;
    if !size.is_power_of_two() {
      error!("Buffer {} has size {}, which is not a power of two!", dev, size);
      return Err(Box::new(CriError::BufferSizeNotPowerOfTwo(size as u64)));
    }
    let map = unsafe {
      memmap::MmapOptions::new()
        .len(size)
        .map_mut(&File::options()
          .read(true)
          .write(true)
          .open(dev)?)?
    };
    debug!("Mapped DMA buffer {} at bus address 0x{:x}, {} bytes", dev, bus_addr, size);
    Ok(Self {
      dev      : String::from(dev),
      map      : map,
      bus_addr : bus_addr,
      size     : size,
    })
  }

  pub fn dev(&self) -> &str {
    &self.dev
  }

  /// The handle to hand to `CriLink::init_dma`
  pub fn as_dma_buffer(&self) -> DmaBuffer {
    DmaBuffer {
      bus_addr : self.bus_addr,
      log_size : self.size.trailing_zeros(),
    }
  }

  /// The buffer content as the DMA engine left it
  pub fn as_slice(&self) -> &[u8] {
    &self.map[..]
  }
}
